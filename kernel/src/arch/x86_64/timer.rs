// Monotonic tick counter fed by the PIT interrupt

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn record_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since boot, derived from the tick rate.
pub fn uptime_ms() -> u64 {
    #[cfg(target_os = "none")]
    let hz = super::pit::TICK_HZ as u64;
    #[cfg(not(target_os = "none"))]
    let hz = 100;
    ticks() * 1000 / hz
}
