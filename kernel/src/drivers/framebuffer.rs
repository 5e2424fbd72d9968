//! Boot framebuffer record
//!
//! Captures the geometry the bootloader hands over (32 bpp assumed). The
//! text renderer sits outside the core; the record is kept so it can
//! attach later and so diagnostics can report the mode.

use core::sync::atomic::{AtomicU64, Ordering};

/// Framebuffer geometry from the boot-info record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub base: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

static BASE: AtomicU64 = AtomicU64::new(0);
static GEOMETRY: AtomicU64 = AtomicU64::new(0);
static STRIDE: AtomicU64 = AtomicU64::new(0);

pub fn record(info: FramebufferInfo) {
    BASE.store(info.base, Ordering::Relaxed);
    GEOMETRY.store((info.width as u64) << 32 | info.height as u64, Ordering::Relaxed);
    STRIDE.store(info.stride as u64, Ordering::Relaxed);
    log::info!(
        "fb: {}x{} stride {} at {:#x}",
        info.width,
        info.height,
        info.stride,
        info.base
    );
}

pub fn info() -> Option<FramebufferInfo> {
    let base = BASE.load(Ordering::Relaxed);
    if base == 0 {
        return None;
    }
    let geometry = GEOMETRY.load(Ordering::Relaxed);
    Some(FramebufferInfo {
        base,
        width: (geometry >> 32) as u32,
        height: geometry as u32,
        stride: STRIDE.load(Ordering::Relaxed) as u32,
    })
}
