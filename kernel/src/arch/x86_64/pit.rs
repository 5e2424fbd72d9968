// Programmable Interval Timer (channel 0, rate generator)

use x86_64::instructions::port::Port;

/// Tick rate the scheduler preempts at.
pub const TICK_HZ: u32 = 100;

const PIT_FREQUENCY: u32 = 1_193_182;

/// Program channel 0 and enable interrupts; the first tick arrives one
/// period later on vector 0x20.
pub fn start() {
    let divisor = (PIT_FREQUENCY / TICK_HZ) as u16;
    let mut command: Port<u8> = Port::new(0x43);
    let mut channel0: Port<u8> = Port::new(0x40);
    // SAFETY: channel 0, lobyte/hibyte access, mode 2 (rate generator);
    // these ports are owned by this module.
    unsafe {
        command.write(0x34);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
    x86_64::instructions::interrupts::enable();
    log::info!("pit: {} Hz tick started", TICK_HZ);
}
