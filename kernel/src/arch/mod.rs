// Architecture support

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Halt forever; the landing pad for fatal exceptions and panic.
pub fn halt() -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    loop {
        ::x86_64::instructions::interrupts::disable();
        ::x86_64::instructions::hlt();
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    loop {
        core::hint::spin_loop();
    }
}

/// Wait for the next interrupt with IF set. Blocking waits inside
/// syscalls go through here: interrupts are only ever enabled in kernel
/// mode while waiting, so the timer can preempt the wait but never a
/// critical section.
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::interrupts::enable_and_hlt();
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    core::hint::spin_loop();
}
