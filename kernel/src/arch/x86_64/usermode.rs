//! First entry to Ring 3
//!
//! `enter_usermode` performs the one transition `task_restore` cannot: a
//! privilege-level change. It loads the task's CR3, points the data
//! segments at user data, builds the iretq frame (SS=0x23, RSP, RFLAGS
//! with IF, CS=0x2B, RIP) and executes `iretq`.

use core::arch::asm;

/// User-mode selectors with RPL 3, fixed by the GDT layout.
pub const USER_CS: u64 = 0x2B;
pub const USER_SS: u64 = 0x23;

/// Enter user mode for the first time. Never returns.
///
/// # Safety
///
/// - `entry` must point at mapped, executable user code under `cr3`
/// - `user_rsp` must be a mapped, 16-byte-aligned user stack top
/// - `TSS.rsp0` must already hold this task's kernel stack so the first
///   interrupt or syscall lands on a valid stack
pub unsafe fn enter_usermode(entry: u64, user_rsp: u64, cr3: u64) -> ! {
    // SAFETY: caller upholds the mapping and TSS preconditions; the
    // RFLAGS image (0x202) enables interrupts the instant user code runs.
    unsafe {
        asm!(
            "mov cr3, {cr3}",
            "mov ds, {ss:r}",
            "mov es, {ss:r}",
            "mov fs, {zero:x}",
            "mov gs, {zero:x}",
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "iretq",
            cr3 = in(reg) cr3,
            ss = in(reg) USER_SS,
            rsp = in(reg) user_rsp,
            rflags = in(reg) 0x202u64,
            cs = in(reg) USER_CS,
            rip = in(reg) entry,
            zero = in(reg) 0u64,
            options(noreturn)
        );
    }
}
