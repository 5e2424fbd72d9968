//! Register context and the two switch primitives
//!
//! The context layout is fixed once here and consumed by the assembly
//! stubs, the scheduler, and the syscall dispatcher alike. Offsets in the
//! asm below mirror the field order of [`Context`]; changing one without
//! the other corrupts every task.

/// Saved register state of a task: 16 GPRs plus RIP, RFLAGS and CR3.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub rax: u64,    // 0x00
    pub rbx: u64,    // 0x08
    pub rcx: u64,    // 0x10
    pub rdx: u64,    // 0x18
    pub rsi: u64,    // 0x20
    pub rdi: u64,    // 0x28
    pub rbp: u64,    // 0x30
    pub rsp: u64,    // 0x38
    pub r8: u64,     // 0x40
    pub r9: u64,     // 0x48
    pub r10: u64,    // 0x50
    pub r11: u64,    // 0x58
    pub r12: u64,    // 0x60
    pub r13: u64,    // 0x68
    pub r14: u64,    // 0x70
    pub r15: u64,    // 0x78
    pub rip: u64,    // 0x80
    pub rflags: u64, // 0x88
    pub cr3: u64,    // 0x90
}

/// RFLAGS for a fresh task: IF plus the always-one reserved bit.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// The on-stack frame the interrupt and `int 0x80` stubs build: fifteen
/// GPR pushes below the five words the CPU pushed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // Hardware-pushed interrupt frame
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Capture this frame into a task context; CR3 is supplied by the
    /// caller (read before any address-space change).
    pub fn save_into(&self, ctx: &mut Context, cr3: u64) {
        *ctx = Context {
            rax: self.rax,
            rbx: self.rbx,
            rcx: self.rcx,
            rdx: self.rdx,
            rsi: self.rsi,
            rdi: self.rdi,
            rbp: self.rbp,
            rsp: self.rsp,
            r8: self.r8,
            r9: self.r9,
            r10: self.r10,
            r11: self.r11,
            r12: self.r12,
            r13: self.r13,
            r14: self.r14,
            r15: self.r15,
            rip: self.rip,
            rflags: self.rflags,
            cr3,
        };
    }
}

/// Cooperative switch: capture the callee-saved state of the caller into
/// `old` (caller-saved registers are dead across the call by ABI) and
/// resume `new` through [`task_restore`]. Returns when `old` is next
/// scheduled.
///
/// # Safety
///
/// Both pointers must reference task contexts in the task table; `new`
/// must describe a resumable task (valid stack, RIP, CR3).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[unsafe(naked)]
pub unsafe extern "C" fn task_switch(_old: *mut Context, _new: *const Context) {
    core::arch::naked_asm!(
        // Callee-saved registers into old (rdi).
        "mov [rdi + 0x08], rbx",
        "mov [rdi + 0x30], rbp",
        "mov [rdi + 0x60], r12",
        "mov [rdi + 0x68], r13",
        "mov [rdi + 0x70], r14",
        "mov [rdi + 0x78], r15",
        // Resume point: our own return address, stack above it.
        "mov rax, [rsp]",
        "mov [rdi + 0x80], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x38], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x88], rax",
        "mov rax, cr3",
        "mov [rdi + 0x90], rax",
        // Tail into the full restore of new.
        "mov rdi, rsi",
        "jmp {restore}",
        restore = sym task_restore,
    );
}

/// Resume a task from its saved context: reload CR3 (skipping the write
/// when unchanged), switch to the saved stack, restore RFLAGS and all
/// GPRs, and `ret` to the saved RIP.
///
/// # Safety
///
/// The context must describe a resumable task. Never returns to the
/// caller.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[unsafe(naked)]
pub unsafe extern "C" fn task_restore(_ctx: *const Context) -> ! {
    core::arch::naked_asm!(
        // Address space first; skip the TLB-shooting write when identical.
        "mov rax, [rdi + 0x90]",
        "mov rcx, cr3",
        "cmp rax, rcx",
        "je 2f",
        "mov cr3, rax",
        "2:",
        // Target stack, with RIP and RFLAGS staged on it.
        "mov rsp, [rdi + 0x38]",
        "push qword ptr [rdi + 0x80]",
        "push qword ptr [rdi + 0x88]",
        // General-purpose registers, rdi last.
        "mov rax, [rdi + 0x00]",
        "mov rbx, [rdi + 0x08]",
        "mov rcx, [rdi + 0x10]",
        "mov rdx, [rdi + 0x18]",
        "mov rsi, [rdi + 0x20]",
        "mov rbp, [rdi + 0x30]",
        "mov r8,  [rdi + 0x40]",
        "mov r9,  [rdi + 0x48]",
        "mov r10, [rdi + 0x50]",
        "mov r11, [rdi + 0x58]",
        "mov r12, [rdi + 0x60]",
        "mov r13, [rdi + 0x68]",
        "mov r14, [rdi + 0x70]",
        "mov r15, [rdi + 0x78]",
        "mov rdi, [rdi + 0x28]",
        // RFLAGS immediately before the ret keeps the IF-on window to a
        // single instruction.
        "popfq",
        "ret",
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn context_layout_matches_asm_offsets() {
        assert_eq!(core::mem::offset_of!(Context, rbx), 0x08);
        assert_eq!(core::mem::offset_of!(Context, rdi), 0x28);
        assert_eq!(core::mem::offset_of!(Context, rsp), 0x38);
        assert_eq!(core::mem::offset_of!(Context, r15), 0x78);
        assert_eq!(core::mem::offset_of!(Context, rip), 0x80);
        assert_eq!(core::mem::offset_of!(Context, rflags), 0x88);
        assert_eq!(core::mem::offset_of!(Context, cr3), 0x90);
    }

    #[test]
    fn trap_frame_capture_is_complete() {
        let frame = TrapFrame {
            r15: 15,
            r14: 14,
            r13: 13,
            r12: 12,
            r11: 11,
            r10: 10,
            r9: 9,
            r8: 8,
            rbp: 7,
            rdi: 6,
            rsi: 5,
            rdx: 4,
            rcx: 3,
            rbx: 2,
            rax: 1,
            rip: 0x400000,
            cs: 0x2B,
            rflags: INITIAL_RFLAGS,
            rsp: 0x7FFF_F000,
            ss: 0x23,
        };
        let mut ctx = Context::default();
        frame.save_into(&mut ctx, 0xABC000);
        assert_eq!(ctx.rax, 1);
        assert_eq!(ctx.r15, 15);
        assert_eq!(ctx.rip, 0x400000);
        assert_eq!(ctx.rsp, 0x7FFF_F000);
        assert_eq!(ctx.cr3, 0xABC000);
    }
}
