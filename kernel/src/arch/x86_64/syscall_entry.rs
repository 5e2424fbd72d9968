//! Syscall entry points
//!
//! Two doors into the same dispatcher: the `int 0x80` trap gate (DPL 3)
//! and the `syscall` instruction. Both build the canonical [`TrapFrame`]
//! so the dispatcher and the scheduler agree on one layout.
//!
//! The `syscall` MSR setup picks STAR so that SYSRET returns to the
//! 64-bit user segments: SS = STAR[63:48] + 8 = 0x23, CS = STAR[63:48] +
//! 16 = 0x2B, anchored on the 32-bit user code slot at 0x18.

use core::sync::atomic::AtomicU64;

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::VirtAddr;

use super::context::TrapFrame;
use super::usermode::{USER_CS, USER_SS};

/// Kernel stack for the `syscall` fast path; kept in sync with TSS.rsp0
/// at every user-mode entry. Single CPU, so a static slot suffices where
/// an SMP kernel would use per-CPU GS data.
pub static SYSCALL_KERNEL_RSP: AtomicU64 = AtomicU64::new(0);

/// Scratch for the user RSP across the stack switch.
static SYSCALL_USER_RSP: AtomicU64 = AtomicU64::new(0);

/// Program EFER.SCE, STAR, LSTAR and SFMASK.
pub fn init_msrs() {
    // SAFETY: selector layout is fixed by gdt.rs; syscall_entry is a
    // permanent symbol. Writing these MSRs only redirects the syscall
    // instruction, which nothing uses until user mode exists.
    unsafe {
        Efer::update(|flags| {
            flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS);
        });
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));
        Star::write(
            SegmentSelector(USER_CS as u16),
            SegmentSelector(USER_SS as u16),
            SegmentSelector(0x08),
            SegmentSelector(0x10),
        )
        .expect("STAR selector layout");
        // Interrupts, traps and direction flag are cleared on entry.
        SFMask::write(
            RFlags::INTERRUPT_FLAG | RFlags::TRAP_FLAG | RFlags::DIRECTION_FLAG,
        );
    }
}

/// `int 0x80` gate. The CPU has already pushed SS/RSP/RFLAGS/CS/RIP and
/// switched to TSS.rsp0; we add the fifteen GPRs, hand the frame to the
/// dispatcher, and iretq with RAX rewritten to the return value.
#[unsafe(naked)]
pub unsafe extern "C" fn int80_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        dispatch = sym dispatch_trampoline,
    );
}

/// `syscall` instruction entry. RCX/R11 carry the return RIP/RFLAGS; we
/// synthesize the same frame shape the trap gate produces so one
/// dispatcher serves both, then SYSRET.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        // Stack switch through statics (single CPU, no swapgs needed).
        "mov [rip + {user_rsp}], rsp",
        "mov rsp, [rip + {kernel_rsp}]",
        // Synthesize the hardware frame: SS, RSP, RFLAGS(r11), CS, RIP(rcx).
        "push {user_ss}",
        "push qword ptr [rip + {user_rsp}]",
        "push r11",
        "push {user_cs}",
        "push rcx",
        // GPRs, same order as the trap gate.
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Unwind the synthesized frame: RIP -> rcx, skip CS, RFLAGS ->
        // r11, then the user stack.
        "pop rcx",
        "add rsp, 8",
        "pop r11",
        "pop rsp",
        "sysretq",
        user_rsp = sym SYSCALL_USER_RSP,
        kernel_rsp = sym SYSCALL_KERNEL_RSP,
        user_ss = const USER_SS,
        user_cs = const USER_CS,
        dispatch = sym dispatch_trampoline,
    );
}

extern "C" fn dispatch_trampoline(frame: &mut TrapFrame) {
    crate::syscall::dispatch(frame);
}
