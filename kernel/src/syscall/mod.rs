//! System call interface
//!
//! One dispatcher serves both the `int 0x80` trap gate and the `syscall`
//! instruction. Linux convention: number in RAX; arguments in RDI, RSI,
//! RDX, R10, R8, R9; return in RAX with errors as negated errno.
//!
//! Numbering is pinned to the Linux slots for the POSIX calls, with
//! kernel-specific extensions at 500+; the user C library carries the
//! same table and the two must match exactly.

#![allow(clippy::unnecessary_cast)]

mod filesystem;
mod process;
pub mod user_copy;

use filesystem::*;
use process::*;

use crate::arch::x86_64::context::TrapFrame;

/// System call numbers
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Read = 0,
    Write = 1,
    Open = 2,
    Close = 3,
    Fstat = 5,
    Lseek = 8,
    Sbrk = 12,
    Yield = 24,
    GetPid = 39,
    Exit = 60,
    Kill = 62,
    ArchPrctl = 158,
    // Extensions for the hosted C library
    IsaTty = 500,
    GetReent = 501,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Syscall::Read),
            1 => Ok(Syscall::Write),
            2 => Ok(Syscall::Open),
            3 => Ok(Syscall::Close),
            5 => Ok(Syscall::Fstat),
            8 => Ok(Syscall::Lseek),
            12 => Ok(Syscall::Sbrk),
            24 => Ok(Syscall::Yield),
            39 => Ok(Syscall::GetPid),
            60 => Ok(Syscall::Exit),
            62 => Ok(Syscall::Kill),
            158 => Ok(Syscall::ArchPrctl),
            500 => Ok(Syscall::IsaTty),
            501 => Ok(Syscall::GetReent),
            _ => Err(()),
        }
    }
}

/// Success value, or a positive errno the boundary negates into RAX.
pub type SyscallResult = Result<u64, i64>;

impl From<crate::error::KernelError> for i64 {
    fn from(err: crate::error::KernelError) -> i64 {
        err.to_errno()
    }
}

/// Dispatch one system call frame and write the result back into RAX.
pub fn dispatch(frame: &mut TrapFrame) {
    let (a1, a2, a3, a4, _a5, _a6) =
        (frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9);
    let result = match Syscall::try_from(frame.rax as usize) {
        Ok(Syscall::Read) => sys_read(a1 as usize, a2, a3 as usize),
        Ok(Syscall::Write) => sys_write(a1 as usize, a2, a3 as usize),
        Ok(Syscall::Open) => sys_open(a1, a2, a3),
        Ok(Syscall::Close) => sys_close(a1 as usize),
        Ok(Syscall::Fstat) => sys_fstat(a1 as usize, a2),
        Ok(Syscall::Lseek) => sys_lseek(a1 as usize, a2 as i64, a3 as u32),
        Ok(Syscall::Sbrk) => sys_sbrk(a1 as i64),
        Ok(Syscall::Yield) => sys_yield(),
        Ok(Syscall::GetPid) => sys_getpid(),
        Ok(Syscall::Exit) => sys_exit(a1 as i32),
        Ok(Syscall::Kill) => sys_kill(a1 as i64, a2 as i64),
        Ok(Syscall::ArchPrctl) => sys_arch_prctl(a1 as u32, a2),
        Ok(Syscall::IsaTty) => sys_isatty(a1 as usize),
        Ok(Syscall::GetReent) => sys_get_reent(a1 as usize),
        Err(()) => {
            log::warn!("syscall: unknown number {}", frame.rax);
            Err(crate::error::errno::ENOSYS)
        }
    };
    frame.rax = match result {
        Ok(value) => value,
        Err(errno) => -errno as u64,
    };
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn numbering_round_trips() {
        for nr in [0usize, 1, 2, 3, 5, 8, 12, 24, 39, 60, 62, 158, 500, 501] {
            let call = Syscall::try_from(nr).unwrap();
            assert_eq!(call as usize, nr);
        }
        assert!(Syscall::try_from(4).is_err());
        assert!(Syscall::try_from(9999).is_err());
    }
}
