//! Process-side system calls: exit, identity, the sbrk heap, C-library
//! reentrancy state, and TLS base registers.

use super::user_copy::copy_to_user;
use super::SyscallResult;
use crate::error::errno;
use crate::mm::{frame, paging, vmem, PageFlags, VirtAddr};
use crate::sched::scheduler::{self, with_current};

/// exit(code): the task dies; the syscall never returns.
pub fn sys_exit(code: i32) -> SyscallResult {
    log::info!(
        "syscall: task {} exit({})",
        scheduler::current_tid(),
        code
    );
    scheduler::task_exit();
}

pub fn sys_getpid() -> SyscallResult {
    Ok(scheduler::current_tid() as u64)
}

/// kill(pid, sig): acknowledged and dropped; there is no signal
/// delivery in this release.
pub fn sys_kill(_pid: i64, _sig: i64) -> SyscallResult {
    Ok(0)
}

/// Voluntary reschedule to the queue tail.
pub fn sys_yield() -> SyscallResult {
    scheduler::task_yield();
    Ok(0)
}

/// sbrk(increment): grow the user heap upward from its fixed base,
/// returning the previous break. Shrinking is unsupported.
pub fn sys_sbrk(increment: i64) -> SyscallResult {
    let (pml4, base, size) = with_current(|t| (t.pml4, t.user_brk_base, t.user_brk_size));
    let old_break = base + size;
    if increment == 0 {
        return Ok(old_break);
    }
    if increment < 0 {
        return Err(errno::EINVAL);
    }

    let new_size = size
        .checked_add(increment as u64)
        .ok_or(errno::ENOMEM)?;
    let page = frame::FRAME_SIZE as u64;
    let mapped_end = base + size.div_ceil(page) * page;
    let needed_end = base + new_size.div_ceil(page) * page;
    let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
    let mut va = mapped_end;
    while va < needed_end {
        let phys = frame::alloc_frame().ok_or(errno::ENOMEM)?;
        // SAFETY: fresh identity-reachable frame; sbrk memory must read
        // as zero.
        unsafe {
            core::ptr::write_bytes(
                vmem::phys_to_virt(phys).as_u64() as *mut u8,
                0,
                frame::FRAME_SIZE,
            );
        }
        paging::map_page(pml4, VirtAddr::new(va), phys, flags).map_err(i64::from)?;
        va += page;
    }
    with_current(|t| t.user_brk_size = new_size);
    Ok(old_break)
}

/// get_reent(size): one zeroed kernel page for the C library's
/// reentrancy block, mapped user-accessible at its identity address.
/// Requests above a page are rejected.
pub fn sys_get_reent(size: usize) -> SyscallResult {
    if size > frame::FRAME_SIZE {
        return Err(errno::EINVAL);
    }
    let phys = frame::alloc_frame().ok_or(errno::ENOMEM)?;
    // SAFETY: fresh identity-reachable frame, zeroed before user hands.
    unsafe {
        core::ptr::write_bytes(
            vmem::phys_to_virt(phys).as_u64() as *mut u8,
            0,
            frame::FRAME_SIZE,
        );
    }
    let pml4 = with_current(|t| t.pml4);
    let va = VirtAddr::new(phys.as_u64());
    paging::map_page(
        pml4,
        va,
        phys,
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
    )
    .map_err(i64::from)?;
    Ok(va.as_u64())
}

const ARCH_SET_GS: u32 = 0x1001;
const ARCH_SET_FS: u32 = 0x1002;
const ARCH_GET_FS: u32 = 0x1003;
const ARCH_GET_GS: u32 = 0x1004;

/// arch_prctl(code, addr): FS/GS base access for user TLS setup.
pub fn sys_arch_prctl(code: u32, addr: u64) -> SyscallResult {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use x86_64::registers::model_specific::{FsBase, GsBase};
        use x86_64::VirtAddr;

        match code {
            ARCH_SET_FS => {
                FsBase::write(VirtAddr::new(addr));
                Ok(0)
            }
            ARCH_SET_GS => {
                GsBase::write(VirtAddr::new(addr));
                Ok(0)
            }
            ARCH_GET_FS => {
                copy_to_user(addr, &FsBase::read().as_u64().to_le_bytes())?;
                Ok(0)
            }
            ARCH_GET_GS => {
                copy_to_user(addr, &GsBase::read().as_u64().to_le_bytes())?;
                Ok(0)
            }
            _ => Err(errno::EINVAL),
        }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = (code, addr, ARCH_SET_GS, ARCH_SET_FS, ARCH_GET_FS, ARCH_GET_GS);
        let _ = copy_to_user;
        Err(errno::ENOSYS)
    }
}
