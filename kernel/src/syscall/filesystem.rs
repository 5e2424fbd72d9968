//! File descriptor system calls
//!
//! fds 0/1/2 are the console and never touch the handle table; fds 3..31
//! resolve through the current task's fd table into the global VFS
//! handle table.

use alloc::vec;

use super::user_copy::{copy_from_user, copy_to_user, str_from_user};
use super::SyscallResult;
use crate::error::errno;
use crate::fs;
use crate::sched::scheduler::with_current;

/// Console writes are chunked to bound the kernel-side staging buffer.
const CONSOLE_CHUNK: usize = 1024;

const S_IFCHR: u32 = 0o020000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// `struct stat`, x86_64 layout the user C library expects.
#[repr(C)]
#[derive(Default, Clone, Copy)]
struct Stat {
    st_dev: u64,
    st_ino: u64,
    st_nlink: u64,
    st_mode: u32,
    st_uid: u32,
    st_gid: u32,
    _pad0: u32,
    st_rdev: u64,
    st_size: i64,
    st_blksize: i64,
    st_blocks: i64,
    st_atime: i64,
    st_atime_nsec: i64,
    st_mtime: i64,
    st_mtime_nsec: i64,
    st_ctime: i64,
    st_ctime_nsec: i64,
    _reserved: [i64; 3],
}

fn handle_of(fd: usize) -> Result<usize, i64> {
    with_current(|task| task.handle_for(fd)).ok_or(errno::EBADF)
}

/// read(fd, buf, len). fd 0 blocks for one keyboard line.
pub fn sys_read(fd: usize, buf: u64, len: usize) -> SyscallResult {
    if len == 0 {
        return Ok(0);
    }
    match fd {
        0 => {
            let mut line = [0u8; 256];
            let want = len.min(line.len());
            let n = crate::drivers::keyboard::read_line(&mut line[..want]);
            copy_to_user(buf, &line[..n])?;
            Ok(n as u64)
        }
        1 | 2 => Err(errno::EBADF),
        _ => {
            let handle = handle_of(fd)?;
            let mut data = vec![0u8; len];
            let n = fs::read(handle, &mut data)
                .map_err(|e| crate::error::KernelError::from(e).to_errno())?;
            copy_to_user(buf, &data[..n])?;
            Ok(n as u64)
        }
    }
}

/// write(fd, buf, len). fds 1/2 stream to the console in bounded chunks;
/// fd >= 3 is a truncating overwrite through the VFS backend.
pub fn sys_write(fd: usize, buf: u64, len: usize) -> SyscallResult {
    match fd {
        1 | 2 => {
            let mut written = 0;
            while written < len {
                let n = (len - written).min(CONSOLE_CHUNK);
                let chunk = copy_from_user(buf + written as u64, n)?;
                crate::serial::write_bytes(&chunk);
                written += n;
            }
            Ok(len as u64)
        }
        0 => Err(errno::EBADF),
        _ => {
            let handle = handle_of(fd)?;
            let data = copy_from_user(buf, len)?;
            let n = fs::write(handle, &data)
                .map_err(|e| crate::error::KernelError::from(e).to_errno())?;
            Ok(n as u64)
        }
    }
}

/// open(path, flags, mode). Lazy: the handle caches the size only.
pub fn sys_open(path: u64, _flags: u64, _mode: u64) -> SyscallResult {
    let path = str_from_user(path)?;
    let handle =
        fs::open(&path).map_err(|e| crate::error::KernelError::from(e).to_errno())?;
    match with_current(|task| task.alloc_fd(handle)) {
        Some(fd) => Ok(fd as u64),
        None => {
            let _ = fs::close(handle);
            Err(errno::EMFILE)
        }
    }
}

/// close(fd). Releases the global handle and zeroes the per-task slot.
pub fn sys_close(fd: usize) -> SyscallResult {
    if fd < 3 {
        return Ok(0);
    }
    let handle = with_current(|task| task.release_fd(fd)).ok_or(errno::EBADF)?;
    fs::close(handle).map_err(|e| crate::error::KernelError::from(e).to_errno())?;
    Ok(0)
}

/// lseek(fd, offset, whence). Pure offset bookkeeping, no I/O.
pub fn sys_lseek(fd: usize, offset: i64, whence: u32) -> SyscallResult {
    let handle = handle_of(fd)?;
    let pos = fs::lseek(handle, offset, whence)
        .map_err(|e| crate::error::KernelError::from(e).to_errno())?;
    Ok(pos as u64)
}

/// fstat(fd, statbuf). Mode and size are authoritative; tty fds report a
/// character device.
pub fn sys_fstat(fd: usize, statbuf: u64) -> SyscallResult {
    let mut stat = Stat::default();
    stat.st_nlink = 1;
    stat.st_blksize = 512;
    if fd < 3 {
        stat.st_mode = S_IFCHR | 0o620;
    } else {
        let handle = handle_of(fd)?;
        let info =
            fs::fstat(handle).map_err(|e| crate::error::KernelError::from(e).to_errno())?;
        stat.st_mode = if info.is_dir {
            S_IFDIR | 0o755
        } else {
            S_IFREG | 0o644
        };
        stat.st_size = info.size as i64;
        stat.st_blocks = (info.size as i64 + 511) / 512;
    }
    // SAFETY: Stat is plain-old-data; viewing it as bytes for the copy
    // out is well-defined.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &stat as *const Stat as *const u8,
            core::mem::size_of::<Stat>(),
        )
    };
    copy_to_user(statbuf, bytes)?;
    Ok(0)
}

/// isatty(fd): true exactly for the three console fds.
pub fn sys_isatty(fd: usize) -> SyscallResult {
    Ok(if fd < 3 { 1 } else { 0 })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn stat_layout_matches_linux_x86_64() {
        assert_eq!(core::mem::offset_of!(Stat, st_mode), 24);
        assert_eq!(core::mem::offset_of!(Stat, st_size), 48);
        assert_eq!(core::mem::size_of::<Stat>(), 144);
    }

    #[test]
    fn isatty_is_console_only() {
        assert_eq!(sys_isatty(0), Ok(1));
        assert_eq!(sys_isatty(2), Ok(1));
        assert_eq!(sys_isatty(3), Ok(0));
    }
}
