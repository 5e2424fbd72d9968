//! User-pointer transfer helpers
//!
//! Every byte crossing the user/kernel boundary passes through these
//! functions. Page presence is validated by a software walk of the
//! current address space before anything is dereferenced; the kernel
//! runs on the task's CR3, so a validated user page is directly
//! addressable.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{errno, KernelError};

/// Longest path accepted from user space.
pub const USER_STR_MAX: usize = 256;

/// Check that every page of `[ptr, ptr + len)` is mapped and present.
fn validate_user_range(ptr: u64, len: usize) -> Result<(), i64> {
    if ptr == 0 {
        return Err(errno::EFAULT);
    }
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use crate::mm::{vmem, VirtAddr, FRAME_SIZE};

        let pml4 = vmem::current_pml4().ok_or(errno::EFAULT)?;
        let mut page = VirtAddr::new(ptr).align_down().as_u64();
        let end = ptr.checked_add(len as u64).ok_or(errno::EFAULT)?;
        while page < end {
            if vmem::walk(pml4, VirtAddr::new(page)).is_none() {
                return Err(errno::EFAULT);
            }
            page += FRAME_SIZE as u64;
        }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = len;
    Ok(())
}

/// Copy `len` bytes in from user space.
pub fn copy_from_user(ptr: u64, len: usize) -> Result<Vec<u8>, i64> {
    validate_user_range(ptr, len)?;
    let mut buf = vec![0u8; len];
    // SAFETY: the range was just validated present in the current
    // address space.
    unsafe {
        core::ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), len);
    }
    Ok(buf)
}

/// Copy `data` out to user space.
pub fn copy_to_user(ptr: u64, data: &[u8]) -> Result<(), i64> {
    validate_user_range(ptr, data.len())?;
    // SAFETY: the range was just validated present in the current
    // address space.
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
    }
    Ok(())
}

/// Read a NUL-terminated string from user space, bounded by
/// [`USER_STR_MAX`].
pub fn str_from_user(ptr: u64) -> Result<String, i64> {
    let mut bytes = Vec::new();
    for i in 0..USER_STR_MAX as u64 {
        validate_user_range(ptr + i, 1)?;
        // SAFETY: single byte, validated above.
        let b = unsafe { ((ptr + i) as *const u8).read() };
        if b == 0 {
            return String::from_utf8(bytes)
                .map_err(|_| KernelError::InvalidArgument { name: "path" }.into());
        }
        bytes.push(b);
    }
    Err(errno::EINVAL)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_raw_pointers() {
        let mut target = [0u8; 8];
        copy_to_user(target.as_mut_ptr() as u64, b"payload\0").unwrap();
        assert_eq!(&target, b"payload\0");
        let back = copy_from_user(target.as_ptr() as u64, 7).unwrap();
        assert_eq!(back, b"payload");
        let s = str_from_user(target.as_ptr() as u64).unwrap();
        assert_eq!(s, "payload");
    }

    #[test]
    fn null_pointer_is_efault() {
        assert_eq!(copy_from_user(0, 4), Err(errno::EFAULT));
        assert_eq!(copy_to_user(0, b"x"), Err(errno::EFAULT));
    }

    #[test]
    fn unterminated_string_is_rejected() {
        let junk = [b'a'; USER_STR_MAX + 16];
        assert_eq!(str_from_user(junk.as_ptr() as u64), Err(errno::EINVAL));
    }
}
