//! Error types for the Ferrite kernel
//!
//! Structured error values replace bare integer codes inside the kernel;
//! the syscall layer translates them to negated errno values at the user
//! boundary.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frames or heap exhausted
    OutOfMemory {
        requested: usize,
    },
    /// A page-table walk or mapping operation failed
    MappingFailed {
        virt: u64,
    },
    /// Address failed validation (unmapped, misaligned, null)
    InvalidAddress {
        addr: u64,
    },
    /// Filesystem-level failure
    FsError(FsError),
    /// Generic bad argument
    InvalidArgument {
        name: &'static str,
    },
    /// Resource table (task slots, handles, fds) exhausted
    ResourceExhausted {
        resource: &'static str,
    },
    /// Subsystem used before its init() ran
    NotInitialized {
        subsystem: &'static str,
    },
    /// Operation is not supported in this release
    NotSupported {
        operation: &'static str,
    },
}

/// Filesystem-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path does not resolve to an entry
    NotFound,
    /// Path component used as a directory is not one
    NotADirectory,
    /// Directory operation applied to a regular file
    IsADirectory,
    /// Superblock or BPB failed validation at mount
    BadSuperblock,
    /// Cluster chain ended before the reported file size
    TruncatedChain,
    /// FAT has no free clusters for the requested length
    NoSpace,
    /// Underlying device or cache I/O failed
    IoError,
    /// No registered backend accepted the volume
    NoBackend,
    /// Handle table full or handle index invalid
    BadHandle,
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        KernelError::FsError(err)
    }
}

impl From<KernelError> for FsError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::FsError(e) => e,
            _ => FsError::IoError,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {} bytes)", requested)
            }
            KernelError::MappingFailed { virt } => write!(f, "mapping failed at {:#x}", virt),
            KernelError::InvalidAddress { addr } => write!(f, "invalid address {:#x}", addr),
            KernelError::FsError(e) => write!(f, "filesystem error: {:?}", e),
            KernelError::InvalidArgument { name } => write!(f, "invalid argument: {}", name),
            KernelError::ResourceExhausted { resource } => write!(f, "{} exhausted", resource),
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} not initialized", subsystem)
            }
            KernelError::NotSupported { operation } => write!(f, "{} not supported", operation),
        }
    }
}

/// POSIX errno values the syscall boundary hands to the user C library.
///
/// Returned to user space as the negated value in RAX.
pub mod errno {
    pub const EPERM: i64 = 1;
    pub const ENOENT: i64 = 2;
    pub const EIO: i64 = 5;
    pub const EBADF: i64 = 9;
    pub const ENOMEM: i64 = 12;
    pub const EFAULT: i64 = 14;
    pub const EEXIST: i64 = 17;
    pub const ENOTDIR: i64 = 20;
    pub const EISDIR: i64 = 21;
    pub const EINVAL: i64 = 22;
    pub const EMFILE: i64 = 24;
    pub const ENOSPC: i64 = 28;
    pub const ENOSYS: i64 = 38;
}

impl KernelError {
    /// Map this error onto the errno the syscall layer reports.
    pub fn to_errno(self) -> i64 {
        match self {
            KernelError::OutOfMemory { .. } => errno::ENOMEM,
            KernelError::MappingFailed { .. } => errno::ENOMEM,
            KernelError::InvalidAddress { .. } => errno::EFAULT,
            KernelError::FsError(e) => match e {
                FsError::NotFound => errno::ENOENT,
                FsError::NotADirectory => errno::ENOTDIR,
                FsError::IsADirectory => errno::EISDIR,
                FsError::NoSpace => errno::ENOSPC,
                FsError::BadHandle => errno::EBADF,
                _ => errno::EIO,
            },
            KernelError::InvalidArgument { .. } => errno::EINVAL,
            KernelError::ResourceExhausted { .. } => errno::EMFILE,
            KernelError::NotInitialized { .. } => errno::EIO,
            KernelError::NotSupported { .. } => errno::ENOSYS,
        }
    }
}
