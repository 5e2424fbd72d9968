//! Ferrite kernel library
//!
//! The kernel proper, built as a library so the core logic (allocators,
//! paging, scheduler queues, block cache, FAT16, VFS) runs under the
//! standard test harness on a host target as well as inside the
//! bare-metal binary.

#![no_std]
#![cfg_attr(
    all(target_arch = "x86_64", target_os = "none"),
    feature(abi_x86_interrupt)
)]

extern crate alloc;

// Host target (coverage, unit tests): link std and use the system
// allocator so test code using Vec/String runs unmodified.
#[cfg(not(target_os = "none"))]
extern crate std;

// Bare metal: the kmalloc heap is the Rust allocator.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;

// Re-exports for the binary and for tests
pub use mm::{PhysAddr, VirtAddr, FRAME_SIZE};
pub use sched::{Task, TaskId, TaskState};
