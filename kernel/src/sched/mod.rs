//! Tasks and scheduling
//!
//! Cooperative plus timer-preemptive round-robin over a fixed task
//! arena. The idle task is tid 0, runs in kernel mode on the boot stack,
//! and is selected only when the ready queue is empty.

pub mod queue;
pub mod scheduler;
pub mod task;

pub use scheduler::{current_tid, schedule, task_exit, task_ready, task_yield};
pub use task::{Task, TaskId, TaskState};

/// Arena capacity, including the idle slot.
pub const MAX_TASKS: usize = 64;

/// The idle task's identifier.
pub const IDLE_TID: TaskId = 0;

/// Per-task file descriptor table size.
pub const MAX_FDS: usize = 32;

/// Empty fd slot marker.
pub const FD_NONE: i32 = -1;
