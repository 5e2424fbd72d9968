//! Task control blocks and the task arena

use crate::arch::x86_64::context::Context;
use crate::mm::{PhysAddr, VirtAddr};

use super::queue::ReadyQueue;
use super::{FD_NONE, MAX_FDS, MAX_TASKS};

/// Index into the task arena. Slot reuse keeps tids small; the idle task
/// is permanently tid 0.
pub type TaskId = usize;

/// Bytes reserved for a task name.
pub const NAME_LEN: usize = 32;

/// User stack window: four pages below the top.
pub const USER_STACK_BASE: u64 = 0x7FFF_B000;
pub const USER_STACK_TOP: u64 = 0x7FFF_F000;
pub const USER_STACK_PAGES: usize = 4;

/// `sbrk` arena base.
pub const USER_HEAP_BASE: u64 = 0x4000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Dead,
}

/// Task control block.
pub struct Task {
    pub tid: TaskId,
    pub name: [u8; NAME_LEN],
    pub state: TaskState,
    pub kernel_mode: bool,
    /// Saved register context, the canonical layout the asm stubs use.
    pub ctx: Context,
    /// Top of the one-frame kernel stack (0 for the idle task: boot stack).
    pub kernel_stack_top: u64,
    pub user_stack_top: u64,
    /// Ring 3 entry point; consumed by the first-dispatch trampoline.
    pub user_entry: u64,
    /// Physical address of this task's PML4.
    pub pml4: PhysAddr,
    pub user_brk_base: u64,
    pub user_brk_size: u64,
    /// Timer ticks observed while running.
    pub ticks: u64,
    /// Ready-queue intrusive link.
    pub next: Option<TaskId>,
    /// Local fd -> global handle index, or [`FD_NONE`].
    pub fds: [i32; MAX_FDS],
}

impl Task {
    pub fn new(tid: TaskId, name: &str, kernel_mode: bool, pml4: PhysAddr) -> Self {
        let mut name_buf = [0u8; NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_LEN - 1);
        name_buf[..n].copy_from_slice(&bytes[..n]);
        Self {
            tid,
            name: name_buf,
            state: TaskState::Ready,
            kernel_mode,
            ctx: Context::default(),
            kernel_stack_top: 0,
            user_stack_top: 0,
            user_entry: 0,
            pml4,
            user_brk_base: USER_HEAP_BASE,
            user_brk_size: 0,
            ticks: 0,
            next: None,
            fds: [FD_NONE; MAX_FDS],
        }
    }

    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }

    /// First free fd slot at or above 3 (0/1/2 are the console).
    pub fn alloc_fd(&mut self, handle: usize) -> Option<usize> {
        for fd in 3..MAX_FDS {
            if self.fds[fd] == FD_NONE {
                self.fds[fd] = handle as i32;
                return Some(fd);
            }
        }
        None
    }

    pub fn handle_for(&self, fd: usize) -> Option<usize> {
        if !(3..MAX_FDS).contains(&fd) {
            return None;
        }
        match self.fds[fd] {
            FD_NONE => None,
            h => Some(h as usize),
        }
    }

    pub fn release_fd(&mut self, fd: usize) -> Option<usize> {
        let handle = self.handle_for(fd)?;
        self.fds[fd] = FD_NONE;
        Some(handle)
    }
}

pub type TaskSlots = [Option<Task>; MAX_TASKS];

/// The arena plus the ready queue whose links thread through it; one
/// lock covers both.
pub struct TaskTable {
    pub slots: TaskSlots,
    pub queue: ReadyQueue,
}

impl TaskTable {
    pub const fn new() -> Self {
        const NONE: Option<Task> = None;
        Self {
            slots: [NONE; MAX_TASKS],
            queue: ReadyQueue::new(),
        }
    }

    pub fn task(&self, tid: TaskId) -> Option<&Task> {
        self.slots.get(tid).and_then(|s| s.as_ref())
    }

    pub fn task_mut(&mut self, tid: TaskId) -> Option<&mut Task> {
        self.slots.get_mut(tid).and_then(|s| s.as_mut())
    }

    /// Claim a slot: empty ones first, then lazy reuse of Dead slots
    /// (their resources are released here, not at exit time).
    pub fn claim_slot(&mut self) -> Option<TaskId> {
        for tid in 1..MAX_TASKS {
            if self.slots[tid].is_none() {
                return Some(tid);
            }
        }
        for tid in 1..MAX_TASKS {
            let dead = matches!(self.slots[tid], Some(ref t) if t.state == TaskState::Dead);
            if dead {
                let task = self.slots[tid].take().expect("checked above");
                release_task_resources(&task);
                return Some(tid);
            }
        }
        None
    }

    /// Pop the next runnable task; Dead entries that were enqueued before
    /// dying are skipped and never selected.
    pub fn pick_next(&mut self) -> Option<TaskId> {
        loop {
            let tid = self.queue.dequeue(&mut self.slots)?;
            match self.slots[tid] {
                Some(ref t) if t.state == TaskState::Ready => return Some(tid),
                _ => continue,
            }
        }
    }
}

/// Free what a dead task still holds: kernel stack frame, the tracked
/// user ranges (stack, sbrk arena), and the PML4 frame. ELF image frames
/// are not tracked per-page and stay allocated in this release.
fn release_task_resources(task: &Task) {
    use crate::mm::{frame, paging};

    if task.kernel_stack_top != 0 {
        frame::free_frame(PhysAddr::new(
            task.kernel_stack_top - frame::FRAME_SIZE as u64,
        ));
    }
    if !task.kernel_mode && task.pml4.as_u64() != 0 {
        for i in 0..USER_STACK_PAGES as u64 {
            let va = VirtAddr::new(USER_STACK_BASE + i * frame::FRAME_SIZE as u64);
            if let Some(phys) = paging::unmap_page(task.pml4, va) {
                frame::free_frame(phys);
            }
        }
        let brk_pages = (task.user_brk_size as usize).div_ceil(frame::FRAME_SIZE);
        for i in 0..brk_pages as u64 {
            let va = VirtAddr::new(task.user_brk_base + i * frame::FRAME_SIZE as u64);
            if let Some(phys) = paging::unmap_page(task.pml4, va) {
                frame::free_frame(phys);
            }
        }
        frame::free_frame(task.pml4);
    }
    for &handle in task.fds.iter().filter(|&&h| h != FD_NONE) {
        let _ = crate::fs::close(handle as usize);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn names_are_bounded_and_readable() {
        let t = Task::new(1, "init", true, PhysAddr::new(0));
        assert_eq!(t.name(), "init");
        let long = Task::new(2, &"x".repeat(80), true, PhysAddr::new(0));
        assert_eq!(t.tid, 1);
        assert_eq!(long.name().len(), NAME_LEN - 1);
    }

    #[test]
    fn fd_allocation_is_first_free_from_three() {
        let mut t = Task::new(1, "t", false, PhysAddr::new(0));
        assert_eq!(t.alloc_fd(100), Some(3));
        assert_eq!(t.alloc_fd(101), Some(4));
        assert_eq!(t.release_fd(3), Some(100));
        assert_eq!(t.alloc_fd(102), Some(3));
        assert_eq!(t.handle_for(4), Some(101));
        assert_eq!(t.handle_for(0), None);
        assert_eq!(t.handle_for(31), None);
    }

    #[test]
    fn fd_table_fills_up() {
        let mut t = Task::new(1, "t", false, PhysAddr::new(0));
        for _ in 3..MAX_FDS {
            assert!(t.alloc_fd(1).is_some());
        }
        assert_eq!(t.alloc_fd(1), None);
    }

    #[test]
    fn slot_claim_skips_live_tasks() {
        let mut table = TaskTable::new();
        let a = table.claim_slot().unwrap();
        table.slots[a] = Some(Task::new(a, "a", true, PhysAddr::new(0)));
        let b = table.claim_slot().unwrap();
        assert_ne!(a, b);
        table.slots[b] = Some(Task::new(b, "b", true, PhysAddr::new(0)));
        // Kill a; its slot becomes reusable (resources freed lazily).
        table.task_mut(a).unwrap().state = TaskState::Dead;
        table.task_mut(a).unwrap().kernel_stack_top = 0;
        let c = table.claim_slot().unwrap();
        assert_ne!(c, b);
    }
}
