//! Round-robin scheduler
//!
//! Two entries: `schedule()` for cooperative switches (saves callee-saved
//! state via `task_switch`) and `preempt_from_irq()` for the timer path,
//! which snapshots the interrupted register frame into the TCB and
//! resumes the chosen task through `task_restore` instead of returning
//! into the interrupt stub.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::x86_64::context::{Context, TrapFrame, INITIAL_RFLAGS};
use crate::error::KernelError;
use crate::mm::{frame, paging, vmem, PageFlags, PhysAddr, VirtAddr};
use crate::sync::IrqMutex;

use super::task::{
    Task, TaskId, TaskTable, USER_STACK_BASE, USER_STACK_PAGES, USER_STACK_TOP,
};
use super::{TaskState, IDLE_TID};

pub static TASKS: IrqMutex<TaskTable> = IrqMutex::new(TaskTable::new());

static CURRENT: AtomicUsize = AtomicUsize::new(IDLE_TID);

/// Install the idle task (tid 0): kernel mode, boot stack, the context
/// it needs is captured at the first switch away from it.
pub fn init() {
    TASKS.with(|table| {
        let mut idle = Task::new(IDLE_TID, "idle", true, paging::kernel_pml4());
        idle.state = TaskState::Running;
        table.slots[IDLE_TID] = Some(idle);
    });
    CURRENT.store(IDLE_TID, Ordering::Release);
}

pub fn current_tid() -> TaskId {
    CURRENT.load(Ordering::Acquire)
}

/// Point the scheduler at `tid` without a context switch; only the
/// run-immediately path of the ELF loader uses this, right before its
/// `iretq` into the task.
pub fn set_current(tid: TaskId) {
    CURRENT.store(tid, Ordering::Release);
}

/// Run `f` on the current TCB.
pub fn with_current<R>(f: impl FnOnce(&mut Task) -> R) -> R {
    TASKS.with(|table| {
        let tid = current_tid();
        f(table.task_mut(tid).expect("current task exists"))
    })
}

/// Create a task in `Ready` state; it starts running only after
/// [`task_ready`] enqueues it and the scheduler picks it.
pub fn task_create(entry: u64, name: &str, kernel_mode: bool) -> Result<TaskId, KernelError> {
    let kernel_stack = frame::alloc_frame().ok_or(KernelError::OutOfMemory {
        requested: frame::FRAME_SIZE,
    })?;
    let kernel_stack_top = kernel_stack.as_u64() + frame::FRAME_SIZE as u64;

    let pml4 = if kernel_mode {
        paging::kernel_pml4()
    } else {
        match paging::create_user_pml4() {
            Some(p) => p,
            None => {
                frame::free_frame(kernel_stack);
                return Err(KernelError::OutOfMemory {
                    requested: frame::FRAME_SIZE,
                });
            }
        }
    };

    let mut task = Task::new(0, name, kernel_mode, pml4);
    task.kernel_stack_top = kernel_stack_top;
    task.ctx.rip = entry;
    task.ctx.rflags = INITIAL_RFLAGS;
    task.ctx.cr3 = pml4.as_u64();

    if kernel_mode {
        // A returning entry function lands in task_exit.
        task.ctx.rsp = seed_exit_return(kernel_stack_top);
    } else {
        map_user_stack(pml4).inspect_err(|_| frame::free_frame(kernel_stack))?;
        task.user_stack_top = USER_STACK_TOP;
        task.user_entry = entry;
        // First dispatch runs the trampoline in kernel mode on the
        // task's kernel stack; the Ring 3 transition itself needs iretq.
        task.ctx.rip = user_entry_trampoline as usize as u64;
        task.ctx.rsp = seed_exit_return(kernel_stack_top);
    }

    TASKS.with(|table| {
        let tid = task.tid_assign(table)?;
        Ok(tid)
    })
}

impl Task {
    /// Place this task into a claimed slot; helper for `task_create`.
    fn tid_assign(mut self, table: &mut TaskTable) -> Result<TaskId, KernelError> {
        let tid = table.claim_slot().ok_or(KernelError::ResourceExhausted {
            resource: "task slots",
        })?;
        self.tid = tid;
        log::info!("sched: created task {} '{}'", tid, self.name());
        table.slots[tid] = Some(self);
        Ok(tid)
    }
}

/// Push `task_exit` as the return address a kernel entry function pops.
fn seed_exit_return(kernel_stack_top: u64) -> u64 {
    let rsp = kernel_stack_top - 8;
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: the slot is inside the freshly allocated, identity-mapped
    // kernel stack frame.
    unsafe {
        (rsp as *mut u64).write(exit_trampoline as usize as u64);
    }
    rsp
}

extern "C" fn exit_trampoline() {
    task_exit();
}

/// First dispatch of a user task: the scheduler resumed us in kernel
/// mode under the task's CR3; drop to Ring 3 through the one iretq
/// transition.
extern "C" fn user_entry_trampoline() {
    let (entry, user_rsp, pml4) =
        with_current(|t| (t.user_entry, t.user_stack_top, t.pml4.as_u64()));
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: the loader mapped entry and the stack window under this
    // PML4, and TSS.rsp0 was pointed at our kernel stack when the
    // scheduler dispatched us.
    unsafe {
        crate::arch::x86_64::usermode::enter_usermode(entry, user_rsp, pml4);
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = (entry, user_rsp, pml4);
        unreachable!("user tasks cannot run on the host");
    }
}

/// Map the fixed user stack window into a fresh user PML4.
fn map_user_stack(pml4: PhysAddr) -> Result<(), KernelError> {
    let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
    for i in 0..USER_STACK_PAGES as u64 {
        let phys = frame::alloc_frame().ok_or(KernelError::OutOfMemory {
            requested: frame::FRAME_SIZE,
        })?;
        // SAFETY: fresh frame, identity-reachable; zeroed before mapping.
        unsafe {
            core::ptr::write_bytes(
                vmem::phys_to_virt(phys).as_u64() as *mut u8,
                0,
                frame::FRAME_SIZE,
            );
        }
        paging::map_page(
            pml4,
            VirtAddr::new(USER_STACK_BASE + i * frame::FRAME_SIZE as u64),
            phys,
            flags,
        )?;
    }
    Ok(())
}

/// Enqueue a `Ready` task. The idle task never enters the queue.
pub fn task_ready(tid: TaskId) {
    if tid == IDLE_TID {
        return;
    }
    TASKS.with(|table| {
        if let Some(task) = table.task_mut(tid) {
            task.state = TaskState::Ready;
        } else {
            return;
        }
        table.queue.enqueue(&mut table.slots, tid);
    });
}

/// Decision of one scheduling round, computed under the table lock.
struct Switch {
    old_ctx: *mut Context,
    new_ctx: *const Context,
    new_kernel_stack: u64,
}

/// Pick the next task. Returns `None` when the current task should just
/// keep running.
fn pick_and_swap(table: &mut TaskTable, requeue_current: bool) -> Option<Switch> {
    let old_tid = current_tid();
    if requeue_current {
        let runnable = matches!(
            table.task(old_tid),
            Some(t) if t.state == TaskState::Running
        );
        if runnable && old_tid != IDLE_TID {
            table.task_mut(old_tid).expect("checked").state = TaskState::Ready;
            table.queue.enqueue(&mut table.slots, old_tid);
        } else if runnable {
            table.task_mut(old_tid).expect("checked").state = TaskState::Ready;
        }
    }

    let new_tid = table.pick_next().unwrap_or(IDLE_TID);
    if new_tid == old_tid {
        table.task_mut(old_tid).expect("current exists").state = TaskState::Running;
        return None;
    }

    table.task_mut(new_tid).expect("picked task exists").state = TaskState::Running;
    CURRENT.store(new_tid, Ordering::Release);

    let new_kernel_stack = table.task(new_tid).expect("picked").kernel_stack_top;
    let old_ctx = table
        .task_mut(old_tid)
        .map(|t| &mut t.ctx as *mut Context)
        .unwrap_or(core::ptr::null_mut());
    let new_ctx = &table.task(new_tid).expect("picked").ctx as *const Context;
    Some(Switch {
        old_ctx,
        new_ctx,
        new_kernel_stack,
    })
}

fn point_entry_stacks_at(kernel_stack_top: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if kernel_stack_top != 0 {
        crate::arch::x86_64::gdt::set_kernel_stack(kernel_stack_top);
        crate::arch::x86_64::syscall_entry::SYSCALL_KERNEL_RSP
            .store(kernel_stack_top, Ordering::Release);
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = kernel_stack_top;
}

/// Cooperative scheduling point. If the current task is still `Running`
/// it is re-queued at the tail; the head of the queue (or idle) runs
/// next.
pub fn schedule() {
    crate::sync::without_interrupts(|| {
        let switch = TASKS.with(|table| pick_and_swap(table, true));
        if let Some(sw) = switch {
            point_entry_stacks_at(sw.new_kernel_stack);
            // Contexts live in the static arena: the raw pointers stay
            // valid after the table lock is dropped, and the single-CPU
            // IRQ-off window keeps them unaliased.
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            // SAFETY: see above; both contexts belong to live arena slots.
            unsafe {
                crate::arch::x86_64::context::task_switch(sw.old_ctx, sw.new_ctx);
            }
            #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
            let _ = sw;
        }
    });
}

/// Voluntary yield: always goes to the queue tail.
pub fn task_yield() {
    schedule();
}

/// Timer-driven rescheduling. The interrupted frame is copied into the
/// current TCB; when a different task is chosen this function does not
/// return (the IRQ stub's stack is abandoned and the new task resumes
/// through `task_restore`).
pub fn preempt_from_irq(frame: &mut TrapFrame) {
    let cr3 = vmem::current_pml4().map(|p| p.as_u64()).unwrap_or(0);
    let switch = TASKS.with(|table| {
        let tid = current_tid();
        if let Some(task) = table.task_mut(tid) {
            task.ticks += 1;
            if task.state == TaskState::Running {
                frame.save_into(&mut task.ctx, cr3);
            }
        }
        pick_and_swap(table, true)
    });
    if let Some(sw) = switch {
        point_entry_stacks_at(sw.new_kernel_stack);
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: the new context describes a resumable task; the old
        // task's full state was captured from the trap frame above.
        unsafe {
            crate::arch::x86_64::context::task_restore(sw.new_ctx);
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = sw;
    }
}

/// Terminate the current task: mark it `Dead` and reschedule. The slot
/// and its resources are reclaimed lazily when `task_create` reuses it.
pub fn task_exit() -> ! {
    crate::sync::without_interrupts(|| {
        let switch = TASKS.with(|table| {
            let tid = current_tid();
            if let Some(task) = table.task_mut(tid) {
                log::info!("sched: task {} '{}' exited", tid, task.name());
                task.state = TaskState::Dead;
            }
            pick_and_swap(table, false)
        });
        let sw = switch.expect("a dead task cannot be rescheduled");
        point_entry_stacks_at(sw.new_kernel_stack);
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: the chosen context is a live, resumable task; this one
        // never runs again.
        unsafe {
            crate::arch::x86_64::context::task_restore(sw.new_ctx);
        }
    });
    unreachable!("task_restore does not return");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // Scheduling decisions are testable on the host because pick_and_swap
    // only computes; the context switch itself is target-only.
    fn reset(names: &[&str]) {
        TASKS.with(|table| {
            *table = TaskTable::new();
            let mut idle = Task::new(IDLE_TID, "idle", true, PhysAddr::new(0));
            idle.state = TaskState::Running;
            table.slots[IDLE_TID] = Some(idle);
            for (i, name) in names.iter().enumerate() {
                let tid = i + 1;
                table.slots[tid] = Some(Task::new(tid, name, true, PhysAddr::new(0)));
            }
        });
        CURRENT.store(IDLE_TID, Ordering::Release);
    }

    fn pick(requeue: bool) -> TaskId {
        TASKS.with(|table| {
            pick_and_swap(table, requeue);
        });
        current_tid()
    }

    // One body: the task table is a process-wide singleton and the test
    // harness runs tests concurrently.
    #[test]
    fn scheduling_invariants() {
        // FIFO rotation: idle displaced by A, then A -> B -> C -> A.
        reset(&["a", "b", "c"]);
        task_ready(1);
        task_ready(2);
        task_ready(3);
        assert_eq!(pick(true), 1);
        assert_eq!(pick(true), 2);
        assert_eq!(pick(true), 3);
        assert_eq!(pick(true), 1);
        // The running task is never on the queue.
        TASKS.with(|table| {
            assert!(!table.queue.contains(&table.slots, current_tid()));
        });

        // A lone runnable task keeps running on an empty queue; idle only
        // takes over once it dies.
        reset(&["solo"]);
        task_ready(1);
        assert_eq!(pick(true), 1);
        assert_eq!(pick(true), 1);
        TASKS.with(|table| {
            table.task_mut(1).unwrap().state = TaskState::Dead;
        });
        assert_eq!(pick(false), IDLE_TID);

        // A task that died while enqueued is skipped, never selected.
        reset(&["a", "b"]);
        task_ready(1);
        task_ready(2);
        TASKS.with(|table| {
            table.task_mut(1).unwrap().state = TaskState::Dead;
        });
        assert_eq!(pick(false), 2);

        // The idle task can never be enqueued.
        reset(&[]);
        task_ready(IDLE_TID);
        TASKS.with(|table| {
            assert!(table.queue.is_empty());
        });
    }
}
