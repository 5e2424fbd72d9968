//! Ready queue
//!
//! Strict FIFO, intrusively linked through the `next` field of the TCBs
//! in the arena. The running task is never on the queue; the idle task
//! is never enqueued.

use super::task::{TaskId, TaskSlots};

pub struct ReadyQueue {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    len: usize,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Append to the tail. A yielding task always re-enters here, which
    /// is what makes the rotation fair.
    pub fn enqueue(&mut self, tasks: &mut TaskSlots, tid: TaskId) {
        if let Some(task) = tasks.get_mut(tid).and_then(|s| s.as_mut()) {
            task.next = None;
        } else {
            return;
        }
        match self.tail {
            Some(tail) => {
                if let Some(prev) = tasks.get_mut(tail).and_then(|s| s.as_mut()) {
                    prev.next = Some(tid);
                }
            }
            None => self.head = Some(tid),
        }
        self.tail = Some(tid);
        self.len += 1;
    }

    /// Pop the head.
    pub fn dequeue(&mut self, tasks: &mut TaskSlots) -> Option<TaskId> {
        let head = self.head?;
        let next = tasks
            .get_mut(head)
            .and_then(|s| s.as_mut())
            .and_then(|t| t.next.take());
        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }

    /// Linear membership probe (diagnostics and invariant checks).
    pub fn contains(&self, tasks: &TaskSlots, tid: TaskId) -> bool {
        let mut cur = self.head;
        while let Some(id) = cur {
            if id == tid {
                return true;
            }
            cur = tasks.get(id).and_then(|s| s.as_ref()).and_then(|t| t.next);
        }
        false
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::PhysAddr;
    use crate::sched::task::{Task, TaskTable};
    use crate::sched::TaskState;

    fn table_with(names: &[&str]) -> TaskTable {
        let mut table = TaskTable::new();
        for (i, name) in names.iter().enumerate() {
            let tid = i + 1;
            table.slots[tid] = Some(Task::new(tid, name, true, PhysAddr::new(0)));
        }
        table
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut table = table_with(&["a", "b", "c"]);
        let (a, b, c) = (1, 2, 3);
        table.queue.enqueue(&mut table.slots, a);
        table.queue.enqueue(&mut table.slots, b);
        table.queue.enqueue(&mut table.slots, c);
        assert_eq!(table.queue.len(), 3);
        assert_eq!(table.queue.dequeue(&mut table.slots), Some(a));
        assert_eq!(table.queue.dequeue(&mut table.slots), Some(b));
        assert_eq!(table.queue.dequeue(&mut table.slots), Some(c));
        assert_eq!(table.queue.dequeue(&mut table.slots), None);
        assert!(table.queue.is_empty());
    }

    #[test]
    fn requeue_goes_to_tail() {
        let mut table = table_with(&["a", "b"]);
        table.queue.enqueue(&mut table.slots, 1);
        table.queue.enqueue(&mut table.slots, 2);
        let first = table.queue.dequeue(&mut table.slots).unwrap();
        table.queue.enqueue(&mut table.slots, first);
        assert_eq!(table.queue.dequeue(&mut table.slots), Some(2));
        assert_eq!(table.queue.dequeue(&mut table.slots), Some(1));
    }

    #[test]
    fn dead_tasks_are_never_selected() {
        let mut table = table_with(&["a", "b"]);
        table.queue.enqueue(&mut table.slots, 1);
        table.queue.enqueue(&mut table.slots, 2);
        table.task_mut(1).unwrap().state = TaskState::Dead;
        // pick_next skips the dead head entirely.
        assert_eq!(table.pick_next(), Some(2));
        assert_eq!(table.pick_next(), None);
    }

    #[test]
    fn membership_probe() {
        let mut table = table_with(&["a", "b"]);
        table.queue.enqueue(&mut table.slots, 1);
        assert!(table.queue.contains(&table.slots, 1));
        assert!(!table.queue.contains(&table.slots, 2));
    }
}
