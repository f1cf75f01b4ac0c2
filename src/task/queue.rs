//! Intrusive task queues (internal use only).
//!
//! A doubly-linked list threaded through the task control blocks. Links and
//! the owning-queue back-reference live in lock-gated cells, so every
//! mutation already requires the caller to be inside a critical section; the
//! queue itself never touches the CPU Lock state.
use crate::{
    klock::{CpuLockCell, CpuLockToken},
    task::TaskCb,
    utils::Init,
    Port,
};

/// The intrusive links embedded in every [`TaskCb`].
pub(crate) struct TaskLinks<Traits: Port> {
    pub(crate) prev: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
    pub(crate) next: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The queue the task currently belongs to. `None` when detached. A task
    /// is in at most one queue at any time.
    pub(crate) owner: CpuLockCell<Traits, Option<&'static TaskQueue<Traits>>>,
}

impl<Traits: Port> Init for TaskLinks<Traits> {
    const INIT: Self = Self {
        prev: Init::INIT,
        next: Init::INIT,
        owner: Init::INIT,
    };
}

/// A queue of tasks with head, tail, and element count.
pub(crate) struct TaskQueue<Traits: Port> {
    head: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
    tail: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
    len: CpuLockCell<Traits, usize>,
}

impl<Traits: Port> Init for TaskQueue<Traits> {
    const INIT: Self = Self {
        head: Init::INIT,
        tail: Init::INIT,
        len: Init::INIT,
    };
}

impl<Traits: Port> TaskQueue<Traits> {
    pub(crate) fn front(&self, lock: &CpuLockToken<Traits>) -> Option<&'static TaskCb<Traits>> {
        self.head.get(lock)
    }

    pub(crate) fn len(&self, lock: &CpuLockToken<Traits>) -> usize {
        self.len.get(lock)
    }

    pub(crate) fn is_empty(&self, lock: &CpuLockToken<Traits>) -> bool {
        self.len.get(lock) == 0
    }

    /// Insert `task` after `target`; a `None` target appends to the tail.
    ///
    /// `task` must be detached.
    pub(crate) fn insert_after(
        &'static self,
        lock: &mut CpuLockToken<Traits>,
        task: &'static TaskCb<Traits>,
        target: Option<&'static TaskCb<Traits>>,
    ) {
        debug_assert!(task.links.owner.get(lock).is_none());

        match target {
            None => {
                let old_tail = self.tail.replace(lock, Some(task));
                task.links.prev.replace(lock, old_tail);
                task.links.next.replace(lock, None);
                match old_tail {
                    Some(tail) => {
                        tail.links.next.replace(lock, Some(task));
                    }
                    None => {
                        self.head.replace(lock, Some(task));
                    }
                }
            }
            Some(target) => {
                debug_assert!(matches!(
                    target.links.owner.get(lock),
                    Some(queue) if core::ptr::eq(queue, self)
                ));
                let after = target.links.next.replace(lock, Some(task));
                task.links.prev.replace(lock, Some(target));
                task.links.next.replace(lock, after);
                match after {
                    Some(after) => {
                        after.links.prev.replace(lock, Some(task));
                    }
                    None => {
                        self.tail.replace(lock, Some(task));
                    }
                }
            }
        }

        task.links.owner.replace(lock, Some(self));
        let len = self.len.get(lock);
        self.len.replace(lock, len + 1);
    }

    /// Insert `task` before `target`; a `None` target prepends to the head.
    ///
    /// `task` must be detached.
    pub(crate) fn insert_before(
        &'static self,
        lock: &mut CpuLockToken<Traits>,
        task: &'static TaskCb<Traits>,
        target: Option<&'static TaskCb<Traits>>,
    ) {
        debug_assert!(task.links.owner.get(lock).is_none());

        match target {
            None => {
                let old_head = self.head.replace(lock, Some(task));
                task.links.next.replace(lock, old_head);
                task.links.prev.replace(lock, None);
                match old_head {
                    Some(head) => {
                        head.links.prev.replace(lock, Some(task));
                    }
                    None => {
                        self.tail.replace(lock, Some(task));
                    }
                }
                task.links.owner.replace(lock, Some(self));
                let len = self.len.get(lock);
                self.len.replace(lock, len + 1);
            }
            Some(target) => {
                debug_assert!(matches!(
                    target.links.owner.get(lock),
                    Some(queue) if core::ptr::eq(queue, self)
                ));
                match target.links.prev.get(lock) {
                    Some(before) => self.insert_after(lock, task, Some(before)),
                    // `target` is the head; inserting before it prepends.
                    None => self.insert_before(lock, task, None),
                }
            }
        }
    }

    /// Insert `task` keeping the queue sorted by effective priority: head =
    /// highest priority (smallest number), FIFO among equals. Scans from the
    /// tail, so the expected cost is low when priorities are mostly equal.
    pub(crate) fn insert_sorted(
        &'static self,
        lock: &mut CpuLockToken<Traits>,
        task: &'static TaskCb<Traits>,
    ) {
        let priority = task.effective_priority.get(lock);

        let mut cursor = self.tail.get(lock);
        while let Some(candidate) = cursor {
            if candidate.effective_priority.get(lock) <= priority {
                break;
            }
            cursor = candidate.links.prev.get(lock);
        }

        match cursor {
            Some(candidate) => self.insert_after(lock, task, Some(candidate)),
            None => self.insert_before(lock, task, None),
        }
    }

    /// Detach and return the head.
    pub(crate) fn pop_front(
        &self,
        lock: &mut CpuLockToken<Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        let task = self.head.get(lock)?;

        let next = task.links.next.replace(lock, None);
        self.head.replace(lock, next);
        match next {
            Some(next) => {
                next.links.prev.replace(lock, None);
            }
            None => {
                self.tail.replace(lock, None);
            }
        }

        task.links.prev.replace(lock, None);
        task.links.owner.replace(lock, None);
        let len = self.len.get(lock);
        self.len.replace(lock, len - 1);
        Some(task)
    }

    /// Detach `task` in O(1). Succeeds iff the task's back-reference names
    /// this queue.
    pub(crate) fn remove(
        &self,
        lock: &mut CpuLockToken<Traits>,
        task: &'static TaskCb<Traits>,
    ) -> bool {
        match task.links.owner.get(lock) {
            Some(owner) if core::ptr::eq(owner, self) => {}
            _ => return false,
        }

        let prev = task.links.prev.replace(lock, None);
        let next = task.links.next.replace(lock, None);
        match prev {
            Some(prev) => {
                prev.links.next.replace(lock, next);
            }
            None => {
                self.head.replace(lock, next);
            }
        }
        match next {
            Some(next) => {
                next.links.prev.replace(lock, prev);
            }
            None => {
                self.tail.replace(lock, prev);
            }
        }

        task.links.owner.replace(lock, None);
        let len = self.len.get(lock);
        self.len.replace(lock, len - 1);
        true
    }

    /// Rotate the head to the tail. The identity on queues shorter than two
    /// elements; never changes membership.
    pub(crate) fn rotate(&'static self, lock: &mut CpuLockToken<Traits>) {
        if self.len.get(lock) < 2 {
            return;
        }

        // `len >= 2`, so both the head and its successor exist.
        let Some(head) = self.head.get(lock) else {
            return;
        };
        let Some(new_head) = head.links.next.get(lock) else {
            return;
        };

        new_head.links.prev.replace(lock, None);
        self.head.replace(lock, Some(new_head));

        let old_tail = self.tail.replace(lock, Some(head));
        head.links.next.replace(lock, None);
        head.links.prev.replace(lock, old_tail);
        if let Some(old_tail) = old_tail {
            old_tail.links.next.replace(lock, Some(head));
        }
    }
}
