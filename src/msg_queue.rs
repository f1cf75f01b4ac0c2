//! Typed message queues
use core::fmt;

use heapless::Deque;

use crate::{
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell},
    task::{self, TaskCb},
    utils::Init,
    wait::{self, SyncCb},
    Kernel, Port,
};

/// *Message queue control block* - a bounded FIFO of `LEN` elements of `T`,
/// with receivers blocking through the shared pending-queue protocol.
///
/// `send` never blocks (a full queue is an error), so it is usable from
/// interrupt context; `recv` may block and is task-only.
pub struct MessageQueueCb<Traits: Port, T: 'static, const LEN: usize> {
    pub(crate) sync: SyncCb<Traits>,
    pub(crate) buffer: CpuLockCell<Traits, Deque<T, LEN>>,
}

impl<Traits: Port, T: 'static, const LEN: usize> Init for MessageQueueCb<Traits, T, LEN> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: Kernel, T: 'static, const LEN: usize> fmt::Debug
    for MessageQueueCb<Traits, T, LEN>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MessageQueueCb")
            .field("self", &(self as *const _))
            .field("capacity", &LEN)
            .finish()
    }
}

impl<Traits: Port, T: 'static, const LEN: usize> MessageQueueCb<Traits, T, LEN> {
    pub const fn new() -> Self {
        Self {
            sync: SyncCb::new(),
            buffer: CpuLockCell::new(Deque::new()),
        }
    }
}

impl<Traits: Kernel, T: 'static, const LEN: usize> MessageQueueCb<Traits, T, LEN> {
    /// Register the queue with the kernel.
    pub fn init(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        wait::register(lock.borrow_mut(), &self.sync)
    }

    /// Unregister the queue. Fails while tasks are blocked on it.
    pub fn deinit(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        wait::unregister(lock.borrow_mut(), &self.sync)
    }

    /// Post a message. `QueueOverflow` when the buffer is full. Wakes the
    /// highest-priority pending receiver, which preempts the caller if its
    /// priority is strictly higher.
    pub fn send(&'static self, message: T) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        if !self.sync.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }

        self.buffer
            .write(lock.borrow_mut())
            .push_back(message)
            .map_err(|_| Error::QueueOverflow)?;

        if wait::wake_up_one(lock.borrow_mut(), &self.sync).is_some() {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Take the oldest message, blocking up to `timeout_ms` milliseconds
    /// (`0` = wait forever) while the queue is empty.
    pub fn recv(&'static self, timeout_ms: u32) -> Result<T> {
        let mut lock = lock_cpu::<Traits>()?;
        let ticks = wait::prepare_wait::<Traits>(&lock, &self.sync, timeout_ms)?;

        loop {
            if let Some(message) = self.buffer.write(lock.borrow_mut()).pop_front() {
                return Ok(message);
            }

            // Woken by a sender; re-poll, since a higher-priority task may
            // have taken the message first.
            wait::block_on(lock.borrow_mut(), &self.sync, ticks)?;
        }
    }

    /// Take the oldest message without blocking; `TimedOut` when the queue
    /// is empty.
    pub fn poll(&'static self) -> Result<T> {
        let mut lock = lock_cpu::<Traits>()?;
        if !self.sync.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }
        self.buffer
            .write(lock.borrow_mut())
            .pop_front()
            .ok_or(Error::TimedOut)
    }

    /// The number of buffered messages.
    pub fn len(&'static self) -> Result<usize> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.buffer.read(&lock).len())
    }

    /// Whether the buffer currently holds no messages.
    pub fn is_empty(&'static self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Cancel `task`'s wait on this queue with the `Aborted` result.
    pub fn abort(&'static self, task: &'static TaskCb<Traits>) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        wait::abort_task(lock.borrow_mut(), &self.sync, task)?;
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}
