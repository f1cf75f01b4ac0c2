//! Counting semaphores
use core::fmt;

use crate::{
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell, CpuLockGuardBorrowMut},
    task::{self, TaskCb},
    utils::Init,
    wait::{self, SyncCb},
    Kernel, Port,
};

/// *Semaphore control block* - the state data of a counting semaphore.
pub struct SemaphoreCb<Traits: Port> {
    pub(crate) sync: SyncCb<Traits>,
    pub(crate) value: CpuLockCell<Traits, u32>,
    pub(crate) max_value: CpuLockCell<Traits, u32>,
}

impl<Traits: Port> Init for SemaphoreCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sync: Init::INIT,
        value: CpuLockCell::new(0),
        max_value: CpuLockCell::new(u32::MAX),
    };
}

impl<Traits: Kernel> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .finish()
    }
}

/// Check if the current semaphore value satisfies the wait condition,
/// taking a permit if so.
#[inline]
fn poll_core(value: &mut u32) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}

impl<Traits: Port> SemaphoreCb<Traits> {
    /// Construct a semaphore with the given initial count and ceiling.
    pub const fn new(initial: u32, max_value: u32) -> Self {
        Self {
            sync: SyncCb::new(),
            value: CpuLockCell::new(initial),
            max_value: CpuLockCell::new(max_value),
        }
    }
}

impl<Traits: Kernel> SemaphoreCb<Traits> {
    /// Register the semaphore with the kernel.
    pub fn init(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        wait::register(lock.borrow_mut(), &self.sync)
    }

    /// Unregister the semaphore. Fails while tasks are blocked on it.
    pub fn deinit(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        wait::unregister(lock.borrow_mut(), &self.sync)
    }

    /// Take one permit, blocking up to `timeout_ms` milliseconds
    /// (`0` = wait forever).
    pub fn wait(&'static self, timeout_ms: u32) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        let ticks = wait::prepare_wait::<Traits>(&lock, &self.sync, timeout_ms)?;

        if poll_core(self.value.write(lock.borrow_mut())) {
            return Ok(());
        }

        // The wake-upper transfers the permit directly, so a successful wait
        // needs no re-poll.
        wait::block_on(lock.borrow_mut(), &self.sync, ticks)
    }

    /// Take one permit without blocking; `TimedOut` when none is available.
    pub fn poll(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        if !self.sync.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }
        if poll_core(self.value.write(lock.borrow_mut())) {
            Ok(())
        } else {
            Err(Error::TimedOut)
        }
    }

    /// Release one permit. Never blocks and may be called from interrupt
    /// context. When a task is pending, the permit transfers to the
    /// highest-priority waiter, which preempts the caller if its priority is
    /// strictly higher.
    pub fn signal(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        if !self.sync.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }

        if self.signal_core(lock.borrow_mut())? {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// The release operation proper, usable while a critical section is
    /// already held. Returns `true` when a waiter was woken.
    pub(crate) fn signal_core(
        &'static self,
        lock: CpuLockGuardBorrowMut<'_, Traits>,
    ) -> Result<bool> {
        if wait::wake_up_one(&mut *lock, &self.sync).is_some() {
            return Ok(true);
        }

        let value = self.value.get(lock);
        if value >= self.max_value.get(lock) {
            return Err(Error::QueueOverflow);
        }
        self.value.replace(&mut *lock, value + 1);
        Ok(false)
    }

    /// The current permit count.
    pub fn count(&'static self) -> Result<u32> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.value.get(&lock))
    }

    /// Cancel `task`'s wait on this semaphore with the `Aborted` result.
    pub fn abort(&'static self, task: &'static TaskCb<Traits>) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        wait::abort_task(lock.borrow_mut(), &self.sync, task)?;
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}
