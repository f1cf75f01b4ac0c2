//! Mutexes with priority inheritance
use core::fmt;

use crate::{
    error::{Error, Result},
    klock::{lock_cpu, CpuLockCell},
    state,
    task::{self, TaskCb},
    utils::Init,
    wait::{self, SyncCb},
    Kernel, Port,
};

/// *Mutex control block* - the state data of a mutex.
///
/// Locking follows the priority-inheritance protocol: when a task blocks on
/// a mutex held by a lower-priority owner, the owner's effective priority is
/// raised to the blocker's; unlocking restores the owner to its base
/// priority and hands the mutex to the highest-priority waiter.
pub struct MutexCb<Traits: Port> {
    pub(crate) sync: SyncCb<Traits>,
    pub(crate) owner: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
}

impl<Traits: Port> Init for MutexCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sync: Init::INIT,
        owner: Init::INIT,
    };
}

impl<Traits: Kernel> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("owner", &self.owner)
            .finish()
    }
}

impl<Traits: Port> MutexCb<Traits> {
    pub const fn new() -> Self {
        Self {
            sync: SyncCb::new(),
            owner: CpuLockCell::new(None),
        }
    }
}

impl<Traits: Kernel> MutexCb<Traits> {
    /// Register the mutex with the kernel.
    pub fn init(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        wait::register(lock.borrow_mut(), &self.sync)
    }

    /// Unregister the mutex. Fails while tasks are blocked on it.
    pub fn deinit(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        wait::unregister(lock.borrow_mut(), &self.sync)?;
        self.owner.replace(lock.borrow_mut(), None);
        Ok(())
    }

    /// Acquire the mutex, blocking up to `timeout_ms` milliseconds
    /// (`0` = wait forever).
    pub fn lock(&'static self, timeout_ms: u32) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        let ticks = wait::prepare_wait::<Traits>(&lock, &self.sync, timeout_ms)?;
        let me = state::expect_waitable_context::<Traits>(&lock)?;

        match self.owner.get(&lock) {
            None => {
                self.owner.replace(lock.borrow_mut(), Some(me));
                Ok(())
            }
            Some(owner) if core::ptr::eq(owner, me) => Err(Error::MutexOwnerAcquire),
            Some(owner) => {
                // Inherit: the owner must not run at a lower priority than a
                // task it is making wait.
                let mine = me.effective_priority.get(&lock);
                if owner.effective_priority.get(&lock) > mine {
                    task::change_effective_priority(lock.borrow_mut(), owner, mine);
                }

                wait::block_on(lock.borrow_mut(), &self.sync, ticks)?;

                // `unlock` transferred ownership before readying us.
                debug_assert!(matches!(
                    self.owner.get(&lock),
                    Some(owner) if core::ptr::eq(owner, me)
                ));
                Ok(())
            }
        }
    }

    /// Acquire the mutex without blocking; `TimedOut` when it is held by
    /// another task.
    pub fn try_lock(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        if !self.sync.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }
        let me = state::expect_waitable_context::<Traits>(&lock)?;

        match self.owner.get(&lock) {
            None => {
                self.owner.replace(lock.borrow_mut(), Some(me));
                Ok(())
            }
            Some(owner) if core::ptr::eq(owner, me) => Err(Error::MutexOwnerAcquire),
            Some(_) => Err(Error::TimedOut),
        }
    }

    /// Release the mutex. Only the owning task may unlock; its inherited
    /// priority ends here.
    pub fn unlock(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        if !self.sync.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }
        let me = state::expect_waitable_context::<Traits>(&lock)?;

        match self.owner.get(&lock) {
            Some(owner) if core::ptr::eq(owner, me) => {}
            _ => return Err(Error::InvalidMutexOwner),
        }

        // Shed any inherited boost. The task re-enters the ready queue of
        // its base level at the tail, so equal-priority peers get their turn.
        let base = me.base_priority.get(&lock);
        if me.effective_priority.get(&lock) != base {
            task::change_effective_priority(lock.borrow_mut(), me, base);
        }

        // Hand the mutex to the highest-priority waiter, if any.
        let next_owner = wait::wake_up_one(lock.borrow_mut(), &self.sync);
        self.owner.replace(lock.borrow_mut(), next_owner);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Whether the mutex is currently held.
    pub fn is_locked(&'static self) -> Result<bool> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.owner.get(&lock).is_some())
    }

    /// Cancel `task`'s wait on this mutex with the `Aborted` result.
    pub fn abort(&'static self, task: &'static TaskCb<Traits>) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        wait::abort_task(lock.borrow_mut(), &self.sync, task)?;
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{boot_kernel, current_task_ptr, test_kernel};
    use crate::{Result, TaskConfig, TaskStack};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ok_entry() -> Result<()> {
        Ok(())
    }

    fn leak_task<Traits: Kernel>(priority: u8) -> &'static TaskCb<Traits> {
        static STACK: TaskStack<32> = TaskStack::new();
        Box::leak(Box::new(TaskCb::new(TaskConfig {
            name: "task",
            stack: STACK.words(),
            entry: ok_entry,
            exit_hook: None,
            priority,
        })))
    }

    #[test]
    fn lock_unlock_owner_tracking() {
        test_kernel!(Sys);
        static MTX: MutexCb<Sys> = MutexCb::new();
        MTX.init().unwrap();
        let a = leak_task::<Sys>(4);
        a.init().unwrap();
        boot_kernel!(Sys);

        assert!(!MTX.is_locked().unwrap());
        MTX.lock(0).unwrap();
        assert!(MTX.is_locked().unwrap());
        assert_eq!(MTX.lock(0), Err(Error::MutexOwnerAcquire));
        assert_eq!(MTX.try_lock(), Err(Error::MutexOwnerAcquire));
        MTX.unlock().unwrap();
        assert!(!MTX.is_locked().unwrap());
        assert_eq!(MTX.unlock(), Err(Error::InvalidMutexOwner));
    }

    #[test]
    fn unlock_by_non_owner_is_refused() {
        test_kernel!(Sys);
        static MTX: MutexCb<Sys> = MutexCb::new();
        MTX.init().unwrap();
        let low = leak_task::<Sys>(6);
        low.init().unwrap();
        boot_kernel!(Sys);

        // As `low`: take the mutex.
        assert_eq!(current_task_ptr::<Sys>(), Some(low as *const _));
        MTX.lock(0).unwrap();

        // A higher-priority task appears and preempts; it does not own the
        // mutex.
        let high = leak_task::<Sys>(2);
        high.init().unwrap();
        assert_eq!(current_task_ptr::<Sys>(), Some(high as *const _));
        assert_eq!(MTX.unlock(), Err(Error::InvalidMutexOwner));
        assert_eq!(MTX.try_lock(), Err(Error::TimedOut));
    }

    #[test]
    fn priority_inheritance_boosts_and_restores_the_owner() {
        test_kernel!(Sys);
        static MTX: MutexCb<Sys> = MutexCb::new();
        MTX.init().unwrap();
        let low = leak_task::<Sys>(5);
        low.init().unwrap();
        boot_kernel!(Sys);

        // As `low`: take the mutex.
        assert_eq!(current_task_ptr::<Sys>(), Some(low as *const _));
        MTX.lock(0).unwrap();

        // A higher-priority contender preempts and blocks on the mutex; the
        // test thread continues as `high`.
        let high = leak_task::<Sys>(1);
        high.init().unwrap();
        assert_eq!(current_task_ptr::<Sys>(), Some(high as *const _));

        static CHECKED_BOOST: AtomicBool = AtomicBool::new(false);
        let low_ref = low;
        let high_ref = high;
        set_world(move || {
            if !CHECKED_BOOST.swap(true, Ordering::SeqCst) {
                // While `high` waits, `low` runs with the inherited priority.
                assert_eq!(current_task_ptr::<Sys>(), Some(low_ref as *const _));
                assert_eq!(low_ref.priority().unwrap(), 1);

                // As `low`: release. The boost ends and ownership moves to
                // the highest-priority waiter before `unlock` returns.
                MTX.unlock().unwrap();
                assert_eq!(current_task_ptr::<Sys>(), Some(high_ref as *const _));
                assert_eq!(low_ref.priority().unwrap(), 5);
            }
        });

        MTX.lock(0).unwrap();
        assert_eq!(current_task_ptr::<Sys>(), Some(high as *const _));
        assert!(CHECKED_BOOST.load(Ordering::SeqCst));

        MTX.unlock().unwrap();
        MTX.deinit().unwrap();
    }
}
