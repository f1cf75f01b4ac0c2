//! The blocking protocol shared by every synchronization object: a registry
//! of initialized objects, a priority-sorted pending queue per object, and
//! the block / timeout / abort state machine.
use crate::{
    error::{Error, Result},
    klock::{CpuLockCell, CpuLockGuardBorrowMut, CpuLockToken},
    state,
    task::{self, queue::TaskQueue, TaskCb, TaskSt},
    timeout::Ticks,
    utils::Init,
    Kernel, Port,
};

/// The part of a synchronization object the kernel core manages: the pending
/// task queue, the registry link, and the init flag. Embedded in every
/// concrete primitive's control block.
pub(crate) struct SyncCb<Traits: Port> {
    /// Tasks blocked on the object, sorted so the head is the
    /// highest-priority waiter (FIFO among equals).
    pub(crate) pending: TaskQueue<Traits>,

    pub(crate) registry_next: CpuLockCell<Traits, Option<&'static SyncCb<Traits>>>,

    pub(crate) initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: Port> Init for SyncCb<Traits> {
    const INIT: Self = Self {
        pending: Init::INIT,
        registry_next: Init::INIT,
        initialized: Init::INIT,
    };
}

impl<Traits: Port> SyncCb<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            pending: Init::INIT,
            registry_next: Init::INIT,
            initialized: Init::INIT,
        }
    }
}

/// Link a sync object into the kernel registry.
pub(crate) fn register<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    sync: &'static SyncCb<Traits>,
) -> Result<()> {
    if sync.initialized.get(lock) {
        return Err(Error::Reinitialized);
    }

    let state = Traits::state();
    let head = state.sync_registry.replace(&mut *lock, Some(sync));
    sync.registry_next.replace(&mut *lock, head);
    sync.initialized.replace(&mut *lock, true);
    Ok(())
}

/// Unlink a sync object from the kernel registry.
pub(crate) fn unregister<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    sync: &'static SyncCb<Traits>,
) -> Result<()> {
    if !sync.initialized.get(lock) {
        return Err(Error::Uninitialized);
    }
    if !sync.pending.is_empty(lock) {
        return Err(Error::TaskPendingOnSync);
    }

    let state = Traits::state();
    let mut cursor = state.sync_registry.get(lock);
    if let Some(head) = cursor {
        if core::ptr::eq(head, sync) {
            let next = sync.registry_next.get(lock);
            state.sync_registry.replace(&mut *lock, next);
            cursor = None;
        }
    }
    while let Some(entry) = cursor {
        let next = entry.registry_next.get(lock);
        if let Some(next) = next {
            if core::ptr::eq(next, sync) {
                let new_next = sync.registry_next.get(lock);
                entry.registry_next.replace(&mut *lock, new_next);
                break;
            }
        }
        cursor = next;
    }

    sync.registry_next.replace(&mut *lock, None);
    sync.initialized.replace(&mut *lock, false);
    Ok(())
}

/// Block the running task on `sync`.
///
/// The task is moved from its ready queue into the object's pending queue
/// (priority-sorted), the timeout is armed (`0` = wait forever), and the
/// processor is handed over. Returns once the task runs again, translating
/// the per-task completion flags: `TimedOut`, `Aborted`, or success.
///
/// The caller must have validated the context with
/// [`state::expect_waitable_context`].
pub(crate) fn block_on<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    sync: &'static SyncCb<Traits>,
    timeout: Ticks,
) -> Result<()> {
    let popped = task::pop_running(&mut *lock);
    let Some(task) = popped else {
        return Err(Error::RunningTaskNull);
    };
    debug_assert!(crate::utils::ptr_eq_opt(
        Traits::state().current_task.get(lock),
        Some(task)
    ));

    sync.pending.insert_sorted(&mut *lock, task);
    task.timeout.replace(&mut *lock, timeout);
    task.st.replace(&mut *lock, TaskSt::Blocked);

    task::schedule(&mut *lock);
    task::wait_until_woken_up(&mut *lock, task);

    if task.wait.timed_out.replace(&mut *lock, false) {
        return Err(Error::TimedOut);
    }
    if task.wait.aborted.replace(&mut *lock, false) {
        return Err(Error::Aborted);
    }
    Ok(())
}

/// Wake the highest-priority waiter of `sync`, if any. The woken task leaves
/// the pending queue and becomes ready; the caller decides whether to check
/// for preemption.
pub(crate) fn wake_up_one<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    sync: &'static SyncCb<Traits>,
) -> Option<&'static TaskCb<Traits>> {
    let task = sync.pending.front(lock)?;
    task::ready_task(&mut *lock, task);
    Some(task)
}

/// Walk every pending queue in the registry, decrement the armed timeouts,
/// and expire waiters that reach zero. Called once per tick.
pub(crate) fn update_timeouts<Traits: Kernel>(lock: CpuLockGuardBorrowMut<'_, Traits>) {
    let state = Traits::state();
    let mut object = state.sync_registry.get(lock);

    while let Some(sync) = object {
        object = sync.registry_next.get(lock);

        let mut cursor = sync.pending.front(lock);
        while let Some(task) = cursor {
            cursor = task.links.next.get(lock);

            let remaining = task.timeout.get(lock);
            if remaining == 0 {
                // Waiting forever.
                continue;
            }
            let remaining = remaining - 1;
            task.timeout.replace(&mut *lock, remaining);
            if remaining == 0 {
                task.wait.timed_out.replace(&mut *lock, true);
                task::ready_task(&mut *lock, task);
            }
        }
    }
}

/// Cancel a specific task's wait on `sync` with the `Aborted` result. Legal
/// from any task or interrupt context.
pub(crate) fn abort_task<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    sync: &'static SyncCb<Traits>,
    aborted: &'static TaskCb<Traits>,
) -> Result<()> {
    if !sync.initialized.get(lock) {
        return Err(Error::Uninitialized);
    }

    match aborted.links.owner.get(lock) {
        Some(queue) if core::ptr::eq(queue, &sync.pending) => {}
        _ => return Err(Error::TaskNotBlockedBySync),
    }

    aborted.wait.aborted.replace(&mut *lock, true);
    task::ready_task(&mut *lock, aborted);
    Ok(())
}

/// Convert a millisecond timeout to ticks, validating the range. `0` stays
/// `0` ("wait forever").
pub(crate) fn timeout_ticks<Traits: Kernel>(
    lock: &CpuLockToken<Traits>,
    timeout_ms: u32,
) -> Result<Ticks> {
    crate::timeout::ticks_from_ms::<Traits>(lock, timeout_ms)
}

/// Shared front half of every blocking acquire: context validation plus
/// timeout conversion.
pub(crate) fn prepare_wait<Traits: Kernel>(
    lock: &CpuLockToken<Traits>,
    sync: &SyncCb<Traits>,
    timeout_ms: u32,
) -> Result<Ticks> {
    if !sync.initialized.get(lock) {
        return Err(Error::Uninitialized);
    }
    state::expect_waitable_context::<Traits>(lock)?;
    timeout_ticks::<Traits>(lock, timeout_ms)
}
