//! Software timers
//!
//! A sorted list of running timers is decremented by the tick handler;
//! timers reaching zero move to an expired list and a semaphore is posted.
//! A dedicated timer task drains the expired list and runs the callbacks,
//! so callbacks execute in task context with interrupts enabled.
use core::fmt;

use crate::{
    error::{Error, Result},
    klock::{assume_cpu_lock, lock_cpu, CpuLockCell, CpuLockGuardBorrowMut},
    semaphore::SemaphoreCb,
    task::TaskCb,
    timeout::{ticks_from_ms, Ticks},
    utils::Init,
    Kernel, Port,
};

/// Timer state machine: idle -> running (`start`), running -> expired
/// (tick), expired -> running (autoreload) or idle (one-shot), running ->
/// idle (`cancel`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Running,
    Expired,
}

impl Init for TimerState {
    const INIT: Self = Self::Idle;
}

/// A timer callback. Runs in the timer task's context; blocking kernel
/// services fail with `IllegalTimerTask` while it executes.
pub type TimerCallback<Traits> = fn(&'static TimerCb<Traits>);

/// *Timer control block* - the state data of a software timer.
pub struct TimerCb<Traits: Port> {
    pub(crate) name: CpuLockCell<Traits, &'static str>,
    pub(crate) callback: CpuLockCell<Traits, Option<TimerCallback<Traits>>>,

    /// The configured period in milliseconds.
    pub(crate) timeout_ms: CpuLockCell<Traits, u32>,

    /// The configured period in ticks, captured at `start`.
    pub(crate) timeout_ticks: CpuLockCell<Traits, Ticks>,

    /// Ticks left until expiry while running.
    pub(crate) remaining: CpuLockCell<Traits, Ticks>,

    pub(crate) autoreload: CpuLockCell<Traits, bool>,

    pub(crate) st: CpuLockCell<Traits, TimerState>,

    /// Links into the sorted running list (both) or the expired list
    /// (`next` only).
    pub(crate) prev: CpuLockCell<Traits, Option<&'static TimerCb<Traits>>>,
    pub(crate) next: CpuLockCell<Traits, Option<&'static TimerCb<Traits>>>,
}

impl<Traits: Port> Init for TimerCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        name: Init::INIT,
        callback: Init::INIT,
        timeout_ms: Init::INIT,
        timeout_ticks: Init::INIT,
        remaining: Init::INIT,
        autoreload: Init::INIT,
        st: Init::INIT,
        prev: Init::INIT,
        next: Init::INIT,
    };
}

impl<Traits: Kernel> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("remaining", &self.remaining)
            .field("autoreload", &self.autoreload)
            .field("st", &self.st)
            .finish()
    }
}

/// The timer service's share of the kernel state.
pub(crate) struct TimerGlobals<Traits: Port> {
    /// Running timers, sorted by remaining time (non-decreasing).
    pub(crate) running_head: CpuLockCell<Traits, Option<&'static TimerCb<Traits>>>,

    /// Expired timers awaiting the timer task, oldest first.
    pub(crate) expired_head: CpuLockCell<Traits, Option<&'static TimerCb<Traits>>>,
    pub(crate) expired_tail: CpuLockCell<Traits, Option<&'static TimerCb<Traits>>>,

    /// Posted once per expired timer by the tick handler.
    pub(crate) sem: SemaphoreCb<Traits>,

    /// The dedicated timer task.
    pub(crate) task: TaskCb<Traits>,

    /// True while a timer callback executes.
    pub(crate) in_callback: CpuLockCell<Traits, bool>,
}

impl<Traits: Port> Init for TimerGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        running_head: Init::INIT,
        expired_head: Init::INIT,
        expired_tail: Init::INIT,
        sem: Init::INIT,
        task: Init::INIT,
        in_callback: Init::INIT,
    };
}

impl<Traits: Port> TimerCb<Traits> {
    /// Construct a timer. Its period is configured with
    /// [`set`](Self::set) before the first [`start`](Self::start).
    pub const fn new(name: &'static str, callback: TimerCallback<Traits>) -> Self {
        Self {
            name: CpuLockCell::new(name),
            callback: CpuLockCell::new(Some(callback)),
            timeout_ms: CpuLockCell::new(0),
            timeout_ticks: CpuLockCell::new(0),
            remaining: CpuLockCell::new(0),
            autoreload: CpuLockCell::new(false),
            st: Init::INIT,
            prev: Init::INIT,
            next: Init::INIT,
        }
    }
}

impl<Traits: Kernel> TimerCb<Traits> {
    /// Configure the period and reload behavior. The timer must not be
    /// running.
    pub fn set(&'static self, timeout_ms: u32, autoreload: bool) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        if self.st.get(&lock) == TimerState::Running {
            return Err(Error::TimerRunning);
        }
        if timeout_ms == 0 {
            return Err(Error::TimeoutCannotBeZero);
        }

        self.timeout_ms.replace(lock.borrow_mut(), timeout_ms);
        self.autoreload.replace(lock.borrow_mut(), autoreload);
        Ok(())
    }

    /// Arm the timer with its configured period.
    pub fn start(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        if !Traits::state().started() {
            return Err(Error::OsOffline);
        }
        if self.st.get(&lock) != TimerState::Idle {
            return Err(Error::TimerRunning);
        }
        let timeout_ms = self.timeout_ms.get(&lock);
        if timeout_ms == 0 {
            return Err(Error::TimeoutCannotBeZero);
        }

        let ticks = ticks_from_ms::<Traits>(&lock, timeout_ms)?;
        self.timeout_ticks.replace(lock.borrow_mut(), ticks);
        self.remaining.replace(lock.borrow_mut(), ticks);
        self.st.replace(lock.borrow_mut(), TimerState::Running);
        running_insert(lock.borrow_mut(), self);
        Ok(())
    }

    /// Rewind the timer to its full period, arming it if it was idle.
    pub fn restart(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        if self.st.get(&lock) == TimerState::Running {
            running_remove(lock.borrow_mut(), self);
            let ticks = self.timeout_ticks.get(&lock);
            self.remaining.replace(lock.borrow_mut(), ticks);
            running_insert(lock.borrow_mut(), self);
            return Ok(());
        }
        drop(lock);
        self.start()
    }

    /// Disarm a running timer.
    pub fn cancel(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        if self.st.get(&lock) != TimerState::Running {
            return Err(Error::TimerNotRunning);
        }

        running_remove(lock.borrow_mut(), self);
        self.st.replace(lock.borrow_mut(), TimerState::Idle);
        Ok(())
    }

    /// Milliseconds left until expiry (zero when not running).
    pub fn remaining_ms(&'static self) -> Result<u32> {
        let lock = lock_cpu::<Traits>()?;
        if self.st.get(&lock) != TimerState::Running {
            return Ok(0);
        }
        let hz = Traits::state().tick_freq_hz.get(&lock);
        if hz == 0 {
            return Err(Error::OsOffline);
        }
        let remaining = u64::from(self.remaining.get(&lock));
        Ok((remaining.saturating_mul(1_000) / u64::from(hz)) as u32)
    }

    pub fn state(&'static self) -> Result<TimerState> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.st.get(&lock))
    }
}

/// Insert `timer` into the running list, keeping remaining times
/// non-decreasing (FIFO among equals).
fn running_insert<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    timer: &'static TimerCb<Traits>,
) {
    let globals = &Traits::state().timer;
    let remaining = timer.remaining.get(lock);

    let mut prev: Option<&'static TimerCb<Traits>> = None;
    let mut cursor = globals.running_head.get(lock);
    while let Some(candidate) = cursor {
        if candidate.remaining.get(lock) > remaining {
            break;
        }
        prev = Some(candidate);
        cursor = candidate.next.get(lock);
    }

    timer.prev.replace(&mut *lock, prev);
    timer.next.replace(&mut *lock, cursor);
    match prev {
        Some(prev) => {
            prev.next.replace(&mut *lock, Some(timer));
        }
        None => {
            globals.running_head.replace(&mut *lock, Some(timer));
        }
    }
    if let Some(cursor) = cursor {
        cursor.prev.replace(&mut *lock, Some(timer));
    }
}

/// Unlink `timer` from the running list.
fn running_remove<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    timer: &'static TimerCb<Traits>,
) {
    let globals = &Traits::state().timer;
    let prev = timer.prev.replace(&mut *lock, None);
    let next = timer.next.replace(&mut *lock, None);
    match prev {
        Some(prev) => {
            prev.next.replace(&mut *lock, next);
        }
        None => {
            globals.running_head.replace(&mut *lock, next);
        }
    }
    if let Some(next) = next {
        next.prev.replace(&mut *lock, prev);
    }
}

/// Append `timer` to the expired list.
fn expired_push<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    timer: &'static TimerCb<Traits>,
) {
    let globals = &Traits::state().timer;
    timer.prev.replace(&mut *lock, None);
    timer.next.replace(&mut *lock, None);
    match globals.expired_tail.replace(&mut *lock, Some(timer)) {
        Some(tail) => {
            tail.next.replace(&mut *lock, Some(timer));
        }
        None => {
            globals.expired_head.replace(&mut *lock, Some(timer));
        }
    }
}

/// Detach the oldest expired timer.
fn expired_pop<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
) -> Option<&'static TimerCb<Traits>> {
    let globals = &Traits::state().timer;
    let timer = globals.expired_head.get(lock)?;
    let next = timer.next.replace(&mut *lock, None);
    globals.expired_head.replace(&mut *lock, next);
    if next.is_none() {
        globals.expired_tail.replace(&mut *lock, None);
    }
    Some(timer)
}

/// The timer share of the tick handler: decrement every running timer, move
/// the expired ones over, and post the service semaphore once per expiry.
pub(crate) fn tick_update<Traits: Kernel>(lock: CpuLockGuardBorrowMut<'_, Traits>) {
    let globals = &Traits::state().timer;

    let mut cursor = globals.running_head.get(lock);
    while let Some(timer) = cursor {
        cursor = timer.next.get(lock);

        let remaining = timer.remaining.get(lock).saturating_sub(1);
        timer.remaining.replace(&mut *lock, remaining);
        if remaining == 0 {
            running_remove(&mut *lock, timer);
            timer.st.replace(&mut *lock, TimerState::Expired);
            expired_push(&mut *lock, timer);

            // The ceiling is effectively unbounded; a failed post would only
            // mean the expired list is drained slightly later.
            let _ = globals.sem.signal_core(&mut *lock);
        }
    }
}

/// The timer task's subroutine: wait for expiries and run the callbacks.
pub(crate) fn timer_task_entry<Traits: Kernel>() -> Result<()> {
    loop {
        Traits::state().timer.sem.wait(0)?;
        process_one_expired::<Traits>();
    }
}

/// Drain one entry from the expired list: run its callback with the lock
/// released, then reload or retire the timer.
pub(crate) fn process_one_expired<Traits: Kernel>() {
    let mut lock = lock_cpu::<Traits>().unwrap_or_else(|_| unsafe {
        // Safety: If the lock is held, it is held by this context.
        assume_cpu_lock::<Traits>()
    });
    let globals = &Traits::state().timer;

    let Some(timer) = expired_pop(lock.borrow_mut()) else {
        return;
    };
    let callback = timer.callback.get(&lock);
    globals.in_callback.replace(lock.borrow_mut(), true);

    // Release CPU Lock before calling the application-provided callback
    // function
    drop(lock);

    if let Some(callback) = callback {
        callback(timer);
    }

    // Re-acquire CPU Lock
    let mut lock = lock_cpu::<Traits>().unwrap_or_else(|_| unsafe { assume_cpu_lock::<Traits>() });
    globals.in_callback.replace(lock.borrow_mut(), false);

    if timer.st.get(&lock) == TimerState::Expired {
        if timer.autoreload.get(&lock) {
            let ticks = timer.timeout_ticks.get(&lock);
            timer.remaining.replace(lock.borrow_mut(), ticks);
            timer.st.replace(lock.borrow_mut(), TimerState::Running);
            running_insert(lock.borrow_mut(), timer);
        } else {
            timer.st.replace(lock.borrow_mut(), TimerState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{boot_kernel, test_kernel};
    use crate::KernelCfg;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn nop_callback<Traits: Port>(_timer: &'static TimerCb<Traits>) {}

    fn leak_timer<Traits: Kernel>() -> &'static TimerCb<Traits> {
        Box::leak(Box::new(TimerCb::new("timer", nop_callback)))
    }

    #[test]
    fn state_machine_guards() {
        test_kernel!(Sys);
        let timer = leak_timer::<Sys>();
        boot_kernel!(Sys);

        assert_eq!(timer.cancel(), Err(Error::TimerNotRunning));
        assert_eq!(timer.start(), Err(Error::TimeoutCannotBeZero));
        assert_eq!(timer.set(0, false), Err(Error::TimeoutCannotBeZero));

        timer.set(5, false).unwrap();
        timer.start().unwrap();
        assert_eq!(timer.state().unwrap(), TimerState::Running);
        assert_eq!(timer.start(), Err(Error::TimerRunning));
        assert_eq!(timer.set(7, false), Err(Error::TimerRunning));

        timer.cancel().unwrap();
        assert_eq!(timer.state().unwrap(), TimerState::Idle);
    }

    #[test]
    fn start_requires_a_running_kernel() {
        test_kernel!(Sys);
        let timer = leak_timer::<Sys>();
        timer.set(5, false).unwrap();
        assert_eq!(timer.start(), Err(Error::OsOffline));
    }

    #[test]
    fn one_shot_expires_and_goes_idle() {
        test_kernel!(Sys);
        let timer = leak_timer::<Sys>();
        boot_kernel!(Sys);

        timer.set(3, false).unwrap();
        timer.start().unwrap();
        assert_eq!(timer.remaining_ms().unwrap(), 3);

        Sys::os_tick();
        Sys::os_tick();
        assert_eq!(timer.state().unwrap(), TimerState::Running);
        assert_eq!(timer.remaining_ms().unwrap(), 1);

        Sys::os_tick();
        assert_eq!(timer.state().unwrap(), TimerState::Expired);
        // One expiry was posted to the service semaphore.
        assert_eq!(Sys::state().timer.sem.count().unwrap(), 1);

        process_one_expired::<Sys>();
        assert_eq!(timer.state().unwrap(), TimerState::Idle);
        assert_eq!(timer.remaining_ms().unwrap(), 0);
    }

    #[test]
    fn autoreload_rearms_with_the_original_period() {
        test_kernel!(Sys);
        let timer = leak_timer::<Sys>();
        boot_kernel!(Sys);

        timer.set(2, true).unwrap();
        timer.start().unwrap();

        for _ in 0..2 {
            Sys::os_tick();
        }
        assert_eq!(timer.state().unwrap(), TimerState::Expired);

        process_one_expired::<Sys>();
        assert_eq!(timer.state().unwrap(), TimerState::Running);
        assert_eq!(timer.remaining_ms().unwrap(), 2);
    }

    #[test]
    fn callbacks_run_with_blocking_services_fenced_off() {
        test_kernel!(Sys);

        static CALLBACK_RESULT: AtomicU32 = AtomicU32::new(0);
        fn probing_callback<Traits: Kernel>(_timer: &'static TimerCb<Traits>) {
            // Blocking from a timer callback must be refused.
            let result = Traits::delay(1);
            CALLBACK_RESULT.store(
                match result {
                    Err(Error::IllegalTimerTask) => 1,
                    _ => 2,
                },
                Ordering::SeqCst,
            );
        }

        let timer: &'static TimerCb<Sys> =
            Box::leak(Box::new(TimerCb::new("probe", probing_callback)));
        boot_kernel!(Sys);

        timer.set(1, false).unwrap();
        timer.start().unwrap();
        Sys::os_tick();
        assert_eq!(timer.state().unwrap(), TimerState::Expired);

        // The test thread stands in for the timer task here.
        process_one_expired::<Sys>();
        assert_eq!(CALLBACK_RESULT.load(Ordering::SeqCst), 1);
        assert_eq!(timer.state().unwrap(), TimerState::Idle);
    }

    #[test]
    fn running_list_stays_sorted_by_remaining_time() {
        test_kernel!(Sys);
        let slow = leak_timer::<Sys>();
        let fast = leak_timer::<Sys>();
        let mid = leak_timer::<Sys>();
        boot_kernel!(Sys);

        slow.set(9, false).unwrap();
        fast.set(2, false).unwrap();
        mid.set(5, false).unwrap();
        slow.start().unwrap();
        fast.start().unwrap();
        mid.start().unwrap();

        let lock = crate::klock::lock_cpu::<Sys>().unwrap();
        let mut cursor = Sys::state().timer.running_head.get(&lock);
        let mut last = 0;
        let mut seen = 0;
        while let Some(timer) = cursor {
            let remaining = timer.remaining.get(&lock);
            assert!(remaining >= last);
            last = remaining;
            seen += 1;
            cursor = timer.next.get(&lock);
        }
        assert_eq!(seen, 3);
        assert!(core::ptr::eq(
            Sys::state().timer.running_head.get(&lock).unwrap(),
            fast
        ));
    }

    #[test]
    fn cancel_unlinks_from_the_middle_of_the_running_list() {
        test_kernel!(Sys);
        let slow = leak_timer::<Sys>();
        let fast = leak_timer::<Sys>();
        let mid = leak_timer::<Sys>();
        boot_kernel!(Sys);

        slow.set(9, false).unwrap();
        fast.set(2, false).unwrap();
        mid.set(5, false).unwrap();
        slow.start().unwrap();
        fast.start().unwrap();
        mid.start().unwrap();

        mid.cancel().unwrap();

        let lock = crate::klock::lock_cpu::<Sys>().unwrap();
        let mut cursor = Sys::state().timer.running_head.get(&lock);
        let mut seen = Vec::new();
        while let Some(timer) = cursor {
            seen.push(timer as *const TimerCb<Sys>);
            cursor = timer.next.get(&lock);
        }
        assert_eq!(seen, vec![fast as *const _, slow as *const _]);
    }

    #[test]
    fn restart_rewinds_a_running_timer() {
        test_kernel!(Sys);
        let timer = leak_timer::<Sys>();
        boot_kernel!(Sys);

        timer.set(4, false).unwrap();
        timer.start().unwrap();
        Sys::os_tick();
        Sys::os_tick();
        assert_eq!(timer.remaining_ms().unwrap(), 2);

        timer.restart().unwrap();
        assert_eq!(timer.remaining_ms().unwrap(), 4);
        assert_eq!(timer.state().unwrap(), TimerState::Running);
    }
}
