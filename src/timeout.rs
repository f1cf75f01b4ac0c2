//! Timekeeping: the monotonic tick counter, the system-tick entry point,
//! and the task delay services.
use crate::{
    error::{Error, Result},
    klock::{lock_cpu, CpuLockToken},
    state, task, wait, Kernel,
};

/// A timeout measured in ticks. In a blocked task, `0` means "wait forever".
pub type Ticks = u32;

/// Convert a millisecond duration to ticks.
///
/// `ms * tick_freq_hz` must fit in the 32-bit tick representation. A
/// non-zero duration never converts to zero ticks.
pub(crate) fn ticks_from_ms<Traits: Kernel>(
    lock: &CpuLockToken<Traits>,
    ms: u32,
) -> Result<Ticks> {
    let hz = Traits::state().tick_freq_hz.get(lock);

    let product = u64::from(ms) * u64::from(hz);
    if product > u64::from(u32::MAX) {
        return Err(Error::SleepDurationOutOfRange);
    }

    let ticks = (product / 1_000) as Ticks;
    if ms != 0 && ticks == 0 {
        // Shorter than one tick period; round up so the wait is observable.
        return Ok(1);
    }
    Ok(ticks)
}

/// The entry point of the periodic system-tick interrupt.
///
/// Fixed ordering: user hook, tick increment, software-timer update,
/// sync-object timeout update, task delay update, round-robin rotation at
/// the running priority, scheduling decision.
pub(crate) fn os_tick<Traits: Kernel>() {
    let state = Traits::state();
    if !state.started() {
        return;
    }

    // The hook runs outside the critical section.
    let hook = {
        let Ok(lock) = lock_cpu::<Traits>() else {
            return;
        };
        state.tick_hook.get(&lock)
    };
    if let Some(hook) = hook {
        hook();
    }

    let Ok(mut lock) = lock_cpu::<Traits>() else {
        return;
    };

    let ticks = state.tick_count.get(&lock);
    state.tick_count.replace(lock.borrow_mut(), ticks + 1);

    #[cfg(feature = "software_timers")]
    crate::timer::tick_update(lock.borrow_mut());

    wait::update_timeouts(lock.borrow_mut());
    task::update_delayed(lock.borrow_mut());
    task::cycle_active(lock.borrow_mut());
    task::schedule(lock.borrow_mut());
}

/// The number of ticks elapsed since the kernel started.
pub(crate) fn tick_count<Traits: Kernel>() -> Result<u64> {
    let lock = lock_cpu::<Traits>()?;
    Ok(Traits::state().tick_count.get(&lock))
}

/// The uptime in milliseconds: `ticks * 1000 / tick_freq_hz`.
pub(crate) fn time_ms<Traits: Kernel>() -> Result<u64> {
    let lock = lock_cpu::<Traits>()?;
    let state = Traits::state();
    let ticks = state.tick_count.get(&lock);
    let hz = state.tick_freq_hz.get(&lock);
    if hz == 0 {
        return Err(Error::OsOffline);
    }
    Ok(ticks.saturating_mul(1_000) / u64::from(hz))
}

/// Put the running task to sleep for `ms` milliseconds. `delay(0)` is a
/// no-op. The task transitions to the yielded queue atomically with respect
/// to the tick interrupt; the critical section ends only once the next task
/// is dispatched.
pub(crate) fn delay<Traits: Kernel>(ms: u32) -> Result<()> {
    let mut lock = lock_cpu::<Traits>()?;
    let task = state::expect_waitable_context::<Traits>(&lock)?;
    let ticks = ticks_from_ms::<Traits>(&lock, ms)?;
    if ticks == 0 {
        return Ok(());
    }

    task::yield_task(lock.borrow_mut(), task);
    task.timeout.replace(lock.borrow_mut(), ticks);
    task::schedule(lock.borrow_mut());
    task::wait_until_woken_up(lock.borrow_mut(), task);
    Ok(())
}

/// A sleep duration broken into calendar-ish components. All components are
/// summed; omitted fields default to zero.
///
/// ```rust,ignore
/// Sys::sleep(SleepDuration { sec: 2, ..Default::default() })?;
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SleepDuration {
    pub ms: u32,
    pub sec: u32,
    pub min: u32,
    pub hr: u32,
    pub days: u32,
}

impl SleepDuration {
    /// Total duration in milliseconds, overflow-checked.
    pub(crate) fn total_ms(self) -> Result<u32> {
        let mut total = self.ms;
        for (count, unit_ms) in [
            (self.sec, 1_000),
            (self.min, 60_000),
            (self.hr, 3_600_000),
            (self.days, 86_400_000),
        ] {
            let contribution = count
                .checked_mul(unit_ms)
                .ok_or(Error::SleepDurationOutOfRange)?;
            total = total
                .checked_add(contribution)
                .ok_or(Error::SleepDurationOutOfRange)?;
        }
        Ok(total)
    }
}

/// Sleep for the given composite duration.
pub(crate) fn sleep<Traits: Kernel>(duration: SleepDuration) -> Result<()> {
    delay::<Traits>(duration.total_ms()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{boot_kernel, current_task_ptr, task_state, test_kernel};
    use crate::{Kernel, KernelCfg, TaskCb, TaskConfig, TaskSt, TaskStack};
    use std::sync::atomic::{AtomicU32, Ordering};

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
    fn delay_wakes_after_exact_tick_count() {
        test_kernel!(Sys);
        let a = leak_task::<Sys>(1);
        a.init().unwrap();
        boot_kernel!(Sys);

        static TICKS_DRIVEN: AtomicU32 = AtomicU32::new(0);
        set_world(|| {
            TICKS_DRIVEN.fetch_add(1, Ordering::SeqCst);
            Sys::os_tick();
        });

        Sys::delay(10).unwrap();
        assert_eq!(TICKS_DRIVEN.load(Ordering::SeqCst), 10);
        assert_eq!(current_task_ptr::<Sys>(), Some(a as *const _));
        assert_eq!(Sys::tick_count().unwrap(), 10);
    }

    #[test]
    fn delay_zero_is_a_no_op() {
        test_kernel!(Sys);
        let a = leak_task::<Sys>(1);
        a.init().unwrap();
        boot_kernel!(Sys);

        set_world(|| panic!("delay(0) must not offer the processor"));
        Sys::delay(0).unwrap();
        assert_eq!(current_task_ptr::<Sys>(), Some(a as *const _));
        assert_eq!(task_state(a), TaskSt::Running);
        assert_eq!(Sys::tick_count().unwrap(), 0);
    }

    #[test]
    fn delay_needs_the_kernel_started() {
        test_kernel!(Sys);
        assert_eq!(Sys::delay(1), Err(Error::OsOffline));
    }

    #[test]
    fn delay_rejects_interrupt_context() {
        test_kernel!(Sys);
        let a = leak_task::<Sys>(1);
        a.init().unwrap();
        boot_kernel!(Sys);

        set_isr_context(true);
        assert_eq!(Sys::delay(1), Err(Error::IllegalInterruptAccess));
        set_isr_context(false);
    }

    #[test]
    fn delay_rejects_the_idle_task() {
        test_kernel!(Sys);
        boot_kernel!(Sys);

        // Park the service tasks so the idle task is the running one.
        #[cfg(feature = "software_timers")]
        Sys::state().timer.task.suspend().unwrap();

        let idle: &'static TaskCb<Sys> = &Sys::state().idle_task;
        assert_eq!(current_task_ptr::<Sys>(), Some(idle as *const _));
        assert_eq!(Sys::delay(1), Err(Error::IllegalIdleTask));
        // The idle task keeps running.
        assert_eq!(current_task_ptr::<Sys>(), Some(idle as *const _));
        assert_eq!(task_state(idle), TaskSt::Running);
    }

    #[test]
    fn delay_range_check() {
        test_kernel!(Sys);
        let a = leak_task::<Sys>(1);
        a.init().unwrap();
        boot_kernel!(Sys);

        // 1 kHz tick: the product must fit in 32 bits of ticks.
        assert_eq!(
            Sys::delay(u32::MAX),
            Err(Error::SleepDurationOutOfRange)
        );
    }

    #[test]
    fn sub_tick_durations_round_up_to_one_tick() {
        test_kernel!(Sys);
        let mut lock = crate::klock::lock_cpu::<Sys>().unwrap();
        Sys::state().tick_freq_hz.replace(lock.borrow_mut(), 100);

        assert_eq!(ticks_from_ms::<Sys>(&lock, 0), Ok(0));
        assert_eq!(ticks_from_ms::<Sys>(&lock, 1), Ok(1));
        assert_eq!(ticks_from_ms::<Sys>(&lock, 10), Ok(1));
        assert_eq!(ticks_from_ms::<Sys>(&lock, 25), Ok(2));
        assert_eq!(
            ticks_from_ms::<Sys>(&lock, u32::MAX),
            Err(Error::SleepDurationOutOfRange)
        );
    }

    #[test]
    fn tick_hook_runs_every_tick() {
        test_kernel!(Sys);
        let a = leak_task::<Sys>(1);
        a.init().unwrap();

        static HOOK_CALLS: AtomicU32 = AtomicU32::new(0);
        fn hook() {
            HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
        }

        static IDLE_STACK: crate::TaskStack<64> = crate::TaskStack::new();
        #[cfg(feature = "software_timers")]
        static TIMER_STACK: crate::TaskStack<64> = crate::TaskStack::new();
        Sys::boot(crate::StartupConfig {
            tick_freq_hz: 1_000,
            idle_stack: IDLE_STACK.words(),
            tick_hook: Some(hook),
            #[cfg(feature = "software_timers")]
            timer_task_priority: 30,
            #[cfg(feature = "software_timers")]
            timer_task_stack: TIMER_STACK.words(),
        });

        for _ in 0..3 {
            Sys::os_tick();
        }
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 3);
        assert_eq!(Sys::tick_count().unwrap(), 3);
        assert_eq!(Sys::time_ms().unwrap(), 3);
    }

    #[test]
    fn sleep_duration_conversion() {
        assert_eq!(SleepDuration::default().total_ms(), Ok(0));
        assert_eq!(
            SleepDuration {
                ms: 5,
                sec: 2,
                min: 3,
                hr: 1,
                days: 0,
            }
            .total_ms(),
            Ok(5 + 2_000 + 180_000 + 3_600_000)
        );
        assert_eq!(
            SleepDuration {
                days: 50,
                ..Default::default()
            }
            .total_ms(),
            Ok(50 * 86_400_000)
        );
        assert_eq!(
            SleepDuration {
                days: u32::MAX,
                ..Default::default()
            }
            .total_ms(),
            Err(Error::SleepDurationOutOfRange)
        );
    }
}
