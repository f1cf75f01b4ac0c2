//! Event groups
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

/// The bit state of an event group.
pub type EventBits = u32;

/// How a waiter's bit mask is matched against the event group state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTrigger {
    /// Every masked bit is set.
    AllSet,
    /// At least one masked bit is set.
    AnySet,
    /// Every masked bit is clear.
    AllClear,
    /// At least one masked bit is clear.
    AnyClear,
}

impl Init for EventTrigger {
    const INIT: Self = Self::AnySet;
}

/// Check a wait condition against the current bit state.
#[inline]
fn condition_met(bits: EventBits, mask: EventBits, trigger: EventTrigger) -> bool {
    match trigger {
        EventTrigger::AllSet => bits & mask == mask,
        EventTrigger::AnySet => bits & mask != 0,
        EventTrigger::AllClear => bits & mask == 0,
        EventTrigger::AnyClear => bits & mask != mask,
    }
}

/// *Event group control block* - the state data of an event group.
pub struct EventGroupCb<Traits: Port> {
    pub(crate) sync: SyncCb<Traits>,
    pub(crate) bits: CpuLockCell<Traits, EventBits>,
}

impl<Traits: Port> Init for EventGroupCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sync: Init::INIT,
        bits: Init::INIT,
    };
}

impl<Traits: Kernel> fmt::Debug for EventGroupCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventGroupCb")
            .field("self", &(self as *const _))
            .field("bits", &self.bits)
            .finish()
    }
}

impl<Traits: Port> EventGroupCb<Traits> {
    pub const fn new() -> Self {
        Self {
            sync: SyncCb::new(),
            bits: CpuLockCell::new(0),
        }
    }
}

impl<Traits: Kernel> EventGroupCb<Traits> {
    /// Register the event group with the kernel.
    pub fn init(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        wait::register(lock.borrow_mut(), &self.sync)
    }

    /// Unregister the event group. Fails while tasks are blocked on it.
    pub fn deinit(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        wait::unregister(lock.borrow_mut(), &self.sync)
    }

    /// Set the given bits, waking every waiter whose condition becomes
    /// satisfied. Never blocks and may be called from interrupt context.
    pub fn set(&'static self, bits: EventBits) -> Result<()> {
        self.update(|state| state | bits)
    }

    /// Clear the given bits. Clearing can satisfy `AllClear` / `AnyClear`
    /// waiters, so pending conditions are re-evaluated here too.
    pub fn clear(&'static self, bits: EventBits) -> Result<()> {
        self.update(|state| state & !bits)
    }

    fn update(&'static self, f: impl FnOnce(EventBits) -> EventBits) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;
        if !self.sync.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }

        let new_bits = f(self.bits.get(&lock));
        self.bits.replace(lock.borrow_mut(), new_bits);

        // Wake the waiters whose conditions are now fulfilled, recording the
        // triggering bit state for each.
        let mut woke_any = false;
        let mut cursor = self.sync.pending.front(&lock);
        while let Some(waiter) = cursor {
            cursor = waiter.links.next.get(&lock);

            let mask = waiter.wait.event_bits.get(&lock);
            let trigger = waiter.wait.event_trigger.get(&lock);
            if condition_met(new_bits, mask, trigger) {
                waiter.wait.captured_bits.replace(lock.borrow_mut(), new_bits);
                task::ready_task(lock.borrow_mut(), waiter);
                woke_any = true;
            }
        }

        if woke_any {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// The current bit state.
    pub fn get(&'static self) -> Result<EventBits> {
        let lock = lock_cpu::<Traits>()?;
        if !self.sync.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }
        Ok(self.bits.get(&lock))
    }

    /// Wait until `mask` matches the bit state under `trigger`, up to
    /// `timeout_ms` milliseconds (`0` = wait forever). Returns the bit state
    /// observed at the moment the condition held.
    pub fn wait(
        &'static self,
        mask: EventBits,
        trigger: EventTrigger,
        timeout_ms: u32,
    ) -> Result<EventBits> {
        let mut lock = lock_cpu::<Traits>()?;
        let ticks = wait::prepare_wait::<Traits>(&lock, &self.sync, timeout_ms)?;
        let me = state::expect_waitable_context::<Traits>(&lock)?;

        let bits = self.bits.get(&lock);
        if condition_met(bits, mask, trigger) {
            return Ok(bits);
        }

        me.wait.event_bits.replace(lock.borrow_mut(), mask);
        me.wait.event_trigger.replace(lock.borrow_mut(), trigger);

        wait::block_on(lock.borrow_mut(), &self.sync, ticks)?;
        Ok(me.wait.captured_bits.get(&lock))
    }

    /// Check the condition without blocking; `TimedOut` when it does not
    /// hold. Returns the current bit state on success.
    pub fn poll(&'static self, mask: EventBits, trigger: EventTrigger) -> Result<EventBits> {
        let lock = lock_cpu::<Traits>()?;
        if !self.sync.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }
        let bits = self.bits.get(&lock);
        if condition_met(bits, mask, trigger) {
            Ok(bits)
        } else {
            Err(Error::TimedOut)
        }
    }

    /// Cancel `task`'s wait on this event group with the `Aborted` result.
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
    fn condition_matrix() {
        assert!(condition_met(0b1111, 0b0011, EventTrigger::AllSet));
        assert!(!condition_met(0b1101, 0b0011, EventTrigger::AllSet));
        assert!(condition_met(0b0001, 0b0011, EventTrigger::AnySet));
        assert!(!condition_met(0b1100, 0b0011, EventTrigger::AnySet));
        assert!(condition_met(0b1100, 0b0011, EventTrigger::AllClear));
        assert!(!condition_met(0b1101, 0b0011, EventTrigger::AllClear));
        assert!(condition_met(0b0001, 0b0011, EventTrigger::AnyClear));
        assert!(!condition_met(0b0011, 0b0011, EventTrigger::AnyClear));
        // An empty mask: `AllSet` holds vacuously, `AnySet` never does.
        assert!(condition_met(0, 0, EventTrigger::AllSet));
        assert!(!condition_met(0, 0, EventTrigger::AnySet));
    }

    #[test]
    fn set_clear_get_poll() {
        test_kernel!(Sys);
        static EG: EventGroupCb<Sys> = EventGroupCb::new();
        EG.init().unwrap();

        assert_eq!(EG.get().unwrap(), 0);
        EG.set(0b0101).unwrap();
        assert_eq!(EG.get().unwrap(), 0b0101);
        EG.clear(0b0001).unwrap();
        assert_eq!(EG.get().unwrap(), 0b0100);

        assert_eq!(EG.poll(0b0100, EventTrigger::AllSet), Ok(0b0100));
        assert_eq!(
            EG.poll(0b0001, EventTrigger::AnySet),
            Err(Error::TimedOut)
        );
    }

    #[test]
    fn wait_returns_immediately_when_satisfied() {
        test_kernel!(Sys);
        static EG: EventGroupCb<Sys> = EventGroupCb::new();
        EG.init().unwrap();
        let a = leak_task::<Sys>(1);
        a.init().unwrap();
        boot_kernel!(Sys);

        EG.set(0b10).unwrap();
        assert_eq!(EG.wait(0b10, EventTrigger::AnySet, 0), Ok(0b10));
    }

    #[test]
    fn set_wakes_waiter_with_captured_bits() {
        test_kernel!(Sys);
        static EG: EventGroupCb<Sys> = EventGroupCb::new();
        EG.init().unwrap();
        let a = leak_task::<Sys>(1);
        a.init().unwrap();
        boot_kernel!(Sys);

        static STEPPED: AtomicBool = AtomicBool::new(false);
        set_world(|| {
            if !STEPPED.swap(true, Ordering::SeqCst) {
                // The first set leaves the condition unsatisfied.
                EG.set(0b01).unwrap();
                EG.set(0b10).unwrap();
            }
        });

        assert_eq!(EG.wait(0b11, EventTrigger::AllSet, 0), Ok(0b11));
        assert_eq!(current_task_ptr::<Sys>(), Some(a as *const _));
    }

    #[test]
    fn clear_wakes_all_clear_waiter() {
        test_kernel!(Sys);
        static EG: EventGroupCb<Sys> = EventGroupCb::new();
        EG.init().unwrap();
        let a = leak_task::<Sys>(1);
        a.init().unwrap();
        boot_kernel!(Sys);

        EG.set(0b11).unwrap();

        static STEPPED: AtomicBool = AtomicBool::new(false);
        set_world(|| {
            if !STEPPED.swap(true, Ordering::SeqCst) {
                EG.clear(0b01).unwrap();
                EG.clear(0b10).unwrap();
            }
        });

        assert_eq!(EG.wait(0b11, EventTrigger::AllClear, 0), Ok(0));
    }
}
