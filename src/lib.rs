//! Echo - a preemptive, priority-based real-time kernel for single-core
//! embedded systems.
//!
//! The kernel nucleus provides multitasking (32 user priority levels plus a
//! reserved idle level, round robin among equals), tick-driven timekeeping,
//! a blocking protocol shared by every synchronization primitive (mutex,
//! counting semaphore, event group, typed message queue), and an optional
//! software timer service. Everything lives in caller-owned `'static`
//! storage; the kernel allocates nothing.
//!
//! # System types
//!
//! The kernel is generic over a *system type* carrying two ingredients:
//!
//!  - An implementation of [`Port`], the architecture-specific facade
//!    (critical sections, stack initialization, the pended context switch).
//!  - An implementation of [`KernelCfg`] locating the kernel-global
//!    [`State`], installed by [`build!`].
//!
//! ```rust,ignore
//! struct System;
//! unsafe impl echo_kernel::Port for System { /* the target port */ }
//! echo_kernel::build!(System);
//!
//! static STACK: TaskStack<256> = TaskStack::new();
//! static MAIN_TASK: TaskCb<System> = TaskCb::new(TaskConfig {
//!     name: "main",
//!     stack: STACK.words(),
//!     entry: main_task,
//!     exit_hook: None,
//!     priority: 4,
//! });
//!
//! MAIN_TASK.init()?;
//! System::boot(StartupConfig { /* ... */ });
//! ```
#![cfg_attr(not(test), no_std)]

mod error;
mod event_group;
mod klock;
mod msg_queue;
mod mutex;
mod semaphore;
mod startup;
mod state;
mod task;
#[cfg(feature = "software_timers")]
mod timer;
mod timeout;
pub mod utils;
mod wait;

#[cfg(test)]
mod test_support;

pub use self::{
    error::{Error, Result},
    event_group::{EventBits, EventGroupCb, EventTrigger},
    msg_queue::MessageQueueCb,
    mutex::MutexCb,
    semaphore::SemaphoreCb,
    startup::StartupConfig,
    state::State,
    task::{
        complete_context_switch, task_entry_trampoline, ExitHook, Priority, StackCell, TaskCb,
        TaskConfig, TaskEntry, TaskSt, TaskStack, UWord, STACK_SENTINEL,
    },
    timeout::{SleepDuration, Ticks},
};

#[cfg(feature = "software_timers")]
pub use self::timer::{TimerCallback, TimerCb, TimerState};

/// The priority level reserved for the idle task.
pub const PRIORITY_IDLE: Priority = 32;

/// The number of priority levels, the idle level included.
pub const PRIORITY_LEVELS: usize = 33;

/// The interface a port (the architecture-specific layer) provides to the
/// kernel. The kernel assumes nothing else about the target.
///
/// # Safety
///
/// Implementations must uphold every contract documented on the items of
/// this trait; the kernel's soundness rests on them.
pub unsafe trait Port: Sized + 'static {
    /// Per-task storage owned by the port, guaranteed to sit at offset 0 of
    /// [`TaskCb`] so context-switch assembly can reach it without an offset
    /// computation. Typically holds the saved stack pointer.
    type PortTaskState: Send + Sync + utils::Init + 'static;

    #[allow(clippy::declare_interior_mutable_const)]
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// The minimum length of a task stack, in words.
    const STACK_MIN_LEN: usize;

    /// Disable preemption.
    ///
    /// # Safety
    ///
    /// Only the kernel may drive the CPU Lock state.
    unsafe fn enter_cpu_lock();

    /// Re-enable preemption.
    ///
    /// # Safety
    ///
    /// Only the kernel may drive the CPU Lock state.
    unsafe fn leave_cpu_lock();

    fn is_cpu_lock_active() -> bool;

    /// `false` inside an interrupt handler.
    fn is_task_context() -> bool;

    /// Whether a debug probe is watching the target.
    fn is_debugger_attached() -> bool;

    /// Fill the task's stack with an initial exception frame so that the
    /// first switch into the task resumes at
    /// [`task_entry_trampoline`].
    ///
    /// # Safety
    ///
    /// CPU Lock must be active and the task must not be live.
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>);

    /// Program the periodic tick source to `tick_freq_hz`. The tick handler
    /// calls [`Kernel::os_tick`].
    ///
    /// # Safety
    ///
    /// CPU Lock must be active.
    unsafe fn initialize_system_timer(tick_freq_hz: u32);

    /// Request a context switch to the task selected by the scheduler. The
    /// switch is performed in a pended exception (PendSV-class) after the
    /// current critical section ends; the port's handler saves the outgoing
    /// context, calls [`complete_context_switch`], and restores the incoming
    /// one. Returns on the previous task.
    ///
    /// # Safety
    ///
    /// Only the kernel may request switches.
    unsafe fn yield_cpu();

    /// Perform the first context restore. Does not return on a live target;
    /// a hosted or simulated port may return to signal shutdown. The
    /// critical section established by the caller ends when the first task
    /// starts executing.
    ///
    /// # Safety
    ///
    /// Only `boot` may call this, exactly once.
    unsafe fn dispatch_first_task();
}

/// Associates a system type with its kernel state. Implemented by
/// [`build!`]; not meant to be written by hand.
///
/// # Safety
///
/// `state` must return the same, otherwise-unshared instance on every call.
pub unsafe trait KernelCfg: Port {
    fn state() -> &'static State<Self>;
}

/// The full kernel interface of a system type: everything from [`Port`] and
/// [`KernelCfg`], plus the kernel-wide services below. Implemented
/// automatically.
pub trait Kernel: Port + KernelCfg {
    /// Start the kernel: create the idle task, bring up the timer service,
    /// program the tick source, and dispatch the first task. Idempotent
    /// after a successful start. See [`StartupConfig`].
    fn boot(config: StartupConfig) {
        startup::boot::<Self>(config)
    }

    /// The system-tick interrupt entry point. Drives delays, timeouts,
    /// software timers, and the round robin.
    fn os_tick() {
        timeout::os_tick::<Self>()
    }

    /// Ticks elapsed since boot.
    fn tick_count() -> Result<u64> {
        timeout::tick_count::<Self>()
    }

    /// Uptime in milliseconds.
    fn time_ms() -> Result<u64> {
        timeout::time_ms::<Self>()
    }

    /// Put the running task to sleep for `ms` milliseconds. `delay(0)` is a
    /// no-op.
    fn delay(ms: u32) -> Result<()> {
        timeout::delay::<Self>(ms)
    }

    /// Put the running task to sleep for a composite duration.
    fn sleep(duration: SleepDuration) -> Result<()> {
        timeout::sleep::<Self>(duration)
    }
}

impl<T: Port + KernelCfg> Kernel for T {}

/// Instantiate the kernel state for a system type.
///
/// ```rust,ignore
/// struct System;
/// unsafe impl echo_kernel::Port for System { /* ... */ }
/// echo_kernel::build!(System);
/// ```
#[macro_export]
macro_rules! build {
    ($Sys:ty) => {
        const _: () = {
            static KERNEL_STATE: $crate::State<$Sys> =
                <$crate::State<$Sys> as $crate::utils::Init>::INIT;

            // Safety: `KERNEL_STATE` is dedicated to `$Sys` and inaccessible
            // elsewhere.
            unsafe impl $crate::KernelCfg for $Sys {
                #[inline(always)]
                fn state() -> &'static $crate::State<$Sys> {
                    &KERNEL_STATE
                }
            }
        };
    };
}
