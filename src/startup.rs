//! Kernel startup
use core::sync::atomic::Ordering;

use crate::{
    error::Result,
    klock::{assume_cpu_lock, lock_cpu},
    task::{self, StackCell, TaskSt, STACK_SENTINEL},
    Kernel, PRIORITY_IDLE,
};

#[cfg(feature = "software_timers")]
use crate::{task::Priority, timer, wait};

/// The boot-time configuration consumed by [`Kernel::boot`](crate::Kernel::boot).
pub struct StartupConfig {
    /// The system tick frequency the port programs into the tick source.
    /// Must be non-zero.
    pub tick_freq_hz: u32,

    /// Backing storage for the idle task's stack.
    pub idle_stack: &'static [StackCell],

    /// Optional hook invoked at the start of every tick, outside the
    /// critical section.
    pub tick_hook: Option<fn()>,

    /// The priority of the dedicated timer task (`0..=31`).
    #[cfg(feature = "software_timers")]
    pub timer_task_priority: Priority,

    /// Backing storage for the timer task's stack.
    #[cfg(feature = "software_timers")]
    pub timer_task_stack: &'static [StackCell],
}

/// The idle task: runs whenever nothing else is ready. Never blocks,
/// yields, or terminates.
fn idle_entry() -> Result<()> {
    loop {
        core::hint::spin_loop();
    }
}

/// Bring the kernel up and dispatch the first task.
///
/// Idempotent: a second call after a successful start returns immediately.
/// On a live target the dispatcher does not return; if it does (hosted
/// ports, or a halted target with a debug probe attached), control comes
/// back to the caller.
pub(crate) fn boot<Traits: Kernel>(config: StartupConfig) {
    let state = Traits::state();
    if state.started() {
        return;
    }

    assert!(config.tick_freq_hz != 0, "tick frequency must be non-zero");
    assert!(
        config.idle_stack.len() >= Traits::STACK_MIN_LEN,
        "idle stack below the port's minimum size"
    );
    #[cfg(feature = "software_timers")]
    {
        assert!(config.timer_task_priority < PRIORITY_IDLE);
        assert!(
            config.timer_task_stack.len() >= Traits::STACK_MIN_LEN,
            "timer task stack below the port's minimum size"
        );
    }

    let mut lock = lock_cpu::<Traits>().unwrap_or_else(|_| unsafe {
        // Safety: Boot runs single-threaded; if the lock is held, it is ours.
        assume_cpu_lock::<Traits>()
    });

    state
        .tick_freq_hz
        .replace(lock.borrow_mut(), config.tick_freq_hz);
    state.tick_hook.replace(lock.borrow_mut(), config.tick_hook);

    // The idle task occupies the reserved priority level outside the ready
    // bitmap, so the scheduler finds it exactly when the bitmap is empty.
    let idle = &state.idle_task;
    idle.name.replace(lock.borrow_mut(), "idle");
    idle.stack.replace(lock.borrow_mut(), config.idle_stack);
    idle.entry.replace(lock.borrow_mut(), Some(idle_entry));
    idle.init_priority.replace(lock.borrow_mut(), PRIORITY_IDLE);
    idle.base_priority.replace(lock.borrow_mut(), PRIORITY_IDLE);
    idle.effective_priority.replace(lock.borrow_mut(), PRIORITY_IDLE);
    for word in config.idle_stack {
        word.store(STACK_SENTINEL);
    }
    // Safety: CPU Lock active, the task is in the Uninitialized state
    unsafe { Traits::initialize_task_state(idle) };
    state
        .level(PRIORITY_IDLE)
        .ready
        .insert_after(lock.borrow_mut(), idle, None);
    idle.st.replace(lock.borrow_mut(), TaskSt::Ready);
    idle.initialized.replace(lock.borrow_mut(), true);

    #[cfg(feature = "software_timers")]
    {
        let registered = wait::register(lock.borrow_mut(), &state.timer.sem.sync);
        debug_assert!(registered.is_ok());

        let timer_task = &state.timer.task;
        timer_task.name.replace(lock.borrow_mut(), "timers");
        timer_task
            .stack
            .replace(lock.borrow_mut(), config.timer_task_stack);
        timer_task
            .entry
            .replace(lock.borrow_mut(), Some(timer::timer_task_entry::<Traits>));
        timer_task
            .init_priority
            .replace(lock.borrow_mut(), config.timer_task_priority);
        timer_task
            .base_priority
            .replace(lock.borrow_mut(), config.timer_task_priority);
        timer_task
            .effective_priority
            .replace(lock.borrow_mut(), config.timer_task_priority);
        for word in config.timer_task_stack {
            word.store(STACK_SENTINEL);
        }
        // Safety: CPU Lock active, the task is in the Uninitialized state
        unsafe { Traits::initialize_task_state(timer_task) };
        task::ready_task(lock.borrow_mut(), timer_task);
        timer_task.initialized.replace(lock.borrow_mut(), true);
    }

    // Safety: CPU Lock active; the tick source stays quiet until the
    // interrupt actually fires, which cannot happen before dispatch.
    unsafe { Traits::initialize_system_timer(config.tick_freq_hz) };

    task::schedule(lock.borrow_mut());
    state.started.store(true, Ordering::SeqCst);

    // The dispatcher inherits the critical section and ends it when the
    // first task starts executing.
    core::mem::forget(lock);

    // Safety: CPU Lock active, the scheduling decision is made.
    unsafe { Traits::dispatch_first_task() };

    // Only reachable on ports whose dispatcher can hand control back.
    if Traits::is_debugger_attached() {
        panic!("dispatcher returned control to boot");
    }
}
