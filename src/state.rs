//! The kernel-global state
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    error::{Error, Result},
    klock::{CpuLockCell, CpuLockToken},
    task::{PrioLevel, Priority, TaskCb},
    utils::{Init, ReadyBitmap},
    wait::SyncCb,
    Kernel, Port, PRIORITY_IDLE, PRIORITY_LEVELS,
};

#[cfg(feature = "software_timers")]
use crate::timer::TimerGlobals;

/// The state data of one kernel instance. Instantiated once per system type
/// by [`build!`](crate::build), zero-initialized at image load and mutated
/// only inside critical sections once the kernel is started.
pub struct State<Traits: Port> {
    /// The ready/yielded/suspended queue triple of each priority level. The
    /// last level belongs to the idle task.
    pub(crate) levels: [PrioLevel<Traits>; PRIORITY_LEVELS],

    /// Invariant: bit `p` is set iff `levels[p].ready` is non-empty, for
    /// every user priority `p`.
    pub(crate) ready_bitmap: CpuLockCell<Traits, ReadyBitmap>,

    /// The priority level the scheduler last selected.
    pub(crate) running_priority: CpuLockCell<Traits, Priority>,

    /// The task whose context is live on the processor.
    pub(crate) current_task: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The task the last scheduling decision selected. Differs from
    /// `current_task` only while a context switch is pending.
    pub(crate) next_task: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// Monotonic tick counter.
    pub(crate) tick_count: CpuLockCell<Traits, u64>,

    /// The system tick frequency configured at boot.
    pub(crate) tick_freq_hz: CpuLockCell<Traits, u32>,

    /// Optional user hook invoked at the start of every tick.
    pub(crate) tick_hook: CpuLockCell<Traits, Option<fn()>>,

    pub(crate) started: AtomicBool,

    /// Head of the singly-linked registry of initialized sync objects.
    pub(crate) sync_registry: CpuLockCell<Traits, Option<&'static SyncCb<Traits>>>,

    /// The idle task. Always ready at the idle priority once the kernel
    /// starts; never blocks, yields, or terminates.
    pub(crate) idle_task: TaskCb<Traits>,

    #[cfg(feature = "software_timers")]
    pub(crate) timer: TimerGlobals<Traits>,
}

impl<Traits: Port> Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        levels: Init::INIT,
        ready_bitmap: Init::INIT,
        running_priority: CpuLockCell::new(PRIORITY_IDLE),
        current_task: Init::INIT,
        next_task: Init::INIT,
        tick_count: Init::INIT,
        tick_freq_hz: Init::INIT,
        tick_hook: Init::INIT,
        started: AtomicBool::new(false),
        sync_registry: Init::INIT,
        idle_task: Init::INIT,
        #[cfg(feature = "software_timers")]
        timer: Init::INIT,
    };
}

impl<Traits: Port> State<Traits> {
    pub(crate) fn level(&self, priority: Priority) -> &PrioLevel<Traits> {
        &self.levels[priority as usize]
    }

    pub(crate) fn started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }
}

/// Check that the current context may block: the kernel is running, we are
/// in a task context, and the running task is an ordinary user task. Returns
/// the running task.
pub(crate) fn expect_waitable_context<Traits: Kernel>(
    lock: &CpuLockToken<Traits>,
) -> Result<&'static TaskCb<Traits>> {
    let state = Traits::state();

    if !state.started() {
        return Err(Error::OsOffline);
    }
    if !Traits::is_task_context() {
        return Err(Error::IllegalInterruptAccess);
    }
    let Some(task) = state.current_task.get(lock) else {
        return Err(Error::RunningTaskNull);
    };
    if core::ptr::eq(task, &state.idle_task) {
        return Err(Error::IllegalIdleTask);
    }
    #[cfg(feature = "software_timers")]
    if state.timer.in_callback.get(lock) && core::ptr::eq(task, &state.timer.task) {
        return Err(Error::IllegalTimerTask);
    }

    Ok(task)
}
