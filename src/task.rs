//! Tasks
use core::fmt;

use crate::{
    error::{Error, Result},
    event_group::{EventBits, EventTrigger},
    klock::{
        assume_cpu_lock, lock_cpu, CpuLockCell, CpuLockGuard, CpuLockGuardBorrowMut, CpuLockToken,
    },
    timeout::Ticks,
    utils::{ptr_eq_opt, Init},
    Kernel, Port, PRIORITY_IDLE, PRIORITY_LEVELS,
};

pub(crate) mod queue;
use self::queue::{TaskLinks, TaskQueue};

/// A task priority. `0..=31` are user levels (lower number = higher
/// priority); `32` is reserved for the idle task.
pub type Priority = u8;

/// One machine word of a task stack.
pub type UWord = usize;

/// The watermark value written to every stack word when a task is
/// initialized.
pub const STACK_SENTINEL: UWord = 0xDEAD_C0DE;

/// A single word of task stack storage. The port writes through this cell
/// when building the initial exception frame and during context switches.
#[repr(transparent)]
pub struct StackCell(core::cell::UnsafeCell<UWord>);

// Safety: A stack word is only accessed by the task owning the stack, by the
// port while that task is switched out, or by the kernel inside a critical
// section.
unsafe impl Sync for StackCell {}

impl Init for StackCell {
    const INIT: Self = Self::new();
}

impl StackCell {
    pub const fn new() -> Self {
        Self(core::cell::UnsafeCell::new(STACK_SENTINEL))
    }

    /// Get a raw pointer to the stack word.
    pub fn as_ptr(&self) -> *mut UWord {
        self.0.get()
    }

    pub(crate) fn load(&self) -> UWord {
        // Safety: See the `Sync` impl above.
        unsafe { *self.0.get() }
    }

    pub(crate) fn store(&self, value: UWord) {
        // Safety: See the `Sync` impl above.
        unsafe { *self.0.get() = value }
    }
}

/// Caller-owned backing storage for a task stack.
///
/// ```rust,ignore
/// static STACK: TaskStack<256> = TaskStack::new();
/// ```
pub struct TaskStack<const LEN: usize> {
    words: [StackCell; LEN],
}

impl<const LEN: usize> TaskStack<LEN> {
    pub const fn new() -> Self {
        Self {
            words: <[StackCell; LEN] as Init>::INIT,
        }
    }

    /// Borrow the stack as the word slice a [`TaskConfig`] carries.
    pub const fn words(&self) -> &[StackCell] {
        &self.words
    }
}

/// The subroutine executed by a task. A task ends when its subroutine
/// returns.
pub type TaskEntry = fn() -> Result<()>;

/// An exit hook, invoked with the subroutine's result when a task returns.
pub type ExitHook<Traits> = fn(&'static TaskCb<Traits>, Result<()>);

/// The static properties of a task, consumed by [`TaskCb::new`].
pub struct TaskConfig<Traits: Port> {
    pub name: &'static str,
    pub stack: &'static [StackCell],
    pub entry: TaskEntry,
    pub exit_hook: Option<ExitHook<Traits>>,
    /// `0..=31`; lower number = higher priority.
    pub priority: Priority,
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// Not known to the kernel; the initial and post-`deinit` state.
    Uninitialized,
    /// In a ready queue, waiting for the processor.
    Ready,
    /// Selected to run.
    Running,
    /// Sleeping in a yielded queue until its delay elapses.
    Yielded,
    /// Waiting in the pending queue of a synchronization object.
    Blocked,
    /// Parked in a suspended queue until resumed.
    Suspended,
}

impl Init for TaskSt {
    const INIT: Self = Self::Uninitialized;
}

/// The wait state of a task: completion flags for the blocking protocol and
/// the event-group wait condition.
pub(crate) struct TaskWait<Traits: Port> {
    /// Set by the tick handler when the task's pending timeout expires.
    pub(crate) timed_out: CpuLockCell<Traits, bool>,

    /// Set by `abort`.
    pub(crate) aborted: CpuLockCell<Traits, bool>,

    /// The bits the task is waiting for while blocked on an event group.
    pub(crate) event_bits: CpuLockCell<Traits, EventBits>,

    pub(crate) event_trigger: CpuLockCell<Traits, EventTrigger>,

    /// The event group's bit state captured at the moment the wait condition
    /// was satisfied.
    pub(crate) captured_bits: CpuLockCell<Traits, EventBits>,
}

impl<Traits: Port> Init for TaskWait<Traits> {
    const INIT: Self = Self {
        timed_out: Init::INIT,
        aborted: Init::INIT,
        event_bits: Init::INIT,
        event_trigger: Init::INIT,
        captured_bits: Init::INIT,
    };
}

/// *Task control block* - the state data of a task.
///
/// Lives in caller-owned `'static` storage; the kernel links it into its
/// queues by reference. The port's per-task state is guaranteed to be placed
/// at the beginning of the struct so that context-switch assembly can refer
/// to it without an offset computation.
#[repr(C)]
pub struct TaskCb<Traits: Port> {
    pub port_task_state: Traits::PortTaskState,

    pub(crate) name: CpuLockCell<Traits, &'static str>,
    pub(crate) stack: CpuLockCell<Traits, &'static [StackCell]>,
    pub(crate) entry: CpuLockCell<Traits, Option<TaskEntry>>,
    pub(crate) exit_hook: CpuLockCell<Traits, Option<ExitHook<Traits>>>,

    /// The priority the task was configured with; restored on `init`.
    pub(crate) init_priority: CpuLockCell<Traits, Priority>,

    /// The task's base priority, preserved across priority inheritance.
    pub(crate) base_priority: CpuLockCell<Traits, Priority>,

    /// The priority the scheduler sees. May be temporarily raised above
    /// `base_priority` by a mutex's priority-inheritance protocol.
    pub(crate) effective_priority: CpuLockCell<Traits, Priority>,

    pub(crate) st: CpuLockCell<Traits, TaskSt>,

    /// Remaining timeout in ticks. While blocked, `0` means "wait forever";
    /// otherwise it is the remaining delay.
    pub(crate) timeout: CpuLockCell<Traits, Ticks>,

    pub(crate) links: TaskLinks<Traits>,

    pub(crate) wait: TaskWait<Traits>,

    pub(crate) initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: Port> Init for TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_task_state: Traits::PORT_TASK_STATE_INIT,
        name: Init::INIT,
        stack: Init::INIT,
        entry: Init::INIT,
        exit_hook: Init::INIT,
        init_priority: CpuLockCell::new(PRIORITY_IDLE),
        base_priority: CpuLockCell::new(PRIORITY_IDLE),
        effective_priority: CpuLockCell::new(PRIORITY_IDLE),
        st: Init::INIT,
        timeout: Init::INIT,
        links: Init::INIT,
        wait: Init::INIT,
        initialized: Init::INIT,
    };
}

impl<Traits: Kernel> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<Traits: Port> TaskCb<Traits> {
    /// Construct a task control block from its static properties. The block
    /// becomes known to the kernel on [`init`](Self::init).
    pub const fn new(config: TaskConfig<Traits>) -> Self {
        Self {
            port_task_state: Traits::PORT_TASK_STATE_INIT,
            name: CpuLockCell::new(config.name),
            stack: CpuLockCell::new(config.stack),
            entry: CpuLockCell::new(Some(config.entry)),
            exit_hook: CpuLockCell::new(config.exit_hook),
            init_priority: CpuLockCell::new(config.priority),
            base_priority: CpuLockCell::new(config.priority),
            effective_priority: CpuLockCell::new(config.priority),
            st: Init::INIT,
            timeout: Init::INIT,
            links: Init::INIT,
            wait: Init::INIT,
            initialized: Init::INIT,
        }
    }
}

impl<Traits: Kernel> TaskCb<Traits> {
    /// Register the task with the kernel and make it ready.
    ///
    /// The stack is filled with the watermark sentinel and handed to the
    /// port, which builds the initial context so the first switch into the
    /// task resumes at its subroutine.
    pub fn init(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;

        if self.initialized.get(&lock) {
            return Err(Error::Reinitialized);
        }

        let priority = self.init_priority.get(&lock);
        if priority >= PRIORITY_IDLE {
            return Err(Error::BadParam);
        }
        let stack = self.stack.get(&lock);
        if stack.len() < Traits::STACK_MIN_LEN {
            return Err(Error::BadParam);
        }

        for word in stack {
            word.store(STACK_SENTINEL);
        }

        self.base_priority.replace(lock.borrow_mut(), priority);
        self.effective_priority.replace(lock.borrow_mut(), priority);
        self.timeout.replace(lock.borrow_mut(), 0);
        self.wait.timed_out.replace(lock.borrow_mut(), false);
        self.wait.aborted.replace(lock.borrow_mut(), false);

        // Safety: CPU Lock active, the task is in the Uninitialized state
        unsafe { Traits::initialize_task_state(self) };

        ready_task(lock.borrow_mut(), self);
        self.initialized.replace(lock.borrow_mut(), true);

        // If the new task has a higher priority, perform a context switch.
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Detach the task from the kernel. The backing storage may be reused
    /// (or re-`init`ed) afterwards.
    pub fn deinit(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;

        if !self.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }

        remove_task(lock.borrow_mut(), self);
        self.st.replace(lock.borrow_mut(), TaskSt::Uninitialized);
        self.initialized.replace(lock.borrow_mut(), false);

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Move the task to the suspended queue of its priority level. A task
    /// may suspend itself; it stops running once the resulting context
    /// switch is taken.
    pub fn suspend(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;

        if !self.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }
        let state = Traits::state();
        if core::ptr::eq(self, &state.idle_task) {
            return Err(Error::IllegalIdleTask);
        }
        // A blocked task belongs to a pending queue; yanking it out from
        // under the object would let the interrupted wait report success.
        if self.st.get(&lock) == TaskSt::Blocked {
            return Err(Error::TaskPendingOnSync);
        }

        suspend_task(lock.borrow_mut(), self);
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Make a suspended task ready again.
    pub fn resume(&'static self) -> Result<()> {
        let mut lock = lock_cpu::<Traits>()?;

        if !self.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }
        if self.st.get(&lock) != TaskSt::Suspended {
            return Err(Error::IllegalTaskResume);
        }

        ready_task(lock.borrow_mut(), self);
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// The task's current scheduling state.
    pub fn state(&self) -> Result<TaskSt> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.st.get(&lock))
    }

    /// The task's effective priority (base priority unless raised by
    /// priority inheritance).
    pub fn priority(&self) -> Result<Priority> {
        let lock = lock_cpu::<Traits>()?;
        if !self.initialized.get(&lock) {
            return Err(Error::Uninitialized);
        }
        Ok(self.effective_priority.get(&lock))
    }

    /// The number of stack words never written since `init`, i.e. those
    /// still holding [`STACK_SENTINEL`]. Stacks grow downward, so the count
    /// runs from the low end of the slice.
    pub fn stack_watermark(&self) -> Result<usize> {
        let lock = lock_cpu::<Traits>()?;
        let stack = self.stack.get(&lock);
        Ok(stack
            .iter()
            .take_while(|word| word.load() == STACK_SENTINEL)
            .count())
    }
}

/// The three queues of one priority level.
pub(crate) struct PrioLevel<Traits: Port> {
    pub(crate) ready: TaskQueue<Traits>,
    pub(crate) yielded: TaskQueue<Traits>,
    pub(crate) suspended: TaskQueue<Traits>,
}

impl<Traits: Port> Init for PrioLevel<Traits> {
    const INIT: Self = Self {
        ready: Init::INIT,
        yielded: Init::INIT,
        suspended: Init::INIT,
    };
}

/// Detach `task` from whatever queue holds it, keeping the ready bitmap
/// consistent.
pub(crate) fn detach<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let state = Traits::state();
    let Some(owner) = task.links.owner.get(lock) else {
        return;
    };

    let priority = task.effective_priority.get(lock);
    let level = state.level(priority);
    let was_ready = core::ptr::eq(owner, &level.ready);

    let removed = owner.remove(&mut *lock, task);
    debug_assert!(removed);

    if was_ready && priority < PRIORITY_IDLE && level.ready.is_empty(lock) {
        state.ready_bitmap.write(&mut *lock).clear(priority);
    }
}

/// Transition `task` into the Ready state: detach it, append it to the ready
/// queue of its effective priority, and set the corresponding bitmap bit.
/// Idempotent for a task already at the tail of its ready queue.
pub(crate) fn ready_task<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let state = Traits::state();
    detach(&mut *lock, task);

    let priority = task.effective_priority.get(lock);
    state.level(priority).ready.insert_after(&mut *lock, task, None);
    if priority < PRIORITY_IDLE {
        state.ready_bitmap.write(&mut *lock).set(priority);
    }

    task.st.replace(&mut *lock, TaskSt::Ready);
    task.timeout.replace(&mut *lock, 0);
}

/// Move `task` to the yielded (delayed) queue of its priority level. The
/// caller stores the delay afterwards.
pub(crate) fn yield_task<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let state = Traits::state();
    detach(&mut *lock, task);

    let priority = task.effective_priority.get(lock);
    state
        .level(priority)
        .yielded
        .insert_after(&mut *lock, task, None);
    task.st.replace(&mut *lock, TaskSt::Yielded);
}

/// Move `task` to the suspended queue of its priority level.
pub(crate) fn suspend_task<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let state = Traits::state();
    detach(&mut *lock, task);

    let priority = task.effective_priority.get(lock);
    state
        .level(priority)
        .suspended
        .insert_after(&mut *lock, task, None);
    task.st.replace(&mut *lock, TaskSt::Suspended);
}

/// Detach `task` without assigning it a new queue.
pub(crate) fn remove_task<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    detach(lock, task);
}

/// Pop the head of the ready queue at the running priority. The returned
/// task is detached, pending its new state assignment.
pub(crate) fn pop_running<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
) -> Option<&'static TaskCb<Traits>> {
    let state = Traits::state();
    let priority = state.running_priority.get(lock);
    let queue = &state.level(priority).ready;
    let task = queue.pop_front(&mut *lock)?;

    if priority < PRIORITY_IDLE && queue.is_empty(lock) {
        state.ready_bitmap.write(&mut *lock).clear(priority);
    }
    Some(task)
}

/// Rotate the ready queue at the running priority, head to tail. Drives the
/// round robin among equal-priority tasks.
pub(crate) fn cycle_active<Traits: Kernel>(lock: CpuLockGuardBorrowMut<'_, Traits>) {
    let state = Traits::state();
    let priority = state.running_priority.get(lock);
    state.level(priority).ready.rotate(&mut *lock);
}

/// Walk every yielded queue, decrement the remaining delays, and promote
/// tasks whose delay reached zero.
pub(crate) fn update_delayed<Traits: Kernel>(lock: CpuLockGuardBorrowMut<'_, Traits>) {
    let state = Traits::state();
    for priority in 0..PRIORITY_LEVELS {
        let mut cursor = state.levels[priority].yielded.front(lock);
        while let Some(task) = cursor {
            cursor = task.links.next.get(lock);

            let remaining = task.timeout.get(lock);
            if remaining == 0 {
                continue;
            }
            let remaining = remaining - 1;
            task.timeout.replace(&mut *lock, remaining);
            if remaining == 0 {
                ready_task(&mut *lock, task);
            }
        }
    }
}

/// The scheduling decision: select the head of the highest-priority
/// non-empty ready queue as the next task and, when that differs from the
/// current one, request a context switch from the port.
pub(crate) fn schedule<Traits: Kernel>(lock: CpuLockGuardBorrowMut<'_, Traits>) {
    let state = Traits::state();

    let priority = state.ready_bitmap.read(lock).find_first();
    state.running_priority.replace(&mut *lock, priority);

    let Some(next) = state.level(priority).ready.front(lock) else {
        // Nothing is ready before the kernel starts. After `boot` the idle
        // level is always populated.
        assert!(!state.started(), "ready queue empty while the kernel is running");
        state.next_task.replace(&mut *lock, None);
        return;
    };

    state.next_task.replace(&mut *lock, Some(next));

    if !valid_switch::<Traits>(lock) {
        if next.st.get(lock) != TaskSt::Running {
            next.st.replace(&mut *lock, TaskSt::Running);
        }
        return;
    }

    // The current task loses the processor. It keeps its place in whatever
    // queue it occupies; only a task that is still marked Running falls back
    // to Ready.
    if let Some(current) = state.current_task.get(lock) {
        if current.st.get(lock) == TaskSt::Running {
            current.st.replace(&mut *lock, TaskSt::Ready);
        }
    }
    next.st.replace(&mut *lock, TaskSt::Running);

    if state.started() {
        // Safety: The port defers the switch until the critical section ends.
        unsafe { Traits::yield_cpu() };
    }
}

/// `current_task != next_task`
pub(crate) fn valid_switch<Traits: Kernel>(lock: &CpuLockToken<Traits>) -> bool {
    let state = Traits::state();
    !ptr_eq_opt(state.current_task.get(lock), state.next_task.get(lock))
}

/// Commit a context switch: the task selected by [`schedule`] becomes the
/// current task.
///
/// Called by the port from its context-switch handler, after saving the
/// outgoing context and before restoring the incoming one.
///
/// # Safety
///
/// CPU Lock must be active, and the caller must be the port's context-switch
/// path.
pub unsafe fn complete_context_switch<Traits: Kernel>() {
    // Safety: CPU Lock is active per this function's contract.
    let mut lock = unsafe { assume_cpu_lock::<Traits>() };
    let state = Traits::state();
    let next = state.next_task.get(&lock);
    state.current_task.replace(lock.borrow_mut(), next);
    // The critical section belongs to the port; don't end it here.
    core::mem::forget(lock);
}

/// Busy-wait (by repeatedly offering the processor) until `task` is the
/// running task again. Called on the blocked/yielded task's own stack; on a
/// live target the loop body runs at most once per actual wakeup.
pub(crate) fn wait_until_woken_up<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let state = Traits::state();
    loop {
        if task.st.get(lock) == TaskSt::Running
            && ptr_eq_opt(state.current_task.get(lock), Some(task))
        {
            break;
        }

        // Temporarily exit the critical section while offering the processor.
        // Safety: (1) No lock-protected state is accessed in between.
        //         (2) We currently have CPU Lock.
        //         (3) We re-enter CPU Lock before touching kernel state again.
        unsafe {
            Traits::leave_cpu_lock();
            Traits::yield_cpu();
            Traits::enter_cpu_lock();
        }
    }
}

/// Relinquish CPU Lock. Before that, re-run the scheduling decision so a
/// readied higher-priority task preempts the caller.
///
/// Kernel services that transition a task into the Ready state call this
/// before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: Kernel>(mut lock: CpuLockGuard<Traits>) {
    if Traits::state().started() {
        schedule(lock.borrow_mut());
    }
    drop(lock);
}

/// Raise or lower a task's effective priority, repositioning it in whatever
/// queue currently holds it. Ready/yielded/suspended membership moves to the
/// matching queue of the new level; a pending queue is re-sorted.
pub(crate) fn change_effective_priority<Traits: Kernel>(
    lock: CpuLockGuardBorrowMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    new_priority: Priority,
) {
    let state = Traits::state();
    let old_priority = task.effective_priority.get(lock);
    if old_priority == new_priority {
        return;
    }

    let owner = task.links.owner.get(lock);
    let Some(owner) = owner else {
        task.effective_priority.replace(&mut *lock, new_priority);
        return;
    };

    let old_level = state.level(old_priority);
    if core::ptr::eq(owner, &old_level.ready) {
        detach(&mut *lock, task);
        task.effective_priority.replace(&mut *lock, new_priority);
        state
            .level(new_priority)
            .ready
            .insert_after(&mut *lock, task, None);
        if new_priority < PRIORITY_IDLE {
            state.ready_bitmap.write(&mut *lock).set(new_priority);
        }
    } else if core::ptr::eq(owner, &old_level.yielded) {
        detach(&mut *lock, task);
        task.effective_priority.replace(&mut *lock, new_priority);
        state
            .level(new_priority)
            .yielded
            .insert_after(&mut *lock, task, None);
    } else if core::ptr::eq(owner, &old_level.suspended) {
        detach(&mut *lock, task);
        task.effective_priority.replace(&mut *lock, new_priority);
        state
            .level(new_priority)
            .suspended
            .insert_after(&mut *lock, task, None);
    } else {
        // Blocked on a synchronization object: keep the pending queue sorted.
        let removed = owner.remove(&mut *lock, task);
        debug_assert!(removed);
        task.effective_priority.replace(&mut *lock, new_priority);
        owner.insert_sorted(&mut *lock, task);
    }
}

/// The entry point of every task. `Port::initialize_task_state` arranges for
/// the first switch into a task to resume here.
pub fn task_entry_trampoline<Traits: Kernel>() -> ! {
    let entry = {
        let lock = lock_cpu::<Traits>().unwrap_or_else(|_| unsafe {
            // Safety: The dispatcher hands control over with CPU Lock active.
            assume_cpu_lock::<Traits>()
        });
        let state = Traits::state();
        let Some(task) = state.current_task.get(&lock) else {
            panic!("no running task at task entry");
        };
        task.entry.get(&lock)
    };

    let result = match entry {
        Some(entry) => entry(),
        None => Ok(()),
    };

    exit_current_task::<Traits>(result)
}

/// End the current task: run its exit hook with the subroutine result, detach
/// it, and reschedule.
pub(crate) fn exit_current_task<Traits: Kernel>(result: Result<()>) -> ! {
    let mut lock = lock_cpu::<Traits>().unwrap_or_else(|_| unsafe {
        // Safety: If the lock is already held, it is held by this task.
        assume_cpu_lock::<Traits>()
    });
    let state = Traits::state();

    let Some(task) = state.current_task.get(&lock) else {
        panic!("no running task at task exit");
    };

    if let Some(hook) = task.exit_hook.get(&lock) {
        hook(task, result);
    }

    remove_task(lock.borrow_mut(), task);
    task.st.replace(lock.borrow_mut(), TaskSt::Uninitialized);
    task.initialized.replace(lock.borrow_mut(), false);
    schedule(lock.borrow_mut());
    drop(lock);

    // The pending switch never resumes this context again.
    loop {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}
