//! Error codes reported by kernel services.
use core::fmt;

/// Result type alias for kernel operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The error codes of every fallible kernel service.
///
/// Services return the subset that applies to them; the variants are
/// grouped below by the part of the kernel that raises them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(i8)]
pub enum Error {
    // Calling context
    /// The operating system has not been started yet.
    OsOffline,
    /// There is no running task although the kernel expected one.
    RunningTaskNull,
    /// The operation would suspend the idle task.
    IllegalIdleTask,
    /// The operation would block the timer task while it is executing a
    /// timer callback.
    IllegalTimerTask,
    /// The operation requires a task context but was invoked from an
    /// interrupt handler.
    IllegalInterruptAccess,
    /// The task to be resumed is not suspended.
    IllegalTaskResume,
    /// The service was invoked from inside a critical section.
    BadContext,
    /// An argument is out of its valid domain.
    BadParam,

    // Synchronization objects
    /// The object has not been initialized.
    Uninitialized,
    /// The object is already initialized.
    Reinitialized,
    /// The object still has tasks blocked on it.
    TaskPendingOnSync,
    /// The task is not blocked on this object.
    TaskNotBlockedBySync,
    /// The wait did not complete within the requested timeout.
    TimedOut,
    /// The wait was cancelled by [`abort`](crate::SemaphoreCb::abort).
    Aborted,
    /// A count or buffer capacity would be exceeded.
    QueueOverflow,

    // Mutexes
    /// The mutex is owned by a different task.
    InvalidMutexOwner,
    /// The owning task attempted to acquire the mutex again.
    MutexOwnerAcquire,

    // Time services
    /// The requested duration does not fit in the tick representation.
    SleepDurationOutOfRange,

    // Software timers
    /// A timer period of zero was requested.
    TimeoutCannotBeZero,
    /// The timer is already running.
    TimerRunning,
    /// The timer is not running.
    TimerNotRunning,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Self::OsOffline => "the operating system is not started",
            Self::RunningTaskNull => "no task is running",
            Self::IllegalIdleTask => "illegal operation for the idle task",
            Self::IllegalTimerTask => "illegal operation inside a timer callback",
            Self::IllegalInterruptAccess => "illegal operation in interrupt context",
            Self::IllegalTaskResume => "the task is not suspended",
            Self::BadContext => "called from inside a critical section",
            Self::BadParam => "argument out of range",
            Self::Uninitialized => "object not initialized",
            Self::Reinitialized => "object already initialized",
            Self::TaskPendingOnSync => "tasks are still blocked on the object",
            Self::TaskNotBlockedBySync => "the task is not blocked on the object",
            Self::TimedOut => "timed out",
            Self::Aborted => "wait aborted",
            Self::QueueOverflow => "capacity exceeded",
            Self::InvalidMutexOwner => "the mutex is owned by another task",
            Self::MutexOwnerAcquire => "the mutex is already owned by the caller",
            Self::SleepDurationOutOfRange => "sleep duration out of range",
            Self::TimeoutCannotBeZero => "the timer period must be non-zero",
            Self::TimerRunning => "the timer is already running",
            Self::TimerNotRunning => "the timer is not running",
        };
        f.write_str(msg)
    }
}
