//! Host-side scaffolding for the unit tests.
//!
//! `test_kernel!` defines a fresh system type with a mock port. The mock
//! commits context switches immediately (there is only one host thread), and
//! whenever a task offers the processor with the CPU Lock inactive, it runs
//! a test-provided *world* hook standing in for everything that would execute
//! while that task is switched out (other tasks, the tick interrupt).

/// Define a system type backed by the mock port. Use inside a test function
/// so every test gets isolated kernel state.
macro_rules! test_kernel {
    ($Sys:ident) => {
        struct $Sys;

        static CPU_LOCK: std::sync::atomic::AtomicBool =
            std::sync::atomic::AtomicBool::new(false);
        static ISR_CONTEXT: std::sync::atomic::AtomicBool =
            std::sync::atomic::AtomicBool::new(false);
        static DEBUGGER: std::sync::atomic::AtomicBool =
            std::sync::atomic::AtomicBool::new(false);
        #[allow(clippy::type_complexity)]
        static WORLD: std::sync::Mutex<Option<Box<dyn FnMut() + Send>>> =
            std::sync::Mutex::new(None);

        unsafe impl crate::Port for $Sys {
            type PortTaskState = ();
            const PORT_TASK_STATE_INIT: () = ();
            const STACK_MIN_LEN: usize = 8;

            unsafe fn enter_cpu_lock() {
                use std::sync::atomic::Ordering;
                assert!(
                    !CPU_LOCK.swap(true, Ordering::SeqCst),
                    "CPU Lock was already active"
                );
            }

            unsafe fn leave_cpu_lock() {
                use std::sync::atomic::Ordering;
                assert!(
                    CPU_LOCK.swap(false, Ordering::SeqCst),
                    "CPU Lock was not active"
                );
            }

            fn is_cpu_lock_active() -> bool {
                CPU_LOCK.load(std::sync::atomic::Ordering::SeqCst)
            }

            fn is_task_context() -> bool {
                !ISR_CONTEXT.load(std::sync::atomic::Ordering::SeqCst)
            }

            fn is_debugger_attached() -> bool {
                DEBUGGER.load(std::sync::atomic::Ordering::SeqCst)
            }

            unsafe fn initialize_task_state(_task: &'static crate::TaskCb<Self>) {}

            unsafe fn initialize_system_timer(_tick_freq_hz: u32) {}

            unsafe fn yield_cpu() {
                if Self::is_cpu_lock_active() {
                    // Inside a critical section the switch stays pended on
                    // real hardware; committing it here is equivalent
                    // because nothing can observe the difference until the
                    // section ends.
                    unsafe { crate::complete_context_switch::<Self>() };
                } else {
                    unsafe {
                        Self::enter_cpu_lock();
                        crate::complete_context_switch::<Self>();
                        Self::leave_cpu_lock();
                    }
                    // The switched-out window: let the rest of the world run.
                    // `try_lock` keeps a nested offer from re-entering it.
                    if let Ok(mut world) = WORLD.try_lock() {
                        if let Some(hook) = world.as_mut() {
                            hook();
                        }
                    }
                }
            }

            unsafe fn dispatch_first_task() {
                unsafe {
                    crate::complete_context_switch::<Self>();
                    Self::leave_cpu_lock();
                }
            }
        }

        crate::build!($Sys);

        #[allow(dead_code)]
        fn set_world(hook: impl FnMut() + Send + 'static) {
            *WORLD.lock().unwrap() = Some(Box::new(hook));
        }

        #[allow(dead_code)]
        fn set_isr_context(active: bool) {
            ISR_CONTEXT.store(active, std::sync::atomic::Ordering::SeqCst);
        }

        #[allow(dead_code)]
        fn set_debugger_attached(attached: bool) {
            DEBUGGER.store(attached, std::sync::atomic::Ordering::SeqCst);
        }
    };
}
pub(crate) use test_kernel;

/// Boot the given system with a 1 kHz tick and default service stacks.
macro_rules! boot_kernel {
    ($Sys:ty) => {{
        static IDLE_STACK: crate::TaskStack<64> = crate::TaskStack::new();
        #[cfg(feature = "software_timers")]
        static TIMER_STACK: crate::TaskStack<64> = crate::TaskStack::new();

        <$Sys as crate::Kernel>::boot(crate::StartupConfig {
            tick_freq_hz: 1_000,
            idle_stack: IDLE_STACK.words(),
            tick_hook: None,
            #[cfg(feature = "software_timers")]
            timer_task_priority: 30,
            #[cfg(feature = "software_timers")]
            timer_task_stack: TIMER_STACK.words(),
        });
    }};
}
pub(crate) use boot_kernel;

/// The identity of the current task, for assertions.
pub(crate) fn current_task_ptr<Traits: crate::Kernel>() -> Option<*const crate::TaskCb<Traits>> {
    let lock = crate::klock::lock_cpu::<Traits>().unwrap();
    Traits::state()
        .current_task
        .get(&lock)
        .map(|task| task as *const _)
}

/// The state of a task without going through the public accessor.
pub(crate) fn task_state<Traits: crate::Kernel>(task: &'static crate::TaskCb<Traits>) -> crate::TaskSt {
    let lock = crate::klock::lock_cpu::<Traits>().unwrap();
    task.st.get(&lock)
}
