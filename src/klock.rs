//! Kernel state locking mechanism
use core::{fmt, marker::PhantomData, ops};

use crate::{error::Error, utils::Init, Port};

/// The token that "unlocks" [`CpuLockCell`]. Can only be borrowed from
/// [`CpuLockGuard`], so holding one proves the CPU Lock is active.
#[non_exhaustive]
pub(crate) struct CpuLockToken<Traits> {
    _phantom: PhantomData<Traits>,
}

#[derive(Clone, Copy)]
pub(crate) struct CpuLockKeyhole<Traits> {
    _phantom: PhantomData<Traits>,
}

impl<Traits> fmt::Debug for CpuLockKeyhole<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CpuLockKeyhole").finish()
    }
}

// This is safe because `CpuLockToken` only can be borrowed from
// `CpuLockGuard`, and there is only one instance of `CpuLockGuard` at any
// point of time
unsafe impl<Traits> tokenlock::Token<CpuLockKeyhole<Traits>> for CpuLockToken<Traits> {
    fn eq_id(&self, _: &CpuLockKeyhole<Traits>) -> bool {
        true
    }
}

impl<Traits> Init for CpuLockKeyhole<Traits> {
    const INIT: Self = Self {
        _phantom: PhantomData,
    };
}

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(
    tokenlock::TokenLock<T, CpuLockKeyhole<Traits>>,
);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(tokenlock::TokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<Traits: Port, T> CpuLockCell<Traits, T> {
    /// Borrow the contents.
    pub(crate) fn read<'a>(&'a self, token: &'a CpuLockToken<Traits>) -> &'a T {
        self.0.read(token)
    }

    /// Mutably borrow the contents.
    pub(crate) fn write<'a>(&'a self, token: &'a mut CpuLockToken<Traits>) -> &'a mut T {
        self.0.write(token)
    }

    /// Clone and return the contents.
    pub(crate) fn get(&self, token: &CpuLockToken<Traits>) -> T
    where
        T: Clone,
    {
        self.0.read(token).clone()
    }

    /// Assign a new value, returning the old one.
    pub(crate) fn replace(&self, token: &mut CpuLockToken<Traits>, value: T) -> T {
        core::mem::replace(self.0.write(token), value)
    }
}

impl<Traits: Port, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(lock) = lock_cpu::<Traits>() {
            f.debug_tuple("CpuLockCell").field(self.read(&lock)).finish()
        } else {
            write!(f, "CpuLockCell(< locked >)")
        }
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

/// Borrowed version of [`CpuLockGuard`], passed down long call chains in
/// place of `&mut CpuLockGuard`.
pub(crate) type CpuLockGuardBorrowMut<'a, Traits> = &'a mut CpuLockToken<Traits>;

/// Attempt to enter a CPU Lock state and get an RAII guard.
/// Return `BadContext` if the kernel is already in a CPU Lock state.
pub(crate) fn lock_cpu<Traits: Port>() -> Result<CpuLockGuard<Traits>, Error> {
    if Traits::is_cpu_lock_active() {
        return Err(Error::BadContext);
    }

    // Safety: CPU Lock is currently inactive, and it's us (the kernel) who
    // are currently controlling the CPU Lock state
    unsafe {
        Traits::enter_cpu_lock();
    }

    // Safety: We just entered a CPU Lock state
    Ok(unsafe { assume_cpu_lock() })
}

/// Assume a CPU Lock state and get `CpuLockGuard`.
///
/// # Safety
///
/// The system must be really in a CPU Lock state.
pub(crate) unsafe fn assume_cpu_lock<Traits: Port>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        token: CpuLockToken {
            _phantom: PhantomData,
        },
    }
}

/// RAII guard for a CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(crate) struct CpuLockGuard<Traits: Port> {
    token: CpuLockToken<Traits>,
}

impl<Traits: Port> CpuLockGuard<Traits> {
    /// Borrow the token, reborrowable down a call chain.
    pub(crate) fn borrow_mut(&mut self) -> CpuLockGuardBorrowMut<'_, Traits> {
        &mut self.token
    }
}

impl<Traits: Port> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is currently active, and it's us (the kernel) who
        // are currently controlling the CPU Lock state
        unsafe {
            Traits::leave_cpu_lock();
        }
    }
}

impl<Traits: Port> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: Port> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
