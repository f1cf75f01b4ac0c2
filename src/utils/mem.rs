//! `const fn`-compatible memory operations.
use core::mem::{ManuallyDrop, MaybeUninit};

/// Construct an uninitialized array.
pub const fn uninit_array<T, const LEN: usize>() -> [MaybeUninit<T>; LEN] {
    // Safety: An array of `MaybeUninit` is allowed to be entirely
    // uninitialized.
    unsafe { MaybeUninit::<[MaybeUninit<T>; LEN]>::uninit().assume_init() }
}

/// A `const fn`-compatible `core::mem::transmute` that works around the
/// restriction on generic parameters in transmuted types.
///
/// # Safety
///
/// See `core::mem::transmute`. `T` and `U` must have an identical size.
pub const unsafe fn transmute<T, U>(x: T) -> U {
    union Xmute<T, U> {
        from: ManuallyDrop<T>,
        to: ManuallyDrop<U>,
    }

    ManuallyDrop::into_inner(unsafe {
        Xmute {
            from: ManuallyDrop::new(x),
        }
        .to
    })
}
