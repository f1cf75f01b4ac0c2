use core::mem::{ManuallyDrop, MaybeUninit};

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self;
}

impl<T: 'static> Init for &'_ [T] {
    const INIT: Self = &[];
}

impl Init for &'_ str {
    const INIT: Self = "";
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: Init, const LEN: usize> Init for [T; LEN] {
    const INIT: Self = {
        let mut array = super::mem::uninit_array::<T, LEN>();

        let mut i = 0;
        while i < LEN {
            array[i] = MaybeUninit::new(T::INIT);
            i += 1;
        }

        // Safety: The memory layout of `[MaybeUninit<T>; LEN]` is identical to
        // `[T; LEN]`. We initialized all elements, so it's safe to reinterpret
        // that range as `[T; LEN]`.
        unsafe { super::mem::transmute(array) }
    };
}

impl<T: Init> Init for ManuallyDrop<T> {
    const INIT: Self = ManuallyDrop::new(T::INIT);
}

impl<T> Init for MaybeUninit<T> {
    const INIT: Self = MaybeUninit::uninit();
}

macro_rules! impl_init {
    (
        $(
            $( #[$meta:meta] )*
            $ty:ty => $value:expr,
        )*
    ) => {
        $(
            $( #[$meta] )*
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    char => '\0',
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    u128 => 0,
    i8 => 0,
    i16 => 0,
    i32 => 0,
    i64 => 0,
    i128 => 0,
    usize => 0,
    isize => 0,
    () => (),
}
