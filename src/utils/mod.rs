//! Utility
mod init;
pub mod mem;
mod prio_bitmap;
pub use self::{init::*, prio_bitmap::*};

/// Compare two optional references by identity.
pub(crate) fn ptr_eq_opt<T>(a: Option<&T>, b: Option<&T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => core::ptr::eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
