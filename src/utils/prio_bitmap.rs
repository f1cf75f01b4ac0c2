//! Provides `ReadyBitmap`, a fixed 32-entry bit set supporting a
//! constant-time highest-priority scan.
use core::fmt;

use super::Init;

/// The number of priority levels representable by [`ReadyBitmap`].
pub const READY_BITMAP_LEN: usize = 32;

/// A bit set with one bit per user priority level.
///
/// Priority `p` (`0..32`, lower number = higher priority) is stored in bit
/// `31 - p`, so a count-leading-zeros of the raw word yields the
/// highest-priority set entry directly, and the all-clear word scans to `32`,
/// the index of the idle level, which deliberately lives outside the bitmap.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ReadyBitmap {
    bits: u32,
}

impl Init for ReadyBitmap {
    const INIT: Self = Self { bits: 0 };
}

impl fmt::Debug for ReadyBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..READY_BITMAP_LEN as u8).filter(|&i| self.get(i)))
            .finish()
    }
}

impl ReadyBitmap {
    /// Get the bit for priority level `i`.
    pub fn get(&self, i: u8) -> bool {
        assert!((i as usize) < READY_BITMAP_LEN);
        self.bits & (1 << (31 - i)) != 0
    }

    /// Set the bit for priority level `i`.
    pub fn set(&mut self, i: u8) {
        assert!((i as usize) < READY_BITMAP_LEN);
        self.bits |= 1 << (31 - i);
    }

    /// Clear the bit for priority level `i`.
    pub fn clear(&mut self, i: u8) {
        assert!((i as usize) < READY_BITMAP_LEN);
        self.bits &= !(1 << (31 - i));
    }

    /// Get the highest-priority (numerically smallest) set entry. Returns
    /// `32` when no entry is set.
    pub fn find_first(&self) -> u8 {
        self.bits.leading_zeros() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    /// A modifying operation on `ReadyBitmap`.
    #[derive(Debug)]
    enum Cmd {
        Insert(u8),
        Remove(u8),
    }

    /// Map random bytes to operations on `ReadyBitmap`.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if let Some(instr) = bytecode.get(i..i + 2) {
                i += 2;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = instr[1] % READY_BITMAP_LEN as u8;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let j = instr[1] as usize % known_set_bits.len();
                    Some(Cmd::Remove(known_set_bits.swap_remove(j)))
                }
            } else {
                None
            }
        })
    }

    #[quickcheck]
    fn matches_reference_model(bytecode: Vec<u8>) {
        let mut subject = ReadyBitmap::INIT;
        let mut reference = BTreeSet::new();

        for cmd in interpret(&bytecode) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.insert(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.remove(&bit);
                }
            }

            assert_eq!(
                subject.find_first(),
                reference.iter().next().copied().unwrap_or(32)
            );
        }

        let set_bits: Vec<u8> = (0..READY_BITMAP_LEN as u8)
            .filter(|&i| subject.get(i))
            .collect();
        assert_eq!(set_bits, reference.iter().copied().collect::<Vec<u8>>());
    }

    #[test]
    fn empty_scans_to_idle() {
        assert_eq!(ReadyBitmap::INIT.find_first(), 32);
    }

    #[test]
    fn highest_priority_wins() {
        let mut bitmap = ReadyBitmap::INIT;
        bitmap.set(31);
        bitmap.set(4);
        bitmap.set(17);
        assert_eq!(bitmap.find_first(), 4);
        bitmap.clear(4);
        assert_eq!(bitmap.find_first(), 17);
    }
}
