//! The per-block header word and size rounding.
//!
//! Every block starts with a single machine word encoding two fields: the
//! payload size in bytes and the in-use flag. Payload sizes are always
//! multiples of [`ALIGNMENT`], so the low bit of the word is never part of
//! the size and can carry the flag instead. All call sites go through the
//! typed accessors below; no other module touches the bit layout.
use crate::ALIGNMENT;

use core::fmt;
use core::mem;

/// The in-use flag lives in the lowest bit of the header word.
const USED_BIT: usize = 0b1;

/// Round `n` up to the next multiple of `align` (a power of two).
pub const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// A block header: payload size plus the in-use flag, packed into one word.
///
/// The encoded word equals `size | used_bit`. [`size()`](Self::size) always
/// reports the true payload size with the flag masked out.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header(usize);

impl Header {
    /// The number of bytes a header occupies in the region.
    pub const SIZE: usize = mem::size_of::<Self>();

    /// Create a header for a free block with the given payload size.
    pub const fn free(size: usize) -> Self {
        debug_assert!(size % ALIGNMENT == 0);
        Self(size)
    }

    /// Create a header for an in-use block with the given payload size.
    pub const fn used(size: usize) -> Self {
        debug_assert!(size % ALIGNMENT == 0);
        Self(size | USED_BIT)
    }

    /// The true payload size in bytes (the in-use flag masked out).
    pub const fn size(self) -> usize {
        self.0 & !USED_BIT
    }

    /// Whether the block is currently handed out to a caller.
    pub const fn is_used(self) -> bool {
        self.0 & USED_BIT != 0
    }

    /// The same header with the in-use flag set.
    pub const fn into_used(self) -> Self {
        Self(self.0 | USED_BIT)
    }

    /// The same header with the in-use flag cleared.
    pub const fn into_free(self) -> Self {
        Self(self.0 & !USED_BIT)
    }

    /// The raw word as stored in the region.
    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// Reconstruct a header from a word read out of the region.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_used() { "used" } else { "free" };
        write!(f, "Header({state}, {})", self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::{round_up, Header};

    #[test]
    fn rounding() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(9, 8), 16);
        assert_eq!(round_up(23, 8), 24);
        assert_eq!(round_up(1024, 8), 1024);
    }

    #[test]
    fn flag_packing() {
        let free = Header::free(24);
        assert_eq!(free.size(), 24);
        assert!(!free.is_used());

        let used = Header::used(24);
        assert_eq!(used.size(), 24);
        assert!(used.is_used());

        assert_eq!(free.into_used(), used);
        assert_eq!(used.into_free(), free);
    }

    #[test]
    fn flag_survives_raw_round_trip() {
        let header = Header::used(120);
        assert_eq!(Header::from_raw(header.as_raw()), header);
        assert_eq!(header.as_raw(), 120 | 1);
    }

    #[test]
    fn zero_size_free_block() {
        // the implicit variant can leave a trailing free block of size 0
        let header = Header::free(0);
        assert_eq!(header.size(), 0);
        assert!(!header.is_used());
    }
}
