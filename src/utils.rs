//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

/// Alignment of every block header and payload inside the arena. Payload pointers
/// handed to the user are always a multiple of the computer's pointer size.
pub const ALIGNMENT: usize = std::mem::size_of::<usize>();

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// This method is used to round requested sizes up to a multiple of [`ALIGNMENT`]
/// so that every block header that follows a payload stays aligned.
#[inline]
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    debug_assert!(aligment.is_power_of_two());
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Index of the highest set bit of `value`, that is `floor(log2(value))`.
///
/// `value` must be non-zero.
#[inline]
pub const fn floor_log2(value: usize) -> u32 {
    debug_assert!(value != 0);
    usize::BITS - 1 - value.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn align_pointer_size() {
        let aligments = vec![(1..8, 8), (9..16, 16), (17..24, 24), (25..32, 32)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, mem::size_of::<u64>()));
            }
        }
    }

    #[test]
    fn already_aligned_sizes_are_kept() {
        for size in [0, 8, 16, 256, 4096] {
            assert_eq!(size, align(size, 8));
        }
    }

    #[test]
    fn floor_log2_of_powers_and_neighbours() {
        assert_eq!(0, floor_log2(1));
        assert_eq!(7, floor_log2(255));
        assert_eq!(8, floor_log2(256));
        assert_eq!(8, floor_log2(257));
        assert_eq!(10, floor_log2(1121));
        assert_eq!(usize::BITS - 1, floor_log2(usize::MAX));
    }
}
