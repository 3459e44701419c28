use std::mem;

use crate::utils::{ALIGNMENT, align};

/// Header size of a block, rounded up so the payload that follows stays aligned.
pub const BLOCK_HEADER_SIZE: usize = align(mem::size_of::<Header>(), ALIGNMENT);

/// Smallest payload a block may have. A free block keeps its [`FreeLinks`]
/// inside the payload, so anything smaller could not be put back on a free list.
pub const MIN_PAYLOAD_SIZE: usize = align(mem::size_of::<FreeLinks>(), ALIGNMENT);

/// A remainder is only carved into its own block when it can hold a header plus
/// the minimum payload. Smaller tails stay attached to the block they came from.
pub const MIN_SPLIT_SIZE: usize = BLOCK_HEADER_SIZE + MIN_PAYLOAD_SIZE;

/// Sentinel used by [`FreeLinks`] for "no block".
pub(crate) const NIL: usize = usize::MAX;

/// Reference to a block by the arena offset of its header.
///
/// Offsets stay valid for as long as the block exists, regardless of where the
/// arena itself is mapped, so free lists never hold raw addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef(pub(crate) usize);

impl BlockRef {
    /// Arena offset of the block header.
    #[inline]
    pub fn offset(self) -> usize {
        self.0
    }

    /// Arena offset of the first payload byte.
    #[inline]
    pub fn payload_offset(self) -> usize {
        self.0 + BLOCK_HEADER_SIZE
    }
}

/// This is the structure of a block. The fields of the block are its metadata,
/// content is placed after this header.
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        |
/// |      left_size      |        | -> Header
/// +---------------------+        |
/// |  is_free | touched  |        |
/// +---------------------+ <------+
/// |       Content       |        |
/// |         ...         |        | -> Addressable content (`size` bytes)
/// |         ...         |        |
/// +---------------------+ <------+
/// ```
///
/// Blocks tile the arena with no gaps, so the right neighbor starts at
/// `offset + BLOCK_HEADER_SIZE + size` and the left neighbor starts at
/// `offset - BLOCK_HEADER_SIZE - left_size`. Keeping `left_size` (a boundary
/// tag) is what makes coalescing with the left neighbor O(1).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// Payload bytes, header excluded.
    pub size: usize,
    /// Payload size of the physical left neighbor. Meaningless for the first block.
    pub left_size: usize,
    /// Flag to tell whether the block is free or not.
    pub is_free: bool,
    /// Set when the owner touches the block, cleared when eviction passes over it.
    pub touched: bool,
}

/// Free-list links of a free block. They live in the first bytes of the
/// payload, which is unused while the block is free:
///
/// ```text
/// +------------------------+
/// |         Header         |
/// +------------------------+
/// |   prev  |    next      | -> FreeLinks
/// +------------------------+
/// |    unused payload      |
/// +------------------------+
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeLinks {
    pub prev: usize,
    pub next: usize,
}

impl FreeLinks {
    pub const UNLINKED: Self = Self {
        prev: NIL,
        next: NIL,
    };
}

#[inline]
pub(crate) fn link(offset: usize) -> Option<BlockRef> {
    (offset != NIL).then_some(BlockRef(offset))
}

#[inline]
pub(crate) fn unlink(block: Option<BlockRef>) -> usize {
    block.map_or(NIL, BlockRef::offset)
}
