use std::{mem, ptr::NonNull};

use crate::{
    block::{BLOCK_HEADER_SIZE, BlockRef, FreeLinks, Header},
    error::ArenaError,
    kernel::{os_page_size, request_memory, return_memory},
    utils::{ALIGNMENT, align},
};

/// The single memory reservation the allocator manages.
///
/// [`libc::mmap`] gives us a region aligned with the computer page size. The
/// whole region is subdivided end to end into blocks, every byte belongs to
/// exactly one block:
///
/// ```text
/// base                                                          base + len
/// +--------+---------+--------+-------------+--------+----------------+
/// | Header | payload | Header |   payload   | Header |    payload     |
/// +--------+---------+--------+-------------+--------+----------------+
///  block 0             block 1                block 2
/// ```
///
/// Blocks are addressed by offset ([`BlockRef`]), never by reference, so the
/// arena is the only place that turns an offset back into memory.
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
    /// `len` rounded up to whole OS pages, what was actually mapped.
    mapped: usize,
}

// The arena exclusively owns its mapping, moving it to another thread moves
// that ownership along with it.
unsafe impl Send for Arena {}

impl Arena {
    /// Reserves `len` bytes from the operating system.
    pub fn reserve(len: usize) -> Result<Self, ArenaError> {
        assert!(len > 0, "cannot reserve an empty arena");

        let mapped = align(len, os_page_size());
        let base = unsafe { request_memory(mapped) }.ok_or(ArenaError::ReserveFailed { size: len })?;

        Ok(Self { base, len, mapped })
    }

    /// Size of the arena in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Address of the first arena byte.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Tells whether `ptr` points inside the arena.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.len
    }

    /// Arena offset of `ptr`. Panics if `ptr` is outside the arena.
    #[inline]
    pub fn offset_of(&self, ptr: NonNull<u8>) -> usize {
        assert!(self.contains(ptr), "pointer {ptr:p} is outside the arena");
        ptr.as_ptr() as usize - self.base.as_ptr() as usize
    }

    #[inline]
    fn check_header(&self, block: BlockRef) {
        debug_assert!(block.offset() % ALIGNMENT == 0, "misaligned block {block:?}");
        debug_assert!(
            block.offset() + BLOCK_HEADER_SIZE <= self.len,
            "block {block:?} outside the arena"
        );
    }

    /// Tells whether the flag bytes at `block` hold valid `bool`s, so the bytes
    /// can be viewed as a [`Header`]. Checked on offsets that come from outside,
    /// where `block` may well point into the middle of a payload.
    pub fn has_valid_flags(&self, block: BlockRef) -> bool {
        if block.offset() % ALIGNMENT != 0 || block.payload_offset() > self.len {
            return false;
        }
        [mem::offset_of!(Header, is_free), mem::offset_of!(Header, touched)]
            .into_iter()
            .all(|field| {
                let byte = unsafe { self.base.as_ptr().add(block.offset() + field).read() };
                byte <= 1
            })
    }

    /// Header of `block`.
    #[inline]
    pub fn header(&self, block: BlockRef) -> &Header {
        self.check_header(block);
        unsafe { &*self.base.as_ptr().add(block.offset()).cast::<Header>() }
    }

    /// Mutable header of `block`.
    #[inline]
    pub fn header_mut(&mut self, block: BlockRef) -> &mut Header {
        self.check_header(block);
        unsafe { &mut *self.base.as_ptr().add(block.offset()).cast::<Header>() }
    }

    /// Writes a brand new header at `block`, used when a block is carved out
    /// of untouched space or split from a larger one.
    #[inline]
    pub fn write_header(&mut self, block: BlockRef, header: Header) {
        self.check_header(block);
        assert!(
            block.payload_offset() + header.size <= self.len,
            "block {block:?} of {} bytes overruns the arena",
            header.size
        );
        unsafe {
            self.base
                .as_ptr()
                .add(block.offset())
                .cast::<Header>()
                .write(header)
        }
    }

    /// Free-list links stored in the payload of a free block.
    #[inline]
    pub(crate) fn links(&self, block: BlockRef) -> FreeLinks {
        debug_assert!(self.header(block).size >= mem::size_of::<FreeLinks>());
        unsafe {
            self.base
                .as_ptr()
                .add(block.payload_offset())
                .cast::<FreeLinks>()
                .read()
        }
    }

    #[inline]
    pub(crate) fn set_links(&mut self, block: BlockRef, links: FreeLinks) {
        debug_assert!(self.header(block).size >= mem::size_of::<FreeLinks>());
        unsafe {
            self.base
                .as_ptr()
                .add(block.payload_offset())
                .cast::<FreeLinks>()
                .write(links)
        }
    }

    /// Offset one past the last payload byte of `block`.
    #[inline]
    pub fn block_end(&self, block: BlockRef) -> usize {
        block.payload_offset() + self.header(block).size
    }

    /// Physical right neighbor of `block`, `None` for the last block.
    #[inline]
    pub fn right_neighbor(&self, block: BlockRef) -> Option<BlockRef> {
        let end = self.block_end(block);
        (end < self.len).then_some(BlockRef(end))
    }

    /// Physical left neighbor of `block`, `None` for the first block.
    #[inline]
    pub fn left_neighbor(&self, block: BlockRef) -> Option<BlockRef> {
        if block.offset() == 0 {
            return None;
        }
        let distance = BLOCK_HEADER_SIZE + self.header(block).left_size;
        debug_assert!(distance <= block.offset(), "corrupted boundary tag at {block:?}");
        Some(BlockRef(block.offset() - distance))
    }

    /// Pointer to the payload of `block`.
    #[inline]
    pub fn payload(&self, block: BlockRef) -> NonNull<u8> {
        unsafe { self.base.add(block.payload_offset()) }
    }

    /// Block owning the payload `ptr`. Panics if `ptr` is outside the arena or
    /// cannot be the start of a payload.
    #[inline]
    pub fn block_of(&self, ptr: NonNull<u8>) -> BlockRef {
        let offset = self.offset_of(ptr);
        assert!(
            offset >= BLOCK_HEADER_SIZE && offset % ALIGNMENT == 0,
            "pointer {ptr:p} is not a block payload"
        );
        BlockRef(offset - BLOCK_HEADER_SIZE)
    }

    /// Iterates every block of the arena from left to right.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            arena: self,
            next: Some(BlockRef(0)),
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { return_memory(self.base, self.mapped) }
    }
}

/// Left to right walk over the blocks of an [`Arena`]. The arena must already
/// be tiled with valid headers.
pub struct Blocks<'a> {
    arena: &'a Arena,
    next: Option<BlockRef>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockRef;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        // A corrupted size would walk past the end, stop instead of reading garbage.
        self.next = match block.payload_offset().checked_add(self.arena.header(block).size) {
            Some(end) if end + BLOCK_HEADER_SIZE <= self.arena.len => Some(BlockRef(end)),
            _ => None,
        };
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(size: usize, left_size: usize, is_free: bool) -> Header {
        Header {
            size,
            left_size,
            is_free,
            touched: false,
        }
    }

    /// Lays out three blocks of 64, 128 and the rest over a 4 KiB arena.
    fn three_blocks() -> Arena {
        let mut arena = Arena::reserve(4096).unwrap();
        let a = BlockRef(0);
        let b = BlockRef(BLOCK_HEADER_SIZE + 64);
        let c = BlockRef(b.offset() + BLOCK_HEADER_SIZE + 128);
        let rest = 4096 - c.offset() - BLOCK_HEADER_SIZE;

        arena.write_header(a, header(64, 0, false));
        arena.write_header(b, header(128, 64, true));
        arena.write_header(c, header(rest, 128, false));
        arena
    }

    #[test]
    fn neighbors_are_derived_from_sizes() {
        let arena = three_blocks();
        let blocks: Vec<_> = arena.blocks().collect();
        assert_eq!(3, blocks.len());

        let (a, b, c) = (blocks[0], blocks[1], blocks[2]);
        assert_eq!(None, arena.left_neighbor(a));
        assert_eq!(Some(b), arena.right_neighbor(a));
        assert_eq!(Some(a), arena.left_neighbor(b));
        assert_eq!(Some(c), arena.right_neighbor(b));
        assert_eq!(Some(b), arena.left_neighbor(c));
        assert_eq!(None, arena.right_neighbor(c));
        assert_eq!(4096, arena.block_end(c));
    }

    #[test]
    fn payload_and_block_round_trip() {
        let arena = three_blocks();
        for block in arena.blocks() {
            let ptr = arena.payload(block);
            assert!(arena.contains(ptr));
            assert_eq!(block, arena.block_of(ptr));
            assert_eq!(0, ptr.as_ptr() as usize % ALIGNMENT);
        }
    }

    #[test]
    fn links_live_in_the_payload() {
        let mut arena = three_blocks();
        let b = BlockRef(BLOCK_HEADER_SIZE + 64);
        arena.set_links(b, FreeLinks { prev: 0, next: 8 });
        assert_eq!(FreeLinks { prev: 0, next: 8 }, arena.links(b));
        assert_eq!(128, arena.header(b).size);
    }

    #[test]
    fn flags_are_checked_before_reading_a_header() {
        let arena = three_blocks();
        assert!(arena.blocks().all(|block| arena.has_valid_flags(block)));

        // Payload bytes of the first block viewed as a header.
        let payload = arena.payload(BlockRef(0));
        unsafe { payload.as_ptr().write_bytes(0xAB, 64) };
        assert!(!arena.has_valid_flags(BlockRef(BLOCK_HEADER_SIZE)));
        // Misaligned or past the end.
        assert!(!arena.has_valid_flags(BlockRef(3)));
        assert!(!arena.has_valid_flags(BlockRef(4096)));
    }

    #[test]
    #[should_panic(expected = "outside the arena")]
    fn foreign_pointer_is_rejected() {
        let arena = three_blocks();
        let mut local = 0u8;
        arena.block_of(NonNull::from(&mut local));
    }
}
