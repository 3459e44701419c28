use std::{collections::HashSet, ptr::NonNull};

use log::{debug, trace, warn};

use crate::{
    arena::Arena,
    block::{BLOCK_HEADER_SIZE, BlockRef, Header, MIN_PAYLOAD_SIZE, MIN_SPLIT_SIZE},
    config::Config,
    error::{ArenaError, IntegrityError},
    freelist::SizeClassIndex,
    pages::PageTable,
    utils::{ALIGNMENT, align},
};

/// Snapshot of the allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Size of the arena.
    pub total_size: usize,
    /// Payload bytes of used blocks.
    pub used_bytes: usize,
    /// Payload bytes of free blocks.
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Successful allocations since creation.
    pub allocations: u64,
    /// Explicit frees since creation, evictions excluded.
    pub frees: u64,
    pub evictions: u64,
    /// Requests answered with `None`.
    pub failed_allocations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    used_bytes: usize,
    used_blocks: usize,
    blocks: usize,
    allocations: u64,
    frees: u64,
    evictions: u64,
    failed_allocations: u64,
}

/// Fixed capacity heap that evicts instead of failing.
///
/// All the memory is reserved once, up front, and carved into blocks that are
/// either used or free. Free blocks live in a [`SizeClassIndex`] and are merged
/// with their free neighbors as soon as they are released, so two free blocks
/// are never adjacent. When no free block can satisfy a request, the
/// [`PageTable`] picks a cold page and its used blocks are evicted, each one
/// reported to the caller through a callback, until the request fits.
///
/// ```text
///                 allocate_or_evict(size)
///                          |
///                          v
///              +----------------------+   hit    +-------------------+
///              |   SizeClassIndex     | -------> | split, mark used  |
///              +----------------------+          +-------------------+
///                          | miss
///                          v
///              +----------------------+          +-------------------+
///              | PageTable: victim    | -------> | evict used blocks |
///              +----------------------+          | on_evict(ptr)     |
///                          ^                     | coalesce, index   |
///                          +---------------------+-------------------+
/// ```
///
/// The allocator is single threaded. Callers that share it must serialize
/// access themselves, and the eviction callback must not call back into it.
pub struct MemAlloc {
    arena: Arena,
    index: SizeClassIndex,
    pages: PageTable,
    counters: Counters,
}

impl MemAlloc {
    /// Reserves an arena of `total_size` bytes tracked in pages of `page_size` bytes.
    pub fn new(total_size: usize, page_size: usize) -> Result<Self, ArenaError> {
        Self::with_config(Config::new(total_size, page_size))
    }

    pub fn with_config(config: Config) -> Result<Self, ArenaError> {
        config.validate()?;

        let mut arena = Arena::reserve(config.total_size)?;
        let max_size = config.total_size - BLOCK_HEADER_SIZE;
        let mut index = SizeClassIndex::new(max_size);
        let mut pages = PageTable::new(config.page_size, config.total_size);

        // The whole arena starts as one free block.
        let first = BlockRef(0);
        arena.write_header(
            first,
            Header {
                size: max_size,
                left_size: 0,
                is_free: true,
                touched: false,
            },
        );
        pages.header_created(first.offset());
        index.put_block(&mut arena, first);

        debug!(
            "memalloc: reserved {} bytes at {:p} in {} pages of {} bytes",
            config.total_size,
            arena.base(),
            pages.num_pages(),
            pages.page_size()
        );

        Ok(Self {
            arena,
            index,
            pages,
            counters: Counters {
                blocks: 1,
                ..Counters::default()
            },
        })
    }

    /// Largest request that can ever be satisfied.
    #[inline]
    pub fn max_allocation_size(&self) -> usize {
        self.index.max_size()
    }

    /// Size of the arena in bytes.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.arena.len()
    }

    pub fn page_table(&self) -> &PageTable {
        &self.pages
    }

    /// Tells whether `ptr` points inside the arena.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.arena.contains(ptr)
    }

    /// Payload size for a request: aligned, and never below what a free block
    /// needs to hold its free-list links.
    #[inline]
    fn block_size_for(requested: usize) -> usize {
        align(requested, ALIGNMENT).max(MIN_PAYLOAD_SIZE)
    }

    /// Allocates without evicting anything, `None` when no free block fits.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_or_evict(size, false, |_| {})
    }

    /// Allocates `requested` bytes. When no free block fits and
    /// `allow_eviction` is set, used blocks from the coldest pages are evicted
    /// until one does. `on_evict` is called once per evicted pointer, before
    /// its memory can be handed out again, and must drop every reference to it.
    ///
    /// Returns `None` when the request is larger than the arena, or when no
    /// block fits and eviction is not allowed.
    pub fn allocate_or_evict<F>(
        &mut self,
        requested: usize,
        allow_eviction: bool,
        mut on_evict: F,
    ) -> Option<NonNull<u8>>
    where
        F: FnMut(NonNull<u8>),
    {
        if requested > self.max_allocation_size() {
            warn!(
                "memalloc: request of {requested} bytes exceeds the arena capacity of {}",
                self.max_allocation_size()
            );
            self.counters.failed_allocations += 1;
            return None;
        }
        let size = Self::block_size_for(requested);

        loop {
            if let Some(block) = self.index.try_get_block(&mut self.arena, size) {
                let ptr = self.take(block, size);
                trace!("memalloc: alloc({requested}) -> {ptr:p}");
                return Some(ptr);
            }

            if !allow_eviction {
                trace!("memalloc: alloc({requested}) -> no space");
                self.counters.failed_allocations += 1;
                return None;
            }

            let Some(page) = self.pages.select_victim_page() else {
                warn!("memalloc: alloc({requested}) -> no space, nothing left to evict");
                self.counters.failed_allocations += 1;
                return None;
            };
            self.evict_page(page, size, &mut on_evict);
        }
    }

    /// Releases the used block at `ptr` and merges it with its free neighbors.
    ///
    /// Panics when `ptr` is not a used block of this allocator.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let block = self.used_block_of(ptr);
        self.mark_free(block);
        self.counters.frees += 1;
        self.release(block);
        trace!("memalloc: free({ptr:p})");
    }

    /// Resizes the used block at `ptr` without moving it.
    ///
    /// Shrinking always succeeds, the tail is given back when it is large
    /// enough to be a block of its own. Growing only succeeds when the right
    /// neighbor is free and large enough to absorb. On `false` nothing changed
    /// and the caller has to allocate, copy and free on its own.
    pub fn realloc_inplace(&mut self, ptr: NonNull<u8>, new_size: usize) -> bool {
        let block = self.used_block_of(ptr);
        if new_size > self.max_allocation_size() {
            return false;
        }
        let size = Self::block_size_for(new_size);
        let current = self.arena.header(block).size;

        if size > current {
            let Some(right) = self
                .arena
                .right_neighbor(block)
                .filter(|right| self.arena.header(*right).is_free)
            else {
                trace!("memalloc: realloc_inplace({ptr:p}, {new_size}) -> right neighbor in use");
                return false;
            };
            if current + BLOCK_HEADER_SIZE + self.arena.header(right).size < size {
                trace!("memalloc: realloc_inplace({ptr:p}, {new_size}) -> right neighbor too small");
                return false;
            }
            self.index.remove_block(&mut self.arena, right);
            self.absorb_right(block, right);
        }

        if let Some(tail) = self.split(block, size) {
            self.release(tail);
        }

        let resized = self.arena.header(block).size;
        self.counters.used_bytes = self.counters.used_bytes + resized - current;
        trace!("memalloc: realloc_inplace({ptr:p}, {new_size}) {current} -> {resized}");
        true
    }

    /// Marks the block at `ptr` and its page as recently used. The allocator
    /// never does this on its own, the owner calls it on every access.
    pub fn touch(&mut self, ptr: NonNull<u8>) {
        let block = self.used_block_of(ptr);
        self.arena.header_mut(block).touched = true;
        self.pages.touch(block.offset());
    }

    /// Index of the page the used block at `ptr` is accounted to.
    pub fn page_of(&self, ptr: NonNull<u8>) -> usize {
        self.pages.page_index(self.used_block_of(ptr).offset())
    }

    /// Payload size of the used block at `ptr`, at least what was requested.
    pub fn size_of(&self, ptr: NonNull<u8>) -> usize {
        self.arena.header(self.used_block_of(ptr)).size
    }

    pub fn stats(&self) -> Stats {
        let headers = self.counters.blocks * BLOCK_HEADER_SIZE;
        Stats {
            total_size: self.total_size(),
            used_bytes: self.counters.used_bytes,
            free_bytes: self.total_size() - headers - self.counters.used_bytes,
            used_blocks: self.counters.used_blocks,
            free_blocks: self.index.len(),
            allocations: self.counters.allocations,
            frees: self.counters.frees,
            evictions: self.counters.evictions,
            failed_allocations: self.counters.failed_allocations,
        }
    }

    /// Block behind a pointer handed out by this allocator. Panics unless the
    /// pointer is the payload of a used block.
    fn used_block_of(&self, ptr: NonNull<u8>) -> BlockRef {
        let block = self.arena.block_of(ptr);
        assert!(self.arena.has_valid_flags(block), "pointer {ptr:p} does not start a block");
        let header = self.arena.header(block);
        assert!(!header.is_free, "pointer {ptr:p} is not in use (double free?)");
        assert!(
            block
                .payload_offset()
                .checked_add(header.size)
                .is_some_and(|end| end <= self.arena.len()),
            "pointer {ptr:p} does not start a block"
        );
        if let Some(right) = self.arena.right_neighbor(block) {
            assert_eq!(
                header.size,
                self.arena.header(right).left_size,
                "pointer {ptr:p} does not start a block"
            );
        }
        block
    }

    /// Turns a free block fresh out of the index into a used block of `size` bytes.
    fn take(&mut self, block: BlockRef, size: usize) -> NonNull<u8> {
        // Marked used before the tail goes back, so the tail never merges into it.
        let header = self.arena.header_mut(block);
        header.is_free = false;
        header.touched = false;

        if let Some(tail) = self.split(block, size) {
            self.release(tail);
        }
        let size = self.arena.header(block).size;

        self.pages.block_used(block.offset());
        self.counters.used_bytes += size;
        self.counters.used_blocks += 1;
        self.counters.allocations += 1;

        self.arena.payload(block)
    }

    /// Cuts `block` down to `size` bytes and returns the remainder as a new,
    /// unindexed free block. Nothing happens when the remainder could not hold
    /// a header and the minimum payload. `block` must not be indexed.
    fn split(&mut self, block: BlockRef, size: usize) -> Option<BlockRef> {
        let current = self.arena.header(block).size;
        if current < size + MIN_SPLIT_SIZE {
            return None;
        }

        let tail = BlockRef(block.payload_offset() + size);
        let tail_size = current - size - BLOCK_HEADER_SIZE;

        self.arena.header_mut(block).size = size;
        self.arena.write_header(
            tail,
            Header {
                size: tail_size,
                left_size: size,
                is_free: true,
                touched: false,
            },
        );
        if let Some(right) = self.arena.right_neighbor(tail) {
            self.arena.header_mut(right).left_size = tail_size;
        }
        self.pages.header_created(tail.offset());
        self.counters.blocks += 1;

        Some(tail)
    }

    /// Merges the unindexed `right` neighbor into `block`.
    fn absorb_right(&mut self, block: BlockRef, right: BlockRef) {
        debug_assert_eq!(Some(right), self.arena.right_neighbor(block));

        let next = self.arena.right_neighbor(right);
        let size = self.arena.header(block).size + BLOCK_HEADER_SIZE + self.arena.header(right).size;

        self.arena.header_mut(block).size = size;
        if let Some(next) = next {
            self.arena.header_mut(next).left_size = size;
        }
        self.pages.header_destroyed(right.offset(), next.map(BlockRef::offset));
        self.counters.blocks -= 1;
    }

    /// Bookkeeping for a used block that is about to become free.
    fn mark_free(&mut self, block: BlockRef) {
        let header = self.arena.header_mut(block);
        header.is_free = true;
        header.touched = false;
        let size = header.size;

        self.pages.block_released(block.offset());
        self.counters.used_bytes -= size;
        self.counters.used_blocks -= 1;
    }

    /// Coalesces the unindexed free `block` with its free neighbors and puts the
    /// result in the index. Returns the merged block.
    fn release(&mut self, block: BlockRef) -> BlockRef {
        debug_assert!(self.arena.header(block).is_free);

        if let Some(right) = self
            .arena
            .right_neighbor(block)
            .filter(|right| self.arena.header(*right).is_free)
        {
            self.index.remove_block(&mut self.arena, right);
            self.absorb_right(block, right);
        }

        let merged = match self
            .arena
            .left_neighbor(block)
            .filter(|left| self.arena.header(*left).is_free)
        {
            Some(left) => {
                self.index.remove_block(&mut self.arena, left);
                self.absorb_right(left, block);
                left
            }
            None => block,
        };

        self.index.put_block(&mut self.arena, merged);
        merged
    }

    /// Evicts used blocks whose header lives in `page` until a free block of
    /// `needed` bytes exists or the page is exhausted. Touched blocks survive
    /// the first pass with their bit cleared, if that pass evicted nothing the
    /// second one takes everything.
    fn evict_page<F>(&mut self, page: usize, needed: usize, on_evict: &mut F)
    where
        F: FnMut(NonNull<u8>),
    {
        let (first_header, end) = {
            let page = &self.pages.pages()[page];
            (page.first_header(), page.end)
        };
        let mut evicted = 0usize;

        for second_chance in [true, false] {
            let mut cursor = first_header.map(BlockRef);

            while let Some(block) = cursor.filter(|block| block.offset() < end) {
                let header = self.arena.header(block);
                if header.is_free {
                    cursor = self.arena.right_neighbor(block);
                    continue;
                }
                if second_chance && header.touched {
                    self.arena.header_mut(block).touched = false;
                    cursor = self.arena.right_neighbor(block);
                    continue;
                }

                let merged = self.evict(block, on_evict);
                evicted += 1;
                if self.arena.header(merged).size >= needed {
                    debug!("memalloc: evicted {evicted} blocks from page {page}, {needed} bytes available");
                    return;
                }
                cursor = self.arena.right_neighbor(merged);
            }

            if evicted > 0 {
                break;
            }
        }

        debug!("memalloc: evicted {evicted} blocks from page {page}");
    }

    fn evict(&mut self, block: BlockRef, on_evict: &mut impl FnMut(NonNull<u8>)) -> BlockRef {
        let ptr = self.arena.payload(block);
        trace!("memalloc: evicting {ptr:p}");
        on_evict(ptr);

        self.mark_free(block);
        self.counters.evictions += 1;
        self.release(block)
    }

    /// Walks every block and checks the structure: blocks tile the whole arena,
    /// boundary tags match, no two free blocks touch, the index holds exactly
    /// the free blocks and the page counters match the blocks they describe.
    pub fn verify(&self) -> Result<(), IntegrityError> {
        let indexed: HashSet<BlockRef> = self.index.iter(&self.arena).collect();
        let mut used_per_page = vec![0usize; self.pages.num_pages()];
        let mut first_per_page = vec![None; self.pages.num_pages()];
        let mut covered = 0usize;
        let mut free = 0usize;
        let mut previous: Option<(BlockRef, Header)> = None;

        for block in self.arena.blocks() {
            let header = *self.arena.header(block);
            if block.payload_offset() + header.size > self.arena.len() {
                return Err(IntegrityError::BlockOverrun {
                    offset: block.offset(),
                });
            }
            covered += BLOCK_HEADER_SIZE + header.size;

            if let Some((left, left_header)) = previous {
                if header.left_size != left_header.size {
                    return Err(IntegrityError::BoundaryTag {
                        offset: block.offset(),
                        recorded: header.left_size,
                        actual: left_header.size,
                    });
                }
                if header.is_free && left_header.is_free {
                    return Err(IntegrityError::AdjacentFree {
                        left: left.offset(),
                        right: block.offset(),
                    });
                }
            }

            let page = self.pages.page_index(block.offset());
            first_per_page[page].get_or_insert(block.offset());
            if header.is_free {
                free += 1;
                if !indexed.contains(&block) {
                    return Err(IntegrityError::FreeBlockNotIndexed {
                        offset: block.offset(),
                    });
                }
            } else {
                used_per_page[page] += 1;
            }
            previous = Some((block, header));
        }

        if covered != self.arena.len() {
            return Err(IntegrityError::TilingMismatch {
                covered,
                total: self.arena.len(),
            });
        }
        if indexed.len() != free || self.index.len() != free {
            return Err(IntegrityError::IndexCountMismatch {
                indexed: self.index.len(),
                free,
            });
        }
        for (page, info) in self.pages.pages().iter().enumerate() {
            if info.used_blocks() != used_per_page[page] {
                return Err(IntegrityError::PageUsedCount {
                    page,
                    recorded: info.used_blocks(),
                    actual: used_per_page[page],
                });
            }
            if info.first_header() != first_per_page[page] {
                return Err(IntegrityError::PageFirstHeader {
                    page,
                    recorded: info.first_header(),
                    actual: first_per_page[page],
                });
            }
        }
        Ok(())
    }
}
