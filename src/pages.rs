//! Page granular bookkeeping used to pick eviction victims.
//!
//! The arena is cut into fixed size pages that do not care about block
//! boundaries, a block may straddle a page edge. A block belongs to the page its
//! header lives in. Recency is tracked per page instead of per object, and
//! victims are picked with a clock sweep over the pages:
//!
//! ```text
//!            hand
//!             |
//!             v
//! +-------+-------+-------+-------+
//! | ref=1 | ref=0 | ref=1 | ref=0 |
//! | used=3| used=0| used=1| used=2|
//! +-------+-------+-------+-------+
//! ```
//!
//! Starting at the hand, referenced pages lose their bit and get skipped once,
//! pages without used blocks are never picked, the first unreferenced page with
//! used blocks is the victim.

/// Metadata of one page of the arena. All addresses are arena offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// First offset of the page.
    pub begin: usize,
    /// One past the last offset of the page.
    pub end: usize,
    referenced: bool,
    used_blocks: usize,
    first_header: Option<usize>,
}

impl Page {
    /// Whether the page was touched since the clock hand last passed over it.
    #[inline]
    pub fn is_referenced(&self) -> bool {
        self.referenced
    }

    /// Number of used blocks whose header lives in this page.
    #[inline]
    pub fn used_blocks(&self) -> usize {
        self.used_blocks
    }

    /// Offset of the lowest block header inside this page.
    #[inline]
    pub fn first_header(&self) -> Option<usize> {
        self.first_header
    }
}

pub struct PageTable {
    pages: Vec<Page>,
    page_shift: u32,
    arena_size: usize,
    hand: usize,
}

impl PageTable {
    /// Cuts an arena of `arena_size` bytes into pages of `page_size` bytes.
    /// `page_size` must be a power of two.
    pub fn new(page_size: usize, arena_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size {page_size} is not a power of two");

        let pages = (0..arena_size.div_ceil(page_size))
            .map(|i| Page {
                begin: i * page_size,
                end: ((i + 1) * page_size).min(arena_size),
                referenced: false,
                used_blocks: 0,
                first_header: None,
            })
            .collect();

        Self {
            pages,
            page_shift: page_size.trailing_zeros(),
            arena_size,
            hand: 0,
        }
    }

    #[inline]
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        1 << self.page_shift
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Index of the page holding `offset`. Panics outside the arena.
    #[inline]
    pub fn page_index(&self, offset: usize) -> usize {
        assert!(
            offset < self.arena_size,
            "offset {offset} is outside the arena of {} bytes",
            self.arena_size
        );
        offset >> self.page_shift
    }

    /// Page holding `offset`.
    #[inline]
    pub fn page_for(&self, offset: usize) -> &Page {
        &self.pages[self.page_index(offset)]
    }

    /// `(begin, end)` of the page holding `offset`.
    #[inline]
    pub fn page_bounds(&self, offset: usize) -> (usize, usize) {
        let page = self.page_for(offset);
        (page.begin, page.end)
    }

    /// Marks the page holding `offset` as recently used.
    #[inline]
    pub fn touch(&mut self, offset: usize) {
        let index = self.page_index(offset);
        self.pages[index].referenced = true;
    }

    /// Picks the page to evict from, `None` when no page holds a used block.
    ///
    /// Two turns of the clock are enough: the first one clears every reference
    /// bit it passes, so the second one stops at the first page with used blocks.
    pub fn select_victim_page(&mut self) -> Option<usize> {
        let num_pages = self.pages.len();

        for _ in 0..2 * num_pages {
            let index = self.hand;
            self.hand = (self.hand + 1) % num_pages;

            let page = &mut self.pages[index];
            if page.used_blocks == 0 {
                continue;
            }
            if page.referenced {
                page.referenced = false;
                continue;
            }
            return Some(index);
        }

        None
    }

    /// A block with its header at `offset` became used.
    #[inline]
    pub(crate) fn block_used(&mut self, offset: usize) {
        let index = self.page_index(offset);
        self.pages[index].used_blocks += 1;
    }

    /// A used block with its header at `offset` became free.
    #[inline]
    pub(crate) fn block_released(&mut self, offset: usize) {
        let index = self.page_index(offset);
        let page = &mut self.pages[index];
        assert!(page.used_blocks > 0, "page {index} has no used blocks to release");
        page.used_blocks -= 1;
    }

    /// A block header was written at `offset`.
    #[inline]
    pub(crate) fn header_created(&mut self, offset: usize) {
        let index = self.page_index(offset);
        let page = &mut self.pages[index];
        if page.first_header.is_none_or(|first| offset < first) {
            page.first_header = Some(offset);
        }
    }

    /// The block header at `offset` was merged away. `next_header` is the header
    /// that now follows it in the arena, if any.
    #[inline]
    pub(crate) fn header_destroyed(&mut self, offset: usize, next_header: Option<usize>) {
        let index = self.page_index(offset);
        let page = &mut self.pages[index];
        if page.first_header == Some(offset) {
            page.first_header = next_header.filter(|next| *next < page.end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_lookups() {
        let pages = PageTable::new(4, 16);
        assert_eq!(4, pages.num_pages());

        assert_eq!(&pages.pages()[0], pages.page_for(0));
        assert_eq!(&pages.pages()[1], pages.page_for(4));
        assert_eq!(&pages.pages()[1], pages.page_for(7));
        assert_eq!(&pages.pages()[3], pages.page_for(15));

        assert_eq!((0, 4), pages.page_bounds(0));
        assert_eq!((4, 8), pages.page_bounds(4));
        assert_eq!((12, 16), pages.page_bounds(14));
        assert_eq!((12, 16), pages.page_bounds(15));
    }

    #[test]
    #[should_panic(expected = "outside the arena")]
    fn lookup_past_the_end_panics() {
        PageTable::new(4, 16).page_for(16);
    }

    #[test]
    fn no_victim_without_used_blocks() {
        let mut pages = PageTable::new(4096, 4 * 4096);
        pages.touch(0);
        assert_eq!(None, pages.select_victim_page());
    }

    #[test]
    fn referenced_pages_get_a_second_chance() {
        let mut pages = PageTable::new(4096, 4 * 4096);
        for page in 0..4 {
            pages.block_used(page * 4096);
        }
        pages.touch(0);
        pages.touch(4096);

        assert_eq!(Some(2), pages.select_victim_page());
        assert_eq!(Some(3), pages.select_victim_page());
        // Page 0 and 1 lost their bit on the first sweep.
        assert_eq!(Some(0), pages.select_victim_page());
        assert!(!pages.page_for(4096).is_referenced());
    }

    #[test]
    fn all_referenced_pages_still_yield_a_victim() {
        let mut pages = PageTable::new(4096, 2 * 4096);
        pages.block_used(4096 + 100);
        pages.touch(4096);
        pages.touch(0);

        assert_eq!(Some(1), pages.select_victim_page());
    }

    #[test]
    fn first_header_follows_splits_and_merges() {
        let mut pages = PageTable::new(4096, 2 * 4096);
        pages.header_created(0);
        pages.header_created(512);
        assert_eq!(Some(0), pages.page_for(0).first_header());

        pages.header_created(5000);
        assert_eq!(Some(5000), pages.page_for(4096).first_header());

        // Block at 5000 merged into its left neighbor, the next header sits at 6000.
        pages.header_destroyed(5000, Some(6000));
        assert_eq!(Some(6000), pages.page_for(4096).first_header());

        // Next header beyond the page leaves it without headers.
        pages.header_destroyed(6000, Some(9000));
        assert_eq!(None, pages.page_for(4096).first_header());

        // Destroying a header that is not the first one changes nothing.
        pages.header_destroyed(512, Some(700));
        assert_eq!(Some(0), pages.page_for(0).first_header());
    }

    #[test]
    fn used_counts_go_up_and_down() {
        let mut pages = PageTable::new(4096, 4096);
        pages.block_used(10);
        pages.block_used(20);
        pages.block_released(10);
        assert_eq!(1, pages.page_for(0).used_blocks());
    }
}
