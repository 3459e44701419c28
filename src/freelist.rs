use crate::{arena::Arena, block::BlockRef, list::List, utils::floor_log2};

/// log2 of the smallest size class boundary. Sizes below `2^FIRST_POWER_OF_2`
/// share the linear row 0.
pub const FIRST_POWER_OF_2: u32 = 8;

/// log2 of the number of sub cells every power of two range is divided into.
pub const SUB_CELLS_LOG2: u32 = 5;

/// Number of sub cells in every row.
pub const SUB_CELLS: usize = 1 << SUB_CELLS_LOG2;

/// Width of one sub cell in the linear row 0.
const LINEAR_CELL_WIDTH: usize = (1 << FIRST_POWER_OF_2) / SUB_CELLS;

/// Address of a cell in the [`SizeClassIndex`].
///
/// Ordering is `(pow_index, sub_index)`, which is also the order of the sizes
/// the cells hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub pow_index: usize,
    pub sub_index: usize,
}

impl Position {
    /// Maps `size` onto its cell. This is a pure function of `size` and it is
    /// used the same way for insertion and for lookup.
    ///
    /// ```text
    /// size < 2^B:   (0, size / (2^B / 32))
    /// otherwise:    (k - B + 1, (size - 2^k) * 32 / 2^k)    where k = floor(log2(size))
    /// ```
    pub const fn from_size(size: usize) -> Self {
        if size < (1 << FIRST_POWER_OF_2) {
            return Self {
                pow_index: 0,
                sub_index: size / LINEAR_CELL_WIDTH,
            };
        }

        let k = floor_log2(size);
        Self {
            pow_index: (k - FIRST_POWER_OF_2 + 1) as usize,
            // (size - 2^k) * 32 / 2^k without the multiplication overflowing
            sub_index: (size - (1 << k)) >> (k - SUB_CELLS_LOG2),
        }
    }

    /// Smallest size that maps onto this cell.
    #[cfg(test)]
    pub const fn lower_bound(self) -> usize {
        if self.pow_index == 0 {
            return self.sub_index * LINEAR_CELL_WIDTH;
        }
        let k = self.pow_index as u32 + FIRST_POWER_OF_2 - 1;
        (1 << k) + (self.sub_index << (k - SUB_CELLS_LOG2))
    }
}

/// Segregated free lists of free blocks, keyed by size class.
///
/// Every power of two range of sizes is a row, and every row is divided into
/// [`SUB_CELLS`] linear cells, each holding a LIFO [`List`] of free blocks:
///
/// ```text
///               sub 0      sub 1            sub 31
///             +---------+---------+-----+---------+
/// row 0       |  0..8   |  8..16  | ... | 248..256|   linear region
///             +---------+---------+-----+---------+
/// row 1       | 256..264| 264..272| ... | 504..512|   2^8
///             +---------+---------+-----+---------+
/// row 2       | 512..528| 528..544| ... |1008..1024|  2^9
///             +---------+---------+-----+---------+
/// ```
///
/// A two level bitmap (one bit per non empty row, one bit per non empty cell)
/// finds the first non empty cell at or after a position with a couple of
/// `trailing_zeros` instead of walking the cells.
pub struct SizeClassIndex {
    cells: Vec<List>,
    row_mask: u64,
    cell_masks: Vec<u32>,
    max_size: usize,
    len: usize,
}

impl SizeClassIndex {
    /// Creates an empty index able to hold blocks of up to `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        let rows = Position::from_size(max_size).pow_index + 1;
        debug_assert!(rows <= u64::BITS as usize);

        Self {
            cells: (0..rows * SUB_CELLS).map(|_| List::new()).collect(),
            row_mask: 0,
            cell_masks: vec![0; rows],
            max_size,
            len: 0,
        }
    }

    /// Largest block size the index accepts.
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of blocks currently held.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// [`Position::from_size`] bounded by the largest size this index holds.
    /// Panics when `size` is above [`Self::max_size`].
    pub fn position_from_size(&self, size: usize) -> Position {
        assert!(
            size <= self.max_size,
            "size {size} exceeds the maximum size class ({})",
            self.max_size
        );
        Position::from_size(size)
    }

    #[inline]
    fn cell_index(pos: Position) -> usize {
        pos.pow_index * SUB_CELLS + pos.sub_index
    }

    /// Inserts a free `block` at the head of its cell. O(1).
    pub fn put_block(&mut self, arena: &mut Arena, block: BlockRef) {
        let header = arena.header(block);
        assert!(header.is_free, "only free blocks can be indexed, {block:?} is used");

        let pos = self.position_from_size(header.size);
        self.cells[Self::cell_index(pos)].push_front(arena, block);
        self.cell_masks[pos.pow_index] |= 1 << pos.sub_index;
        self.row_mask |= 1 << pos.pow_index;
        self.len += 1;
    }

    /// Unlinks `block` from its cell. The block must be indexed under its current size.
    pub fn remove_block(&mut self, arena: &mut Arena, block: BlockRef) {
        let pos = self.position_from_size(arena.header(block).size);
        let cell = &mut self.cells[Self::cell_index(pos)];
        cell.remove(arena, block);

        if cell.is_empty() {
            self.cell_masks[pos.pow_index] &= !(1 << pos.sub_index);
            if self.cell_masks[pos.pow_index] == 0 {
                self.row_mask &= !(1 << pos.pow_index);
            }
        }
        self.len -= 1;
    }

    /// Removes and returns a free block of at least `min_size` bytes. O(1).
    ///
    /// Cells are floor based, so the cell `min_size` maps to may hold blocks
    /// slightly smaller than `min_size`. Only the head of that cell is checked,
    /// when it is too small the head of the next non empty higher cell is
    /// taken, and any strictly higher cell is large enough.
    pub fn try_get_block(&mut self, arena: &mut Arena, min_size: usize) -> Option<BlockRef> {
        let start = self.position_from_size(min_size);

        let block = match self.cells[Self::cell_index(start)]
            .first()
            .filter(|head| arena.header(*head).size >= min_size)
        {
            Some(head) => head,
            None => {
                let pos = self.next_non_empty_after(start)?;
                self.cells[Self::cell_index(pos)].first()?
            }
        };

        self.remove_block(arena, block);
        Some(block)
    }

    /// First non empty cell at or after `pos`.
    pub fn next_non_empty(&self, pos: Position) -> Option<Position> {
        if *self.cell_masks.get(pos.pow_index)? & (1 << pos.sub_index) != 0 {
            return Some(pos);
        }
        self.next_non_empty_after(pos)
    }

    /// First non empty cell strictly after `pos`.
    fn next_non_empty_after(&self, pos: Position) -> Option<Position> {
        let row = *self.cell_masks.get(pos.pow_index)?;
        let higher_cells = row & u32::MAX.checked_shl(pos.sub_index as u32 + 1).unwrap_or(0);
        if higher_cells != 0 {
            return Some(Position {
                pow_index: pos.pow_index,
                sub_index: higher_cells.trailing_zeros() as usize,
            });
        }

        let higher_rows = self.row_mask & u64::MAX.checked_shl(pos.pow_index as u32 + 1).unwrap_or(0);
        if higher_rows == 0 {
            return None;
        }
        let pow_index = higher_rows.trailing_zeros() as usize;
        Some(Position {
            pow_index,
            sub_index: self.cell_masks[pow_index].trailing_zeros() as usize,
        })
    }

    /// Every indexed block, lowest cell first.
    pub fn iter<'a>(&'a self, arena: &'a Arena) -> impl Iterator<Item = BlockRef> + 'a {
        self.cells.iter().flat_map(move |cell| cell.iter(arena))
    }
}
