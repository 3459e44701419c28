use crate::{
    arena::Arena,
    block::{BlockRef, FreeLinks, link, unlink},
};

/// Intrusive doubly linked list of free blocks.
///
/// It is very important for us that, because we are the actual memory
/// allocator, this list can not make allocations itself. Therefor the nodes
/// are the blocks themselves: the `prev`/`next` links are written into the
/// payload of each member (see [`FreeLinks`]) and the list only remembers
/// where its head is.
///
/// Links are arena offsets, so every operation needs the [`Arena`] that
/// holds the members.
#[derive(Debug, Default)]
pub(crate) struct List {
    head: Option<BlockRef>,
    len: usize,
}

pub(crate) struct Iter<'a> {
    arena: &'a Arena,
    current: Option<BlockRef>,
    remaining: usize,
}

impl List {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub fn first(&self) -> Option<BlockRef> {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `block` at the head of the list. O(1).
    pub fn push_front(&mut self, arena: &mut Arena, block: BlockRef) {
        arena.set_links(
            block,
            FreeLinks {
                prev: unlink(None),
                next: unlink(self.head),
            },
        );

        if let Some(head) = self.head {
            let mut links = arena.links(head);
            links.prev = block.offset();
            arena.set_links(head, links);
        }

        self.head = Some(block);
        self.len += 1;
    }

    /// Unlinks `block`, which must be a member of this list. O(1).
    pub fn remove(&mut self, arena: &mut Arena, block: BlockRef) {
        debug_assert!(self.len > 0, "removing {block:?} from an empty list");
        let links = arena.links(block);

        match link(links.prev) {
            Some(prev) => {
                let mut prev_links = arena.links(prev);
                prev_links.next = links.next;
                arena.set_links(prev, prev_links);
            }
            None => {
                debug_assert_eq!(self.head, Some(block), "{block:?} is not in this list");
                self.head = link(links.next);
            }
        }

        if let Some(next) = link(links.next) {
            let mut next_links = arena.links(next);
            next_links.prev = links.prev;
            arena.set_links(next, next_links);
        }

        arena.set_links(block, FreeLinks::UNLINKED);
        self.len -= 1;
    }

    pub fn iter<'a>(&self, arena: &'a Arena) -> Iter<'a> {
        Iter {
            arena,
            current: self.head,
            remaining: self.len,
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = BlockRef;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let block = self.current?;
        self.current = link(self.arena.links(block).next);
        self.remaining -= 1;

        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BLOCK_HEADER_SIZE, Header};

    fn arena_with_blocks(count: usize) -> (Arena, Vec<BlockRef>) {
        let mut arena = Arena::reserve(4096).unwrap();
        let blocks = (0..count)
            .map(|i| {
                let block = BlockRef(i * (BLOCK_HEADER_SIZE + 32));
                arena.write_header(
                    block,
                    Header {
                        size: 32,
                        left_size: 32,
                        is_free: true,
                        touched: false,
                    },
                );
                block
            })
            .collect();
        (arena, blocks)
    }

    #[test]
    fn new_list_is_empty() {
        let (arena, _) = arena_with_blocks(0);
        let list = List::new();

        assert_eq!(list.len, 0);
        assert!(list.is_empty());
        assert!(list.iter(&arena).next().is_none());
    }

    #[test]
    fn push_front_is_lifo() {
        let (mut arena, blocks) = arena_with_blocks(3);
        let mut list = List::new();
        for block in &blocks {
            list.push_front(&mut arena, *block);
        }

        let order: Vec<_> = list.iter(&arena).collect();
        assert_eq!(vec![blocks[2], blocks[1], blocks[0]], order);
        assert_eq!(Some(blocks[2]), list.first());
        assert_eq!(3, list.len);
    }

    #[test]
    fn remove_from_head_middle_and_tail() {
        let (mut arena, blocks) = arena_with_blocks(4);
        let mut list = List::new();
        for block in &blocks {
            list.push_front(&mut arena, *block);
        }

        // List order is 3, 2, 1, 0.
        list.remove(&mut arena, blocks[2]);
        assert_eq!(vec![blocks[3], blocks[1], blocks[0]], list.iter(&arena).collect::<Vec<_>>());
        list.remove(&mut arena, blocks[3]);
        assert_eq!(vec![blocks[1], blocks[0]], list.iter(&arena).collect::<Vec<_>>());
        list.remove(&mut arena, blocks[0]);
        assert_eq!(vec![blocks[1]], list.iter(&arena).collect::<Vec<_>>());
        list.remove(&mut arena, blocks[1]);
        assert!(list.is_empty());
        assert_eq!(None, list.first());
    }
}
