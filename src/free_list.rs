use crate::arena::Arena;
use crate::block::{BlockRef, FreeLinks};

pub const FREE_LIST_COUNT: usize = 20;

/// Size class of a free block's data size: list `i` holds sizes in
/// `2^i..2^(i+1)`, the last list takes everything from `2^(COUNT-1)` up.
pub fn classify(size: usize) -> usize {
  if size == 0 {
    return 0;
  }

  (size.ilog2() as usize).min(FREE_LIST_COUNT - 1)
}

/// Heads of the segregated, doubly linked free lists. The links themselves
/// live in the data regions of the free blocks.
#[derive(Debug, Clone, Default)]
pub struct FreeLists {
  heads: [Option<BlockRef>; FREE_LIST_COUNT],
}

impl FreeLists {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn head(
    &self,
    class: usize,
  ) -> Option<BlockRef> {
    self.heads[class]
  }

  pub fn is_empty(&self) -> bool {
    self.heads.iter().all(Option::is_none)
  }

  /// Pushes a free block onto the head of its class.
  pub fn insert(
    &mut self,
    arena: &mut Arena,
    block: BlockRef,
  ) {
    debug_assert!(block.is_free(arena));

    let class = classify(block.size(arena));
    let head = self.heads[class];

    block.set_links(
      arena,
      FreeLinks {
        next: head,
        prev: None,
      },
    );

    if let Some(head) = head {
      head.set_prev_free(arena, Some(block));
    }

    self.heads[class] = Some(block);
  }

  /// Splices a block out of its class and clears its links. The block's
  /// size must still be the one it was inserted with.
  pub fn remove(
    &mut self,
    arena: &mut Arena,
    block: BlockRef,
  ) {
    let FreeLinks { next, prev } = block.links(arena);

    match prev {
      Some(prev) => prev.set_next_free(arena, next),
      None => {
        let class = classify(block.size(arena));
        debug_assert_eq!(self.heads[class], Some(block), "{} is not the head of list {}", block, class);

        self.heads[class] = next;
      }
    }

    if let Some(next) = next {
      next.set_prev_free(arena, prev);
    }

    block.set_links(arena, FreeLinks::default());
  }

  /// First block of at least `size` data bytes in the class of `size`,
  /// otherwise the head of the first non-empty class above it.
  ///
  /// Heads of higher classes are returned unchecked: every block in class
  /// `c + 1` or above holds at least `2^(c+1)` bytes, and `size < 2^(c+1)`.
  pub fn find_at_least(
    &self,
    arena: &Arena,
    size: usize,
  ) -> Option<BlockRef> {
    let class = classify(size);

    let mut current = self.heads[class];
    while let Some(block) = current {
      if block.size(arena) >= size {
        return Some(block);
      }
      current = block.links(arena).next;
    }

    let found = self.heads[class + 1..].iter().find_map(|head| *head);

    if let Some(block) = found {
      debug_assert!(
        block.size(arena) >= size,
        "{} in a higher class is smaller than {}",
        block,
        size
      );
    }

    found
  }
}
