//! Deallocation engine: marking blocks free and merging them with free
//! neighbors before they go back into the free lists.
//!
//! ```text
//!   before free(B):   ┌──────┬──────┬──────┐
//!                     │ A    │ B    │ C    │   A, C free
//!                     │ free │ used │ free │
//!                     └──────┴──────┴──────┘
//!   after:            ┌────────────────────┐
//!                     │ A + B + C   free   │   one block, one list entry
//!                     └────────────────────┘
//! ```

use crate::block::{BlockRef, HEADER_SIZE};
use crate::error::Result;
use crate::heap::Core;

impl Core {
  pub(crate) fn free(
    &mut self,
    ptr: *mut u8,
  ) -> Result<()> {
    let block = self
      .owning_block(ptr)
      .inspect_err(|err| log::warn!("rejected free: {}", err))?;

    block.set_free(&mut self.arena, true);

    let prev = if Some(block) == self.first {
      None
    } else {
      block.prev(&self.arena)
    };

    let next = if Some(block) == self.last {
      None
    } else {
      Some(block.next_adjacent(&self.arena))
    };

    let mut block = block;

    if let Some(prev) = prev.filter(|prev| prev.is_free(&self.arena)) {
      block = self.coalesce_left(prev, block, next);
    }

    if let Some(next) = next.filter(|next| next.is_free(&self.arena)) {
      self.coalesce_right(block, next);
    }

    self.free_lists.insert(&mut self.arena, block);

    log::trace!("free({:p}) -> block {} of size {}", ptr, block, block.size(&self.arena));

    Ok(())
  }

  /// Folds `block` into its free predecessor and returns the merged block.
  fn coalesce_left(
    &mut self,
    prev: BlockRef,
    block: BlockRef,
    next: Option<BlockRef>,
  ) -> BlockRef {
    debug_assert_eq!(prev.next_adjacent(&self.arena), block);

    self.free_lists.remove(&mut self.arena, prev);

    let merged = prev.size(&self.arena) + HEADER_SIZE + block.size(&self.arena);
    prev.set_size(&mut self.arena, merged);

    match next {
      Some(next) => next.set_prev(&mut self.arena, Some(prev)),
      None => self.last = Some(prev),
    }

    log::debug!("coalesced {} into {}, now {} bytes", block, prev, merged);

    prev
  }

  /// Folds the free successor `next` into `block`.
  fn coalesce_right(
    &mut self,
    block: BlockRef,
    next: BlockRef,
  ) {
    debug_assert_eq!(next.prev(&self.arena), Some(block));

    self.free_lists.remove(&mut self.arena, next);

    let after = if Some(next) == self.last {
      None
    } else {
      Some(next.next_adjacent(&self.arena))
    };

    let merged = block.size(&self.arena) + HEADER_SIZE + next.size(&self.arena);
    block.set_size(&mut self.arena, merged);

    match after {
      Some(after) => after.set_prev(&mut self.arena, Some(block)),
      None => self.last = Some(block),
    }

    log::debug!("coalesced {} into {}, now {} bytes", next, block, merged);
  }
}
