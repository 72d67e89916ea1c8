//! Allocation engine: free-list reuse, splitting, and arena growth.

use std::ptr::NonNull;

use crate::block::{BlockRef, FreeLinks, HEADER_SIZE, SizeField, block_size, checked_block_size};
use crate::error::{HeapError, Result};
use crate::heap::Core;

impl Core {
  pub(crate) fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>> {
    if size == 0 {
      return Err(HeapError::InvalidSize);
    }

    let footprint = checked_block_size(size).ok_or(HeapError::OutOfMemory { requested: size })?;
    let need = footprint - HEADER_SIZE;

    // Nothing can be free before the first block exists.
    let reused = match self.first {
      Some(_) => self.free_lists.find_at_least(&self.arena, need),
      None => None,
    };

    let block = match reused {
      Some(block) => {
        self.free_lists.remove(&mut self.arena, block);

        let remainder = block.size(&self.arena) - need;
        if remainder > block_size(0) {
          self.split(block, need);
        }

        block
      }
      None => self.request_space(footprint).map_err(|err| {
        log::warn!("allocate({}) failed: {}", size, err);

        HeapError::OutOfMemory { requested: size }
      })?,
    };

    block.set_free(&mut self.arena, false);
    block.set_links(&mut self.arena, FreeLinks::default());

    log::trace!(
      "allocate({}) -> block {} of size {}{}",
      size,
      block,
      block.size(&self.arena),
      if reused.is_some() { " (reused)" } else { "" }
    );

    Ok(self.arena.ptr_at(block.data()))
  }

  /// Carves a fresh block of `footprint` bytes off the end of the arena and
  /// links it as the new last block.
  fn request_space(
    &mut self,
    footprint: usize,
  ) -> Result<BlockRef> {
    let block = BlockRef::new(self.arena.grow(footprint)?);

    block.init(&mut self.arena, self.last, SizeField::new(footprint - HEADER_SIZE, false));

    if self.first.is_none() {
      self.first = Some(block);
    }
    self.last = Some(block);

    Ok(block)
  }

  /// Shrinks `block` to `keep` data bytes and returns the tail to the free
  /// lists as a block of its own. Tails too small to hold a minimal free
  /// block are left attached.
  pub(crate) fn split(
    &mut self,
    block: BlockRef,
    keep: usize,
  ) -> BlockRef {
    let old_size = block.size(&self.arena);
    debug_assert!(keep <= old_size);

    if old_size - keep < block_size(0) {
      return block;
    }

    let next = if Some(block) == self.last {
      None
    } else {
      Some(block.next_adjacent(&self.arena))
    };

    block.set_size(&mut self.arena, keep);

    let tail = block.next_adjacent(&self.arena);
    let tail_size = old_size - keep - HEADER_SIZE;
    tail.init(&mut self.arena, Some(block), SizeField::new(tail_size, true));

    match next {
      Some(next) => next.set_prev(&mut self.arena, Some(tail)),
      None => self.last = Some(tail),
    }

    self.free_lists.insert(&mut self.arena, tail);

    log::trace!("split {} into {} + {} ({} bytes)", block, keep, tail, tail_size);

    block
  }
}
