use std::fmt;

use thiserror::Error;

use crate::block::BlockRef;

/// Errors reported by the allocator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
  #[error("heap used before initialize")]
  Uninitialized,

  #[error("unable to reserve {requested} bytes from the operating system")]
  ArenaUnavailable { requested: usize },

  #[error("arena exhausted (needed {requested} more bytes, {available} left)")]
  ArenaExhausted { requested: usize, available: usize },

  #[error("out of memory (requested: {requested} bytes)")]
  OutOfMemory { requested: usize },

  #[error("invalid size (must be > 0)")]
  InvalidSize,

  #[error("invalid free of {addr:#x}: {reason}")]
  InvalidFree { addr: usize, reason: InvalidPointer },

  #[error("block encoding self-test failed: {0}")]
  Encoding(&'static str),

  #[error("heap corrupted ({} violations)", .0.len())]
  Corrupted(Vec<Violation>),
}

pub type Result<T> = core::result::Result<T, HeapError>;

/// Why a pointer handed to `free` was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidPointer {
  Null,
  Misaligned,
  /// Not a data pointer inside the carved part of the arena.
  OutOfArena,
  /// The owning block is already free.
  NotAllocated,
}

impl fmt::Display for InvalidPointer {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    let reason = match self {
      InvalidPointer::Null => "null pointer",
      InvalidPointer::Misaligned => "pointer is not 8-byte aligned",
      InvalidPointer::OutOfArena => "pointer does not belong to the arena",
      InvalidPointer::NotAllocated => "block is not allocated",
    };

    f.write_str(reason)
  }
}

/// A single structural inconsistency found by the invariant checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
  /// The block header or its data region extends past the high-water mark.
  BlockOutOfBounds { block: BlockRef, size: usize },
  UndersizedBlock { block: BlockRef, size: usize },
  MisalignedSize { block: BlockRef, size: usize },
  BrokenBackLink {
    block: BlockRef,
    expected: Option<BlockRef>,
    found: Option<BlockRef>,
  },
  AdjacentFree { block: BlockRef, prev: BlockRef },
  NotInFreeList { block: BlockRef, class: usize },
  AllocatedInFreeList { block: BlockRef, class: usize },
  WrongFreeList {
    block: BlockRef,
    class: usize,
    expected: usize,
  },
  DuplicateFreeEntry { block: BlockRef, class: usize },
  /// A free-list entry that is not a block of the address-order chain.
  UnknownFreeEntry { block: BlockRef, class: usize },
  BrokenFreeLink {
    block: BlockRef,
    class: usize,
    expected: Option<BlockRef>,
    found: Option<BlockRef>,
  },
  FirstBlockMismatch {
    tracked: Option<BlockRef>,
    expected: Option<BlockRef>,
  },
  LastBlockMismatch {
    tracked: Option<BlockRef>,
    walked: Option<BlockRef>,
  },
  ChainEndMismatch { chain_end: usize, high_water: usize },
}

impl fmt::Display for Violation {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Violation::BlockOutOfBounds { block, size } => {
        write!(f, "block {} of size {:#x} runs past the high-water mark", block, size)
      }
      Violation::UndersizedBlock { block, size } => {
        write!(f, "size error: {} has size {} which is below the minimum", block, size)
      }
      Violation::MisalignedSize { block, size } => {
        write!(f, "size error: {} has unaligned size {}", block, size)
      }
      Violation::BrokenBackLink {
        block,
        expected,
        found,
      } => write!(
        f,
        "continuity error: {} should point back to {} but points to {}",
        block,
        BlockRef::display(*expected),
        BlockRef::display(*found)
      ),
      Violation::AdjacentFree { block, prev } => {
        write!(f, "free error: {} is not merged with its free predecessor {}", block, prev)
      }
      Violation::NotInFreeList { block, class } => {
        write!(f, "free list error: {} is not in free list {}", block, class)
      }
      Violation::AllocatedInFreeList { block, class } => {
        write!(f, "free list error: allocated block {} found in free list {}", block, class)
      }
      Violation::WrongFreeList {
        block,
        class,
        expected,
      } => write!(
        f,
        "free list error: {} found in free list {} instead of {}",
        block, class, expected
      ),
      Violation::DuplicateFreeEntry { block, class } => {
        write!(f, "free list error: {} seen twice (again in list {})", block, class)
      }
      Violation::UnknownFreeEntry { block, class } => {
        write!(f, "free list error: {} in free list {} is not a block of the heap", block, class)
      }
      Violation::BrokenFreeLink {
        block,
        class,
        expected,
        found,
      } => write!(
        f,
        "continuity error in free list {}: {} should point back to {} but points to {}",
        class,
        block,
        BlockRef::display(*expected),
        BlockRef::display(*found)
      ),
      Violation::FirstBlockMismatch { tracked, expected } => write!(
        f,
        "first block is tracked as {} but the arena starts with {}",
        BlockRef::display(*tracked),
        BlockRef::display(*expected)
      ),
      Violation::LastBlockMismatch { tracked, walked } => write!(
        f,
        "last block is tracked as {} but the chain ends at {}",
        BlockRef::display(*tracked),
        BlockRef::display(*walked)
      ),
      Violation::ChainEndMismatch {
        chain_end,
        high_water,
      } => write!(
        f,
        "block chain ends at {:#x} but the high-water mark is {:#x}",
        chain_end, high_water
      ),
    }
  }
}
