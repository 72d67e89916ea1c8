//! In-band block layout.
//!
//! ```text
//!   allocated block                      free block
//!   ┌──────────────────────┐             ┌──────────────────────┐
//!   │ back-link     (u64)  │             │ back-link     (u64)  │
//!   │ free|size     (u64)  │             │ free|size     (u64)  │
//!   ├──────────────────────┤ ◄── data    ├──────────────────────┤
//!   │                      │             │ next free     (u64)  │
//!   │   size bytes usable  │             │ prev free     (u64)  │
//!   │                      │             │ ...                  │
//!   └──────────────────────┘             └──────────────────────┘
//! ```
//!
//! `size` counts only the data region, so the block following `b` in
//! address order starts at `b + HEADER_SIZE + size`.

use std::fmt;
use std::mem;

use crate::align;
use crate::arena::{Arena, page_size};
use crate::error::{HeapError, Result};

pub const ALIGNMENT: usize = 8;
pub const WORD_SIZE: usize = mem::size_of::<u64>();

/// Back-link plus the size/free word.
pub const HEADER_SIZE: usize = align!(2 * WORD_SIZE);
/// Room for the two free-list links overlaid on a free block's data.
pub const MIN_DATA_SIZE: usize = align!(2 * WORD_SIZE);

/// Encoding of "no block" in every in-band link.
const EMPTY_PTR: u64 = u64::MAX;

const BACK_LINK_OFFSET: usize = 0;
const SIZE_FIELD_OFFSET: usize = WORD_SIZE;
const NEXT_FREE_OFFSET: usize = HEADER_SIZE;
const PREV_FREE_OFFSET: usize = HEADER_SIZE + WORD_SIZE;

/// Total footprint (header included) of a block able to hold `payload`
/// bytes.
pub const fn block_size(payload: usize) -> usize {
  let data = if payload > MIN_DATA_SIZE {
    payload
  } else {
    MIN_DATA_SIZE
  };

  align!(data + HEADER_SIZE)
}

/// Like [`block_size`], but `None` when the footprint overflows.
pub fn checked_block_size(payload: usize) -> Option<usize> {
  payload.checked_add(HEADER_SIZE + ALIGNMENT)?;

  Some(block_size(payload))
}

/// The size/free word: bit 63 is the free flag, the rest is the data size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeField(u64);

impl SizeField {
  pub const FREE_MASK: u64 = 1 << (u64::BITS - 1);

  pub const fn new(
    size: usize,
    free: bool,
  ) -> Self {
    Self::from_raw(0).with_size(size).with_free(free)
  }

  pub const fn from_raw(raw: u64) -> Self {
    Self(raw)
  }

  pub const fn raw(self) -> u64 {
    self.0
  }

  pub const fn size(self) -> usize {
    (self.0 & !Self::FREE_MASK) as usize
  }

  pub const fn is_free(self) -> bool {
    self.0 & Self::FREE_MASK != 0
  }

  pub const fn with_size(
    self,
    size: usize,
  ) -> Self {
    Self((self.0 & Self::FREE_MASK) | (size as u64 & !Self::FREE_MASK))
  }

  pub const fn with_free(
    self,
    free: bool,
  ) -> Self {
    if free {
      Self(self.0 | Self::FREE_MASK)
    } else {
      Self(self.0 & !Self::FREE_MASK)
    }
  }
}

/// A block, addressed by the offset of its header inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef(usize);

impl BlockRef {
  pub const fn new(offset: usize) -> Self {
    Self(offset)
  }

  pub const fn offset(self) -> usize {
    self.0
  }

  /// Offset of the data region.
  pub const fn data(self) -> usize {
    self.0 + HEADER_SIZE
  }

  /// The block owning the data region at `data`.
  pub fn from_data(data: usize) -> Option<Self> {
    data.checked_sub(HEADER_SIZE).map(Self)
  }

  pub(crate) fn display(block: Option<BlockRef>) -> String {
    match block {
      Some(block) => block.to_string(),
      None => String::from("NONE"),
    }
  }

  pub fn size_field(
    self,
    arena: &Arena,
  ) -> SizeField {
    SizeField::from_raw(arena.read_word(self.0 + SIZE_FIELD_OFFSET))
  }

  pub fn set_size_field(
    self,
    arena: &mut Arena,
    field: SizeField,
  ) {
    arena.write_word(self.0 + SIZE_FIELD_OFFSET, field.raw());
  }

  pub fn size(
    self,
    arena: &Arena,
  ) -> usize {
    self.size_field(arena).size()
  }

  pub fn is_free(
    self,
    arena: &Arena,
  ) -> bool {
    self.size_field(arena).is_free()
  }

  pub fn set_size(
    self,
    arena: &mut Arena,
    size: usize,
  ) {
    let field = self.size_field(arena).with_size(size);
    self.set_size_field(arena, field);
  }

  pub fn set_free(
    self,
    arena: &mut Arena,
    free: bool,
  ) {
    let field = self.size_field(arena).with_free(free);
    self.set_size_field(arena, field);
  }

  /// The block immediately before this one in address order, as recorded
  /// in the back-link.
  pub fn prev(
    self,
    arena: &Arena,
  ) -> Option<BlockRef> {
    decode_link(arena.read_word(self.0 + BACK_LINK_OFFSET))
  }

  pub fn set_prev(
    self,
    arena: &mut Arena,
    prev: Option<BlockRef>,
  ) {
    arena.write_word(self.0 + BACK_LINK_OFFSET, encode_link(prev));
  }

  /// Where the block after this one in address order starts. Only
  /// meaningful when this is not the last block.
  pub fn next_adjacent(
    self,
    arena: &Arena,
  ) -> BlockRef {
    BlockRef(self.data() + self.size(arena))
  }

  /// Writes a complete header.
  pub fn init(
    self,
    arena: &mut Arena,
    prev: Option<BlockRef>,
    field: SizeField,
  ) {
    self.set_prev(arena, prev);
    self.set_size_field(arena, field);
  }

  pub fn links(
    self,
    arena: &Arena,
  ) -> FreeLinks {
    FreeLinks {
      next: decode_link(arena.read_word(self.0 + NEXT_FREE_OFFSET)),
      prev: decode_link(arena.read_word(self.0 + PREV_FREE_OFFSET)),
    }
  }

  pub fn set_links(
    self,
    arena: &mut Arena,
    links: FreeLinks,
  ) {
    arena.write_word(self.0 + NEXT_FREE_OFFSET, encode_link(links.next));
    arena.write_word(self.0 + PREV_FREE_OFFSET, encode_link(links.prev));
  }

  pub fn set_next_free(
    self,
    arena: &mut Arena,
    next: Option<BlockRef>,
  ) {
    arena.write_word(self.0 + NEXT_FREE_OFFSET, encode_link(next));
  }

  pub fn set_prev_free(
    self,
    arena: &mut Arena,
    prev: Option<BlockRef>,
  ) {
    arena.write_word(self.0 + PREV_FREE_OFFSET, encode_link(prev));
  }
}

impl fmt::Display for BlockRef {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "{:#x}", self.0)
  }
}

/// The free-list node overlaid on the data region of a free block. The
/// words hold user data while the block is allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeLinks {
  pub next: Option<BlockRef>,
  pub prev: Option<BlockRef>,
}

fn encode_link(block: Option<BlockRef>) -> u64 {
  match block {
    Some(block) => block.0 as u64,
    None => EMPTY_PTR,
  }
}

fn decode_link(word: u64) -> Option<BlockRef> {
  if word == EMPTY_PTR {
    None
  } else {
    Some(BlockRef(word as usize))
  }
}

fn ensure(
  condition: bool,
  what: &'static str,
) -> Result<()> {
  if condition {
    Ok(())
  } else {
    Err(HeapError::Encoding(what))
  }
}

/// Probes the size/free masking rules and every in-band field accessor
/// against known patterns. Must pass before the allocator is trusted.
pub fn verify_encoding() -> Result<()> {
  ensure(HEADER_SIZE == 2 * ALIGNMENT, "header is not two words")?;
  ensure(MIN_DATA_SIZE >= 2 * WORD_SIZE, "data region cannot hold free links")?;

  let probe = BlockRef::new(0);
  ensure(
    BlockRef::from_data(probe.data()) == Some(probe),
    "header and data translation are not inverses",
  )?;
  ensure(
    probe.data() == probe.offset() + HEADER_SIZE,
    "data region is not right after the header",
  )?;

  // Reads.
  let field = SizeField::from_raw(SizeField::FREE_MASK);
  ensure(field.is_free(), "flag-only word does not read as free")?;
  ensure(field.size() == 0, "flag-only word has a size")?;

  let field = SizeField::from_raw(!0);
  ensure(field.is_free(), "all-ones word does not read as free")?;

  let field = SizeField::from_raw(field.raw() >> 1);
  ensure(!field.is_free(), "shifted word reads as free")?;
  ensure(
    field.size() as u64 == !SizeField::FREE_MASK,
    "shifted word loses magnitude bits",
  )?;

  // Writes.
  let field = field.with_free(true);
  ensure(field.is_free(), "setting the flag failed")?;
  let field = field.with_free(false);
  ensure(!field.is_free(), "clearing the flag failed")?;

  let field = field.with_size(5244);
  ensure(field.size() == 5244, "size write failed")?;

  // Neither half may disturb the other.
  let field = field.with_free(false).with_size(12);
  ensure(!field.is_free(), "size write set the flag")?;
  let field = field.with_free(true);
  ensure(field.size() == 12, "flag write changed the size")?;
  let field = field.with_size(8_900_444);
  ensure(field.is_free(), "size write cleared the flag")?;
  let field = field.with_free(false);
  ensure(field.size() == 8_900_444, "flag clear changed the size")?;

  // Round trip through real arena memory.
  let mut arena = Arena::reserve(page_size())?;
  let first = BlockRef::new(arena.grow(block_size(8))?);
  let second = BlockRef::new(arena.grow(block_size(8))?);

  second.init(&mut arena, Some(first), SizeField::new(align!(8usize), true));
  second.set_links(
    &mut arena,
    FreeLinks {
      next: Some(BlockRef::new(0xf00d)),
      prev: Some(BlockRef::new(0xba51c)),
    },
  );
  first.init(&mut arena, None, SizeField::new(block_size(8) - HEADER_SIZE, false));

  ensure(second.prev(&arena) == Some(first), "back-link round trip failed")?;
  ensure(first.prev(&arena).is_none(), "empty back-link round trip failed")?;
  ensure(second.is_free(&arena), "free flag round trip failed")?;
  ensure(!first.is_free(&arena), "allocated flag round trip failed")?;
  ensure(second.size(&arena) == align!(8usize), "size round trip failed")?;
  ensure(
    first.next_adjacent(&arena) == second,
    "next block is not header plus size away",
  )?;

  let links = second.links(&arena);
  ensure(links.next == Some(BlockRef::new(0xf00d)), "next-free round trip failed")?;
  ensure(links.prev == Some(BlockRef::new(0xba51c)), "prev-free round trip failed")?;

  log::debug!("block encoding checked successfully");

  Ok(())
}
