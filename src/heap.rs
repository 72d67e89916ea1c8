use std::fmt;
use std::io;
use std::ptr::NonNull;

use crate::arena::Arena;
use crate::block::{ALIGNMENT, BlockRef, HEADER_SIZE, MIN_DATA_SIZE, block_size, verify_encoding};
use crate::check::HeapStats;
use crate::config::HeapConfig;
use crate::error::{HeapError, InvalidPointer, Result};
use crate::free_list::{FREE_LIST_COUNT, FreeLists};

/// Everything an initialized heap owns: the arena, the chain anchors and
/// the free-list heads.
pub(crate) struct Core {
  pub(crate) arena: Arena,
  pub(crate) first: Option<BlockRef>,
  pub(crate) last: Option<BlockRef>,
  pub(crate) free_lists: FreeLists,
}

impl Core {
  pub(crate) fn new(arena: Arena) -> Self {
    Self {
      arena,
      first: None,
      last: None,
      free_lists: FreeLists::new(),
    }
  }

  /// Upper bound on how many blocks the carved arena can hold.
  pub(crate) fn max_blocks(&self) -> usize {
    self.arena.end() / block_size(0)
  }
}

/// A segregated free-list allocator over one fixed, pre-reserved arena.
///
/// Single-threaded: a `Heap` is neither `Send` nor `Sync`.
pub struct Heap {
  config: HeapConfig,
  core: Option<Core>,
}

impl Heap {
  /// An uninitialized heap; call [`Heap::initialize`] before allocating.
  pub fn new() -> Self {
    Self::with_config(HeapConfig::default())
  }

  pub fn with_config(config: HeapConfig) -> Self {
    Self { config, core: None }
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn is_initialized(&self) -> bool {
    self.core.is_some()
  }

  /// Reserved capacity in bytes, once initialized.
  pub fn capacity(&self) -> Option<usize> {
    self.core.as_ref().map(|core| core.arena.capacity())
  }

  /// Reserves `capacity` bytes (rounded up to whole pages) and resets all
  /// allocator state. A previous arena, if any, is released.
  pub fn initialize(
    &mut self,
    capacity: usize,
  ) -> Result<()> {
    self.core = None;

    if self.config.check_encoding {
      verify_encoding()?;
    }

    let arena = Arena::reserve(capacity)
      .inspect_err(|err| log::warn!("initialize({}) failed: {}", capacity, err))?;

    log::debug!("heap initialized with {} bytes", arena.capacity());

    self.core = Some(Core::new(arena));
    self.self_check();

    Ok(())
  }

  /// Allocates at least `size` bytes aligned to 8.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>> {
    let ptr = self.core_mut()?.allocate(size)?;
    self.self_check();

    Ok(ptr)
  }

  /// Returns the block owning `ptr` to the free pool, merging it with free
  /// neighbors. Rejected pointers leave the heap untouched.
  pub fn free(
    &mut self,
    ptr: *mut u8,
  ) -> Result<()> {
    self.core_mut()?.free(ptr)?;
    self.self_check();

    Ok(())
  }

  /// Data-region size of the allocated block owning `ptr`.
  pub fn usable_size(
    &self,
    ptr: *const u8,
  ) -> Result<usize> {
    let core = self.core()?;
    let block = core.owning_block(ptr)?;

    Ok(block.size(&core.arena))
  }

  /// Walks the block chain and every free list, reporting all violations.
  pub fn verify(&self) -> Result<()> {
    self.core()?.verify()
  }

  pub fn stats(&self) -> Result<HeapStats> {
    Ok(self.core()?.stats())
  }

  /// Prints the heap layout and the verification outcome to stdout.
  pub fn dump(&self) {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if let Err(err) = self.write_dump(&mut out) {
      log::warn!("heap dump failed: {}", err);
    }
  }

  pub fn write_dump<W: io::Write>(
    &self,
    out: &mut W,
  ) -> io::Result<()> {
    match &self.core {
      Some(core) => core.write_dump(out),
      None => writeln!(out, "HEAP: uninitialized"),
    }
  }

  pub(crate) fn core(&self) -> Result<&Core> {
    self.core.as_ref().ok_or(HeapError::Uninitialized)
  }

  pub(crate) fn core_mut(&mut self) -> Result<&mut Core> {
    self.core.as_mut().ok_or(HeapError::Uninitialized)
  }

  fn self_check(&self) {
    if !self.config.heap_checks_enabled() {
      return;
    }

    if let Some(core) = &self.core {
      if let Err(HeapError::Corrupted(violations)) = core.verify() {
        for violation in &violations {
          log::error!("{}", violation);
        }

        panic!("heap corrupted: {} violations, first: {}", violations.len(), violations[0]);
      }
    }
  }
}

impl Default for Heap {
  fn default() -> Self {
    Self::new()
  }
}

impl Core {
  /// Maps a data pointer back to its block, rejecting anything that is not
  /// an allocated block inside the carved arena.
  pub(crate) fn owning_block(
    &self,
    ptr: *const u8,
  ) -> Result<BlockRef> {
    let invalid = |reason| HeapError::InvalidFree {
      addr: ptr as usize,
      reason,
    };

    if ptr.is_null() {
      return Err(invalid(InvalidPointer::Null));
    }

    if (ptr as usize) % ALIGNMENT != 0 {
      return Err(invalid(InvalidPointer::Misaligned));
    }

    let block = self
      .arena
      .offset_of(ptr)
      .and_then(BlockRef::from_data)
      .filter(|block| self.arena.contains(block.offset(), HEADER_SIZE))
      .ok_or_else(|| invalid(InvalidPointer::OutOfArena))?;

    if block.is_free(&self.arena) {
      return Err(invalid(InvalidPointer::NotAllocated));
    }

    if !self.is_chained(block) {
      return Err(invalid(InvalidPointer::OutOfArena));
    }

    Ok(block)
  }

  /// Whether `block` sits on the address-order chain: both neighbors agree
  /// on where it starts. Reads only headers inside the carved arena.
  fn is_chained(
    &self,
    block: BlockRef,
  ) -> bool {
    let arena = &self.arena;

    if !arena.contains(block.data(), block.size(arena)) {
      return false;
    }

    let left_ok = if Some(block) == self.first {
      true
    } else {
      block
        .prev(arena)
        .filter(|prev| prev.offset() < block.offset())
        .filter(|prev| arena.contains(prev.offset(), HEADER_SIZE))
        .is_some_and(|prev| prev.next_adjacent(arena) == block)
    };

    if !left_ok {
      return false;
    }

    if Some(block) == self.last {
      block.data() + block.size(arena) == arena.end()
    } else {
      let next = block.next_adjacent(arena);

      arena.contains(next.offset(), HEADER_SIZE) && next.prev(arena) == Some(block)
    }
  }
}

impl fmt::Debug for Heap {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    let mut d = f.debug_struct("Heap");
    d.field("config", &self.config);

    let core = match &self.core {
      Some(core) => core,
      None => return d.field("initialized", &false).finish(),
    };

    d.field("base", &core.arena.base())
      .field("high_water", &core.arena.end())
      .field("capacity", &core.arena.capacity())
      .field("first", &core.first)
      .field("last", &core.last);

    for class in 0..FREE_LIST_COUNT {
      let mut members = Vec::new();
      let mut current = core.free_lists.head(class);

      // A corrupted list may cycle or leave the arena; stop at either.
      while let Some(block) = current {
        if members.len() > core.max_blocks() {
          members.push(String::from("..."));
          break;
        }

        if !core.arena.contains(block.offset(), HEADER_SIZE + MIN_DATA_SIZE) {
          members.push(format!("{} (past high-water mark)", block));
          break;
        }

        members.push(format!("{}({})", block, block.size(&core.arena)));
        current = block.links(&core.arena).next;
      }

      if !members.is_empty() {
        d.field(format!("from 2**{}", class).as_str(), &members);
      }
    }

    d.finish()
  }
}

#[cfg(test)]
mod tests {
  use rand::rngs::StdRng;
  use rand::{Rng, SeedableRng};

  use super::*;
  use crate::arena::page_size;
  use crate::free_list::classify;

  fn checked_heap(capacity: usize) -> Heap {
    let mut heap = Heap::with_config(HeapConfig::new().check_heap(true));
    heap.initialize(capacity).unwrap();
    heap
  }

  #[test]
  fn test_initialize_resets_state() {
    let mut heap = checked_heap(page_size());

    assert!(heap.is_initialized());
    assert_eq!(heap.capacity(), Some(page_size()));

    heap.allocate(100).unwrap();
    heap.allocate(100).unwrap();
    assert_eq!(heap.stats().unwrap().blocks, 2);

    heap.initialize(3 * page_size() - 1).unwrap();

    let stats = heap.stats().unwrap();
    assert_eq!(stats.blocks, 0);
    assert_eq!(stats.high_water, 0);
    assert_eq!(stats.capacity, 3 * page_size());
    assert!(heap.core().unwrap().free_lists.is_empty());
  }

  #[test]
  fn test_failed_initialize_leaves_heap_uninitialized() {
    let mut heap = checked_heap(page_size());

    assert_eq!(heap.initialize(0), Err(HeapError::ArenaUnavailable { requested: 0 }));
    assert!(!heap.is_initialized());
    assert_eq!(heap.allocate(8), Err(HeapError::Uninitialized));
  }

  #[test]
  fn test_exhaustion() {
    let mut heap = checked_heap(2 * page_size());
    let mut ptrs = Vec::new();

    let err = loop {
      match heap.allocate(120) {
        Ok(ptr) => ptrs.push(ptr),
        Err(err) => break err,
      }
    };

    assert_eq!(err, HeapError::OutOfMemory { requested: 120 });
    assert_eq!(ptrs.len(), 2 * page_size() / 136);
    heap.verify().unwrap();

    // smaller requests still fit in the leftover tail
    let stats = heap.stats().unwrap();
    let left = stats.capacity - stats.high_water;
    if left >= 32 {
      heap.allocate(left - 16).unwrap();
    }

    // freeing makes room again
    heap.free(ptrs[3].as_ptr()).unwrap();
    assert_eq!(heap.allocate(120).unwrap(), ptrs[3]);
    heap.verify().unwrap();
  }

  #[test]
  fn test_usable_size() {
    let mut heap = checked_heap(page_size());

    let ptr = heap.allocate(13).unwrap();
    assert_eq!(heap.usable_size(ptr.as_ptr()).unwrap(), 16);

    heap.free(ptr.as_ptr()).unwrap();
    assert_eq!(
      heap.usable_size(ptr.as_ptr()),
      Err(HeapError::InvalidFree {
        addr: ptr.as_ptr() as usize,
        reason: InvalidPointer::NotAllocated,
      })
    );
  }

  #[test]
  fn test_debug_lists_free_classes() {
    let mut heap = Heap::new();
    assert!(format!("{:?}", heap).contains("initialized: false"));

    heap.initialize(page_size()).unwrap();

    let a = heap.allocate(64).unwrap();
    heap.allocate(8).unwrap();
    heap.free(a.as_ptr()).unwrap();

    let debug = format!("{:?}", heap);
    assert!(debug.contains("from 2**6"));
    assert!(debug.contains("0x0(64)"));
  }

  #[test]
  fn test_debug_survives_link_past_high_water_mark() {
    let mut heap = Heap::new();
    heap.initialize(page_size()).unwrap();

    let a = heap.allocate(32).unwrap();
    heap.allocate(8).unwrap();
    heap.free(a.as_ptr()).unwrap();

    let core = heap.core_mut().unwrap();
    let block = core.free_lists.head(classify(32)).unwrap();
    let stray = BlockRef::new(core.arena.capacity());
    block.set_next_free(&mut core.arena, Some(stray));

    let debug = format!("{:?}", heap);
    assert!(debug.contains(&format!("{} (past high-water mark)", stray)));
  }

  // Mirrors a long-running random allocate/free workload.
  #[test]
  fn test_random_traffic_keeps_heap_consistent() {
    const SLOTS: usize = 64;
    const MAX_SIZE: usize = 504;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut heap = Heap::new();
    heap.initialize(16 * page_size()).unwrap();

    let mut slots: Vec<Option<(NonNull<u8>, usize, u8)>> = vec![None; SLOTS];

    for step in 0..20_000 {
      let index = rng.gen_range(0..SLOTS);

      match slots[index].take() {
        None => {
          let size = rng.gen_range(1..=MAX_SIZE);
          let fill = rng.r#gen::<u8>();

          match heap.allocate(size) {
            Ok(ptr) => {
              assert_eq!(ptr.as_ptr() as usize % 8, 0);
              unsafe { ptr.as_ptr().write_bytes(fill, size) };
              slots[index] = Some((ptr, size, fill));
            }
            Err(HeapError::OutOfMemory { .. }) => {}
            Err(err) => panic!("step {}: {}", step, err),
          }
        }
        Some((ptr, size, fill)) => {
          let data = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
          assert!(data.iter().all(|&byte| byte == fill), "step {}: payload clobbered", step);

          heap.free(ptr.as_ptr()).unwrap();
        }
      }

      if step % 500 == 0 {
        heap.verify().unwrap();
      }
    }

    for (ptr, _, _) in slots.into_iter().flatten() {
      heap.free(ptr.as_ptr()).unwrap();
    }

    heap.verify().unwrap();

    let stats = heap.stats().unwrap();
    assert_eq!(stats.blocks, 1);
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.free_bytes, stats.high_water - HEADER_SIZE);
  }
}
