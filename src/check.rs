//! Invariant checker and diagnostics.
//!
//! Two independent read-only walks: the block chain in address order, and
//! every free list from its head. Nothing here mutates the heap.

use std::collections::{HashMap, HashSet};
use std::io;

use crate::block::{ALIGNMENT, BlockRef, HEADER_SIZE, MIN_DATA_SIZE};
use crate::error::{HeapError, Result, Violation};
use crate::free_list::{FREE_LIST_COUNT, classify};
use crate::heap::Core;

/// Occupancy figures gathered by walking the block chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub blocks: usize,
  pub free_blocks: usize,
  /// Data bytes held by allocated blocks.
  pub allocated_bytes: usize,
  /// Data bytes held by free blocks.
  pub free_bytes: usize,
  pub largest_free: usize,
  pub high_water: usize,
  pub capacity: usize,
}

impl Core {
  /// Blocks in address order. Stops at the first block whose header or
  /// data would run past the high-water mark.
  fn walk_chain(&self) -> ChainWalk<'_> {
    ChainWalk {
      core: self,
      next: self.first,
    }
  }

  pub(crate) fn verify(&self) -> Result<()> {
    let mut violations = Vec::new();

    let chain = self.verify_chain(&mut violations);
    self.verify_free_lists(&chain, &mut violations);

    if violations.is_empty() {
      Ok(())
    } else {
      Err(HeapError::Corrupted(violations))
    }
  }

  /// Checks sizes, back-links and the coalescing invariant; returns the
  /// blocks seen along the way.
  fn verify_chain(
    &self,
    violations: &mut Vec<Violation>,
  ) -> ChainSummary {
    let arena = &self.arena;
    let mut blocks = HashSet::new();
    let mut free_blocks = Vec::new();
    let mut last: Option<BlockRef> = None;
    let mut chain_end = self.first.map_or(0, BlockRef::offset);

    let expected_first = if arena.end() > 0 {
      Some(BlockRef::new(0))
    } else {
      None
    };

    if self.first != expected_first {
      violations.push(Violation::FirstBlockMismatch {
        tracked: self.first,
        expected: expected_first,
      });
    }

    let mut truncated = false;

    for step in self.walk_chain() {
      let block = match step {
        Ok(block) => block,
        Err(violation) => {
          violations.push(violation);
          truncated = true;
          break;
        }
      };

      blocks.insert(block);
      let size = block.size(arena);

      if size < MIN_DATA_SIZE {
        violations.push(Violation::UndersizedBlock { block, size });
      }

      if size % ALIGNMENT != 0 {
        violations.push(Violation::MisalignedSize { block, size });
      }

      let back_link = block.prev(arena);
      if back_link != last {
        violations.push(Violation::BrokenBackLink {
          block,
          expected: last,
          found: back_link,
        });
      }

      if block.is_free(arena) {
        if let Some(prev) = last.filter(|prev| prev.is_free(arena)) {
          violations.push(Violation::AdjacentFree { block, prev });
        }

        free_blocks.push(block);
      }

      last = Some(block);
      chain_end = block.data() + size;
    }

    if truncated {
      return ChainSummary {
        blocks,
        free_blocks,
        complete: false,
      };
    }

    if last != self.last {
      violations.push(Violation::LastBlockMismatch {
        tracked: self.last,
        walked: last,
      });
    }

    if chain_end != arena.end() {
      violations.push(Violation::ChainEndMismatch {
        chain_end,
        high_water: arena.end(),
      });
    }

    ChainSummary {
      blocks,
      free_blocks,
      complete: true,
    }
  }

  /// Checks every list's internal links and that free blocks appear in
  /// exactly the list their size selects. List entries must be blocks of
  /// the chain; that part is skipped when the chain walk was cut short.
  fn verify_free_lists(
    &self,
    chain: &ChainSummary,
    violations: &mut Vec<Violation>,
  ) {
    let arena = &self.arena;
    let mut listed: HashMap<BlockRef, usize> = HashMap::new();

    for class in 0..FREE_LIST_COUNT {
      let mut last = None;
      let mut current = self.free_lists.head(class);

      while let Some(block) = current {
        if !arena.contains(block.offset(), HEADER_SIZE + MIN_DATA_SIZE) {
          violations.push(Violation::BlockOutOfBounds { block, size: 0 });
          break;
        }

        // Also stops a cycle.
        if listed.insert(block, class).is_some() {
          violations.push(Violation::DuplicateFreeEntry { block, class });
          break;
        }

        if chain.complete && !chain.blocks.contains(&block) {
          violations.push(Violation::UnknownFreeEntry { block, class });
        }

        let links = block.links(arena);
        if links.prev != last {
          violations.push(Violation::BrokenFreeLink {
            block,
            class,
            expected: last,
            found: links.prev,
          });
        }

        let field = block.size_field(arena);
        if !field.is_free() {
          violations.push(Violation::AllocatedInFreeList { block, class });
        } else if classify(field.size()) != class {
          violations.push(Violation::WrongFreeList {
            block,
            class,
            expected: classify(field.size()),
          });
        }

        last = Some(block);
        current = links.next;
      }
    }

    for &block in &chain.free_blocks {
      if !listed.contains_key(&block) {
        violations.push(Violation::NotInFreeList {
          block,
          class: classify(block.size(arena)),
        });
      }
    }
  }

  pub(crate) fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      high_water: self.arena.end(),
      capacity: self.arena.capacity(),
      ..HeapStats::default()
    };

    for block in self.walk_chain().map_while(|step| step.ok()) {
      let field = block.size_field(&self.arena);

      stats.blocks += 1;

      if field.is_free() {
        stats.free_blocks += 1;
        stats.free_bytes += field.size();
        stats.largest_free = stats.largest_free.max(field.size());
      } else {
        stats.allocated_bytes += field.size();
      }
    }

    stats
  }

  pub(crate) fn write_dump<W: io::Write>(
    &self,
    out: &mut W,
  ) -> io::Result<()> {
    let arena = &self.arena;

    writeln!(
      out,
      "HEAP START: {:p}; HEAP END: {:#x}; CAPACITY: {:#x}",
      arena.base(),
      arena.end(),
      arena.capacity()
    )?;
    writeln!(
      out,
      "FIRST: {}; LAST: {}",
      BlockRef::display(self.first),
      BlockRef::display(self.last)
    )?;

    for class in 0..FREE_LIST_COUNT {
      writeln!(out, "FREE_LIST[{}]: {}", class, BlockRef::display(self.free_lists.head(class)))?;
    }

    for step in self.walk_chain() {
      let block = match step {
        Ok(block) => block,
        Err(violation) => {
          writeln!(out, "\tSTOPPED: {}", violation)?;
          break;
        }
      };

      let field = block.size_field(arena);

      writeln!(
        out,
        "\tBLOCK: {}; SIZE: {:#x}; FREE: {}; NEXT: {}; PREVIOUS: {}",
        block,
        field.size(),
        field.is_free() as u8,
        block.next_adjacent(arena),
        BlockRef::display(block.prev(arena))
      )?;

      if field.is_free() && field.size() >= MIN_DATA_SIZE {
        let links = block.links(arena);

        writeln!(
          out,
          "\t\tCLASS: {}; NEXTFREE: {}; PREVFREE: {}",
          classify(field.size()),
          BlockRef::display(links.next),
          BlockRef::display(links.prev)
        )?;
      }
    }

    let limit = self.max_blocks();
    for class in 0..FREE_LIST_COUNT {
      let mut current = self.free_lists.head(class);
      let mut walked = 0;

      while let Some(block) = current {
        if walked > limit || !arena.contains(block.offset(), HEADER_SIZE + MIN_DATA_SIZE) {
          writeln!(out, "\tFREE[{}]: {} (walk aborted)", class, block)?;
          break;
        }

        let links = block.links(arena);

        writeln!(
          out,
          "\tFREE[{}]: {}; NEXT: {}; PREV: {}",
          class,
          block,
          BlockRef::display(links.next),
          BlockRef::display(links.prev)
        )?;

        walked += 1;
        current = links.next;
      }
    }

    match self.verify() {
      Ok(()) => writeln!(out, "Heap check passed."),
      Err(HeapError::Corrupted(violations)) => {
        for violation in &violations {
          writeln!(out, "{}", violation)?;
        }

        writeln!(out, "!!!! Heap check failed ({} violations).", violations.len())
      }
      Err(err) => writeln!(out, "!!!! Heap check failed: {}", err),
    }
  }
}

/// What the chain walk saw.
struct ChainSummary {
  blocks: HashSet<BlockRef>,
  free_blocks: Vec<BlockRef>,
  /// False when the walk stopped at a block running past the high-water
  /// mark.
  complete: bool,
}

/// Address-order iterator over the block chain. Yields a violation and
/// ends when a block does not fit below the high-water mark.
struct ChainWalk<'a> {
  core: &'a Core,
  next: Option<BlockRef>,
}

impl Iterator for ChainWalk<'_> {
  type Item = std::result::Result<BlockRef, Violation>;

  fn next(&mut self) -> Option<Self::Item> {
    let block = self.next.take()?;
    let arena = &self.core.arena;

    if block.offset() >= arena.end() {
      return None;
    }

    if !arena.contains(block.offset(), HEADER_SIZE) {
      return Some(Err(Violation::BlockOutOfBounds { block, size: 0 }));
    }

    let size = block.size(arena);
    if !arena.contains(block.data(), size) {
      return Some(Err(Violation::BlockOutOfBounds { block, size }));
    }

    self.next = Some(block.next_adjacent(arena));

    Some(Ok(block))
  }
}

#[cfg(test)]
mod tests {
  use std::ptr::NonNull;

  use super::*;
  use crate::Heap;
  use crate::arena::page_size;
  use crate::block::{FreeLinks, SizeField, block_size};

  fn heap_with(sizes: &[usize]) -> (Heap, Vec<NonNull<u8>>) {
    let mut heap = Heap::new();
    heap.initialize(4 * page_size()).unwrap();

    let ptrs = sizes.iter().map(|&size| heap.allocate(size).unwrap()).collect();

    (heap, ptrs)
  }

  fn block_of(
    heap: &Heap,
    ptr: NonNull<u8>,
  ) -> BlockRef {
    let core = heap.core().unwrap();

    BlockRef::from_data(core.arena.offset_of(ptr.as_ptr()).unwrap()).unwrap()
  }

  fn violations(heap: &Heap) -> Vec<Violation> {
    match heap.verify() {
      Err(HeapError::Corrupted(violations)) => violations,
      other => panic!("expected corruption, got {:?}", other),
    }
  }

  #[test]
  fn test_empty_heap_is_consistent() {
    let (heap, _) = heap_with(&[]);

    heap.verify().unwrap();
    assert_eq!(heap.stats().unwrap().blocks, 0);
  }

  #[test]
  fn test_uninitialized_verify() {
    assert_eq!(Heap::new().verify(), Err(HeapError::Uninitialized));
    assert_eq!(Heap::new().stats(), Err(HeapError::Uninitialized));
  }

  #[test]
  fn test_stats() {
    let (mut heap, ptrs) = heap_with(&[8, 100, 8, 300, 8]);

    heap.free(ptrs[1].as_ptr()).unwrap();
    heap.free(ptrs[3].as_ptr()).unwrap();

    let stats = heap.stats().unwrap();

    assert_eq!(stats.blocks, 5);
    assert_eq!(stats.free_blocks, 2);
    assert_eq!(stats.free_bytes, 104 + 304);
    assert_eq!(stats.largest_free, 304);
    assert_eq!(stats.allocated_bytes, 3 * 16);
    assert_eq!(stats.high_water, 3 * block_size(8) + block_size(100) + block_size(300));
    assert_eq!(stats.capacity, 4 * page_size());
  }

  #[test]
  fn test_detects_broken_back_link() {
    let (mut heap, ptrs) = heap_with(&[8, 8, 8]);
    let b = block_of(&heap, ptrs[1]);
    let c = block_of(&heap, ptrs[2]);

    let core = heap.core_mut().unwrap();
    c.set_prev(&mut core.arena, None);

    assert_eq!(
      violations(&heap),
      vec![Violation::BrokenBackLink {
        block: c,
        expected: Some(b),
        found: None,
      }]
    );
  }

  #[test]
  fn test_detects_lost_merge() {
    let (mut heap, ptrs) = heap_with(&[8, 8, 8]);
    let a = block_of(&heap, ptrs[0]);
    let b = block_of(&heap, ptrs[1]);

    heap.free(ptrs[0].as_ptr()).unwrap();

    // mark b free behind the allocator's back and list it
    let core = heap.core_mut().unwrap();
    b.set_free(&mut core.arena, true);
    core.free_lists.insert(&mut core.arena, b);

    assert_eq!(violations(&heap), vec![Violation::AdjacentFree { block: b, prev: a }]);
  }

  #[test]
  fn test_detects_unlisted_free_block() {
    let (mut heap, ptrs) = heap_with(&[8, 8, 8]);
    let b = block_of(&heap, ptrs[1]);

    heap.free(ptrs[1].as_ptr()).unwrap();

    let core = heap.core_mut().unwrap();
    core.free_lists.remove(&mut core.arena, b);

    assert_eq!(
      violations(&heap),
      vec![Violation::NotInFreeList {
        block: b,
        class: classify(16),
      }]
    );
  }

  #[test]
  fn test_detects_free_entry_off_the_chain() {
    let (mut heap, ptrs) = heap_with(&[200, 8]);
    let a = block_of(&heap, ptrs[0]);

    // a free block forged inside a's payload
    let forged = BlockRef::new(a.data() + 16);
    let core = heap.core_mut().unwrap();
    forged.init(&mut core.arena, Some(a), SizeField::new(64, true));
    core.free_lists.insert(&mut core.arena, forged);

    assert_eq!(
      violations(&heap),
      vec![Violation::UnknownFreeEntry {
        block: forged,
        class: classify(64),
      }]
    );
  }

  #[test]
  fn test_detects_allocated_block_in_free_list() {
    let (mut heap, ptrs) = heap_with(&[8, 8, 200, 8]);
    let b = block_of(&heap, ptrs[1]);
    let c = block_of(&heap, ptrs[2]);

    heap.free(ptrs[1].as_ptr()).unwrap();
    heap.free(ptrs[2].as_ptr()).unwrap();
    // b and c merged; flip the merged block back to allocated while it stays listed
    let core = heap.core_mut().unwrap();
    let merged = b.size(&core.arena);
    assert_eq!(merged, 16 + HEADER_SIZE + 200);
    assert_eq!(b.next_adjacent(&core.arena).offset(), c.offset() + HEADER_SIZE + 200);

    b.set_size_field(&mut core.arena, SizeField::new(merged, false));

    let found = violations(&heap);
    assert!(found.contains(&Violation::AllocatedInFreeList {
      block: b,
      class: classify(merged),
    }));
  }

  #[test]
  fn test_detects_wrong_class_and_size_problems() {
    let (mut heap, ptrs) = heap_with(&[8, 64, 8]);
    let b = block_of(&heap, ptrs[1]);

    heap.free(ptrs[1].as_ptr()).unwrap();

    let core = heap.core_mut().unwrap();
    b.set_size(&mut core.arena, 63);

    let found = violations(&heap);
    assert!(found.contains(&Violation::MisalignedSize { block: b, size: 63 }));
    assert!(found.contains(&Violation::WrongFreeList {
      block: b,
      class: classify(64),
      expected: classify(63),
    }));
  }

  #[test]
  fn test_detects_broken_free_links_and_cycles() {
    let (mut heap, ptrs) = heap_with(&[8, 8, 8, 8, 8]);
    let b = block_of(&heap, ptrs[1]);
    let d = block_of(&heap, ptrs[3]);

    heap.free(ptrs[1].as_ptr()).unwrap();
    heap.free(ptrs[3].as_ptr()).unwrap();

    // list is d -> b; point b back at d in both directions
    let core = heap.core_mut().unwrap();
    b.set_links(
      &mut core.arena,
      FreeLinks {
        next: Some(d),
        prev: None,
      },
    );

    let found = violations(&heap);
    assert!(found.contains(&Violation::BrokenFreeLink {
      block: b,
      class: classify(16),
      expected: Some(d),
      found: None,
    }));
    assert!(found.contains(&Violation::DuplicateFreeEntry {
      block: d,
      class: classify(16),
    }));
  }

  #[test]
  fn test_detects_last_block_and_chain_end_mismatch() {
    let (mut heap, ptrs) = heap_with(&[8, 8]);
    let a = block_of(&heap, ptrs[0]);
    let b = block_of(&heap, ptrs[1]);

    let core = heap.core_mut().unwrap();
    core.last = Some(a);
    assert_eq!(
      violations(&heap),
      vec![Violation::LastBlockMismatch {
        tracked: Some(a),
        walked: Some(b),
      }]
    );

    let core = heap.core_mut().unwrap();
    core.first = None;
    core.last = None;
    let end = core.arena.end();
    assert_eq!(
      violations(&heap),
      vec![
        Violation::FirstBlockMismatch {
          tracked: None,
          expected: Some(a),
        },
        Violation::ChainEndMismatch {
          chain_end: 0,
          high_water: end,
        },
      ]
    );
  }

  #[test]
  fn test_detects_block_running_past_high_water_mark() {
    let (mut heap, ptrs) = heap_with(&[8, 8]);
    let b = block_of(&heap, ptrs[1]);

    let core = heap.core_mut().unwrap();
    b.set_size(&mut core.arena, 4096);

    assert_eq!(violations(&heap), vec![Violation::BlockOutOfBounds { block: b, size: 4096 }]);
  }

  #[test]
  fn test_dump_reports_layout_and_outcome() {
    let (mut heap, ptrs) = heap_with(&[8, 40, 8]);
    heap.free(ptrs[1].as_ptr()).unwrap();

    let mut out = Vec::new();
    heap.write_dump(&mut out).unwrap();
    let report = String::from_utf8(out).unwrap();

    assert!(report.contains("FREE_LIST[5]: 0x20"));
    assert!(report.contains("BLOCK: 0x20; SIZE: 0x28; FREE: 1"));
    assert!(report.contains("CLASS: 5"));
    assert!(report.ends_with("Heap check passed.\n"));

    let b = block_of(&heap, ptrs[2]);
    let core = heap.core_mut().unwrap();
    b.set_prev(&mut core.arena, None);

    let mut out = Vec::new();
    heap.write_dump(&mut out).unwrap();
    let report = String::from_utf8(out).unwrap();

    assert!(report.contains("continuity error"));
    assert!(report.contains("!!!! Heap check failed (1 violations)."));
  }

  #[test]
  fn test_dump_uninitialized() {
    let mut out = Vec::new();
    Heap::new().write_dump(&mut out).unwrap();

    assert_eq!(out, b"HEAP: uninitialized\n");
  }

  #[test]
  #[cfg(debug_assertions)]
  #[should_panic(expected = "heap corrupted")]
  fn test_self_check_is_fatal() {
    let mut heap = Heap::with_config(crate::HeapConfig::new().check_heap(true));
    heap.initialize(page_size()).unwrap();

    let a = heap.allocate(8).unwrap();
    let b = heap.allocate(8).unwrap();
    let block = block_of(&heap, b);

    let core = heap.core_mut().unwrap();
    block.set_prev(&mut core.arena, None);

    heap.free(a.as_ptr()).unwrap();
  }
}
