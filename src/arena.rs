use std::ptr::{self, NonNull};

use crate::align_to;
use crate::block::WORD_SIZE;
use crate::error::{HeapError, Result};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// The operating system page size, used to round arena reservations.
pub fn page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

  if size <= 0 {
    FALLBACK_PAGE_SIZE
  } else {
    size as usize
  }
}

unsafe fn os_reserve(size: usize) -> Option<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      ptr::null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    None
  } else {
    NonNull::new(ptr as *mut u8)
  }
}

unsafe fn os_release(
  ptr: NonNull<u8>,
  size: usize,
) {
  unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
}

/// A contiguous, zero-filled region reserved up front and carved into
/// blocks by bumping a high-water mark.
///
/// ```text
///   base                         base + end            base + capacity
///   ┌──────┬──────┬──────┬────────┬──────────────────────────────┐
///   │ blk  │ blk  │ blk  │  blk   │        untouched             │
///   └──────┴──────┴──────┴────────┴──────────────────────────────┘
///                                 ▲
///                          high-water mark
/// ```
///
/// All positions handed out are byte offsets from `base`. The arena knows
/// nothing about blocks; word reads and writes are bounds-checked against
/// the high-water mark.
pub struct Arena {
  base: NonNull<u8>,
  end: usize,
  capacity: usize,
}

impl Arena {
  /// Reserves `capacity` bytes rounded up to whole pages.
  pub fn reserve(capacity: usize) -> Result<Self> {
    let unavailable = HeapError::ArenaUnavailable {
      requested: capacity,
    };

    if capacity == 0 {
      return Err(unavailable);
    }

    let page = page_size();
    let size = match capacity.checked_add(page - 1) {
      Some(_) => align_to!(capacity, page),
      None => return Err(unavailable),
    };

    let base = unsafe { os_reserve(size) }.ok_or(unavailable)?;

    log::debug!("reserved arena of {} bytes at {:p} (requested {})", size, base, capacity);

    Ok(Self {
      base,
      end: 0,
      capacity: size,
    })
  }

  /// Advances the high-water mark by `size` bytes and returns the offset
  /// where the new extent starts. Nothing moves when the arena is full.
  pub fn grow(
    &mut self,
    size: usize,
  ) -> Result<usize> {
    let start = self.end;

    match start.checked_add(size) {
      Some(end) if end <= self.capacity => {
        self.end = end;

        log::trace!("arena grew by {} bytes, high-water mark {:#x}", size, end);

        Ok(start)
      }
      _ => Err(HeapError::ArenaExhausted {
        requested: size,
        available: self.capacity - start,
      }),
    }
  }

  /// Offset of the high-water mark.
  pub fn end(&self) -> usize {
    self.end
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn base(&self) -> NonNull<u8> {
    self.base
  }

  /// Whether `len` bytes starting at `offset` lie below the high-water mark.
  pub fn contains(
    &self,
    offset: usize,
    len: usize,
  ) -> bool {
    offset.checked_add(len).is_some_and(|end| end <= self.end)
  }

  pub fn read_word(
    &self,
    offset: usize,
  ) -> u64 {
    assert!(
      self.contains(offset, WORD_SIZE),
      "arena read at {:#x} past high-water mark {:#x}",
      offset,
      self.end
    );

    unsafe { self.base.as_ptr().add(offset).cast::<u64>().read_unaligned() }
  }

  pub fn write_word(
    &mut self,
    offset: usize,
    word: u64,
  ) {
    assert!(
      self.contains(offset, WORD_SIZE),
      "arena write at {:#x} past high-water mark {:#x}",
      offset,
      self.end
    );

    unsafe { self.base.as_ptr().add(offset).cast::<u64>().write_unaligned(word) }
  }

  /// Machine pointer for an offset inside the carved region.
  pub fn ptr_at(
    &self,
    offset: usize,
  ) -> NonNull<u8> {
    debug_assert!(offset <= self.end);

    unsafe { self.base.add(offset) }
  }

  /// Inverse of [`Arena::ptr_at`]; `None` when `ptr` lies outside the
  /// carved region.
  pub fn offset_of(
    &self,
    ptr: *const u8,
  ) -> Option<usize> {
    let addr = ptr as usize;
    let base = self.base.as_ptr() as usize;

    if addr < base || addr - base >= self.end {
      None
    } else {
      Some(addr - base)
    }
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    log::debug!("releasing arena at {:p} ({} bytes)", self.base, self.capacity);

    unsafe { os_release(self.base, self.capacity) };
  }
}
