use std::process::ExitCode;
use std::ptr::NonNull;
use std::time::Instant;

use rand::Rng;
use segalloc::{Heap, HeapError, arena::page_size};

const ITERATIONS: usize = 10_000_000;
const MAX_SIZE: usize = 504;
const NUM_PAGES: usize = 16;
const MAX_ALLOCS: usize = 256;

/// One tracked allocation. `size` is zero while the slot is empty.
#[derive(Clone, Copy)]
struct Slot {
  size: usize,
  addr: Option<NonNull<u8>>,
}

fn main() -> ExitCode {
  let iterations = std::env::args()
    .nth(1)
    .and_then(|arg| arg.parse().ok())
    .unwrap_or(ITERATIONS);

  let mut rng = rand::thread_rng();
  let mut heap = Heap::new();

  println!("running");

  if let Err(err) = heap.initialize(page_size() * NUM_PAGES) {
    println!("error: {}", err);
    return ExitCode::from(2);
  }
  println!("heap initialized");

  // The slot table lives inside the heap it is exercising.
  let table_bytes = MAX_ALLOCS * std::mem::size_of::<Slot>();
  let table = match heap.allocate(table_bytes) {
    Ok(ptr) => ptr.as_ptr() as *mut Slot,
    Err(err) => {
      println!("error: {}", err);
      return ExitCode::from(2);
    }
  };

  let mem_size = page_size() * NUM_PAGES - table_bytes;
  let mut bytes_allocated = table_bytes + 8;

  for i in 0..MAX_ALLOCS {
    unsafe { table.add(i).write(Slot { size: 0, addr: None }) };
  }

  let start = Instant::now();

  for _ in 0..iterations {
    let index = rng.gen_range(0..MAX_ALLOCS);
    let slot = unsafe { &mut *table.add(index) };

    if slot.size == 0 {
      if bytes_allocated + MAX_SIZE >= mem_size {
        continue;
      }

      let size = rng.gen_range(0..MAX_SIZE);
      let size = size + (8 - size % 8);

      match heap.allocate(size) {
        Ok(addr) => {
          slot.addr = Some(addr);
          slot.size = size + 8;
          bytes_allocated += size + 8;
        }
        Err(err @ HeapError::OutOfMemory { .. }) => {
          println!("failed alloc of size: {} ({})", size, err);
          heap.dump();
          return ExitCode::from(1);
        }
        Err(err) => {
          println!("error: {}", err);
          return ExitCode::from(2);
        }
      }
    } else {
      bytes_allocated -= slot.size;
      slot.size = 0;

      let addr = slot.addr.take().map_or(std::ptr::null_mut(), NonNull::as_ptr);
      if let Err(err) = heap.free(addr) {
        println!("invalid free: {}", err);
        return ExitCode::from(2);
      }
    }
  }

  let elapsed = start.elapsed();

  heap.dump();
  println!("done");

  for i in 0..MAX_ALLOCS {
    let slot = unsafe { &mut *table.add(i) };

    if let Some(addr) = slot.addr.take() {
      bytes_allocated -= slot.size;
      slot.size = 0;

      if let Err(err) = heap.free(addr.as_ptr()) {
        println!("invalid free: {}", err);
        return ExitCode::from(2);
      }
    }
  }

  if let Err(err) = heap.free(table as *mut u8) {
    println!("invalid free: {}", err);
    return ExitCode::from(2);
  }

  heap.dump();

  println!(
    "{} iterations in {} ms, {} bytes still accounted",
    iterations,
    elapsed.as_millis(),
    bytes_allocated - table_bytes - 8
  );

  ExitCode::SUCCESS
}
