//! # segalloc - A Segregated Free-List Heap Allocator
//!
//! This crate provides a general-purpose **heap allocator** that manages one
//! fixed-size arena reserved from the operating system up front (`mmap`) and
//! hands out and takes back blocks of it, like `malloc`/`free`.
//!
//! ## Overview
//!
//! Every block carries its metadata in-band, right before the bytes handed
//! to the caller. Free blocks are threaded into one of twenty doubly linked
//! lists picked by the power of two of their size:
//!
//! ```text
//!   Arena:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │ ┌─────┬─────────┬─────┬───────────────┬─────┐                        │
//!   │ │ A1  │  F1     │ A2  │      F2       │ A3  │     untouched          │
//!   │ └─────┴─────────┴─────┴───────────────┴─────┘                        │
//!   │                                             ▲                        │
//!   │                                      high-water mark                 │
//!   └──────────────────────────────────────────────────────────────────────┘
//!
//!   Free lists (class i holds sizes 2^i .. 2^(i+1)):
//!
//!     [4] ─► F1
//!     [7] ─► F2
//!     [19] (everything from 512 KiB up)
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   segalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── arena      - Arena: OS reservation and the high-water mark
//!   ├── block      - In-band header layout and field codec
//!   ├── free_list  - Segregated free lists
//!   ├── alloc      - Allocation: reuse, split, grow
//!   ├── dealloc    - Deallocation: coalesce and reinsert
//!   ├── check      - Invariant checker, stats and dump
//!   ├── config     - HeapConfig
//!   ├── error      - HeapError and Violation
//!   └── heap       - Heap, the allocator context
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use segalloc::Heap;
//!
//! let mut heap = Heap::new();
//! heap.initialize(64 * 1024).unwrap();
//!
//! let ptr = heap.allocate(8).unwrap().as_ptr() as *mut u64;
//!
//! unsafe {
//!     *ptr = 42;
//!     assert_eq!(*ptr, 42);
//! }
//!
//! heap.free(ptr as *mut u8).unwrap();
//! heap.verify().unwrap();
//! ```
//!
//! ## How It Works
//!
//! A request first looks for a free block in its own class (first fit),
//! then takes the head of any larger class. Oversized blocks are split and
//! the tail goes back to the free lists. When nothing fits, a fresh block is
//! carved off the end of the arena:
//!
//! ```text
//!   Single Allocation:
//!   ┌───────────────────────┬────────────────────────────────┐
//!   │    Block Header       │         User Data              │
//!   │  ┌─────────────────┐  │                                │
//!   │  │ previous block  │  │  ┌──────────────────────────┐  │
//!   │  │ free | size     │  │  │                          │  │
//!   │  └─────────────────┘  │  │  size bytes usable       │  │
//!   │      16 bytes         │  └──────────────────────────┘  │
//!   └───────────────────────┴────────────────────────────────┘
//!                           ▲
//!                           └── Pointer returned to user
//! ```
//!
//! Freeing merges the block with a free left and/or right neighbor, so two
//! free blocks are never adjacent.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: `Heap` is neither `Send` nor `Sync`
//! - **Fixed arena**: the arena never grows past its initial reservation
//! - **Unix-only**: Requires `libc` and `mmap` (POSIX systems)

pub mod align;
mod alloc;
pub mod arena;
pub mod block;
mod check;
mod config;
mod dealloc;
mod error;
pub mod free_list;
mod heap;

pub use block::verify_encoding;
pub use check::HeapStats;
pub use config::HeapConfig;
pub use error::{HeapError, InvalidPointer, Result, Violation};
pub use free_list::classify;
pub use heap::Heap;
