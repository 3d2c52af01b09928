//! A boundary-tag heap allocator.
//!
//! Every block carries its size in a header word, and free blocks repeat it
//! in a footer so neighbours can be merged in constant time. Free blocks are
//! kept in size-segregated bins:
//!
//! * fastbins: LIFO singly linked lists of small chunks that are not merged
//!   on release;
//! * one unsorted list that recently freed chunks pass through once before
//!   being binned;
//! * 62 exact-size small bins and 64 size-sorted large bins, with a bitmap of
//!   non-empty bins.
//!
//! Memory comes from a [`MemorySource`]: a moving break (like `sbrk`) plus
//! optional page mappings for very large requests.
//!
//! ```no_run
//! use tagheap::{Heap, Region};
//!
//! static mut ARENA: [u8; 1 << 20] = [0; 1 << 20];
//!
//! let mut heap = Heap::new(Region::new(unsafe { &mut *core::ptr::addr_of_mut!(ARENA) }));
//! let p = heap.allocate(100).unwrap();
//! unsafe { heap.release(p.as_ptr()).unwrap() };
//! ```

#![allow(clippy::missing_safety_doc)]

mod bins;
mod check;
mod chunk;
mod config;
mod derived;
mod error;
mod free;
mod global;
mod guard;
mod heap;
mod source;
mod stats;
mod system;

pub use crate::{
  chunk::{MALLOC_ALIGNMENT, MINSIZE, SIZE_SZ},
  config::{
    DEFAULT_CONSOLIDATION_THRESHOLD, DEFAULT_MAX_FAST, DEFAULT_MMAP_MAX, DEFAULT_MMAP_THRESHOLD,
    DEFAULT_TOP_PAD, DEFAULT_TRIM_THRESHOLD, Param, Tunables,
  },
  error::{Corruption, HeapError},
  global::{HeapGuard, LockedHeap, SpinLock},
  heap::Heap,
  source::{DEFAULT_PAGE_SIZE, MemorySource, Region},
  stats::Statistics,
};

#[cfg(unix)]
pub use crate::source::{MappedRegion, ProgramBreak};
