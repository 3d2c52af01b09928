#![allow(dead_code)]

use std::{alloc::Layout, collections::HashMap, ptr::NonNull};

use tagheap::{Heap, MemorySource, Region, Tunables};

pub const PAGE: usize = 4096;

/// A fixed region for the break plus page mappings from the host allocator,
/// with counters so tests can see which path served a request.
pub struct TestSource {
  region: Region,
  /// Makes every positive `extend` fail, forcing the mapping fallback.
  pub fail_extend: bool,
  pub live_mappings: HashMap<usize, usize>,
  pub maps: usize,
  pub unmaps: usize,
}

impl TestSource {
  pub fn new(len: usize) -> Self {
    let words = Box::leak(vec![0u128; len / 16].into_boxed_slice());
    let bytes = unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), len) };
    Self {
      region: Region::new(bytes),
      fail_extend: false,
      live_mappings: HashMap::new(),
      maps: 0,
      unmaps: 0,
    }
  }

  pub fn used(&self) -> usize {
    self.region.used()
  }
}

unsafe impl MemorySource for TestSource {
  fn extend(&mut self, delta: isize) -> Option<NonNull<u8>> {
    if self.fail_extend && delta > 0 {
      return None;
    }
    self.region.extend(delta)
  }

  fn map_pages(&mut self, size: usize) -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(size, PAGE).ok()?;
    let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
    self.live_mappings.insert(ptr.as_ptr() as usize, size);
    self.maps += 1;
    Some(ptr)
  }

  unsafe fn unmap_pages(&mut self, addr: NonNull<u8>, size: usize) -> bool {
    match self.live_mappings.remove(&(addr.as_ptr() as usize)) {
      Some(len) if len == size => {
        unsafe { std::alloc::dealloc(addr.as_ptr(), Layout::from_size_align_unchecked(size, PAGE)) };
        self.unmaps += 1;
        true
      }
      Some(len) => {
        self.live_mappings.insert(addr.as_ptr() as usize, len);
        false
      }
      None => false,
    }
  }

  fn page_size(&self) -> usize {
    PAGE
  }

  fn maps_zeroed(&self) -> bool {
    true
  }
}

pub fn heap(len: usize) -> Heap<TestSource> {
  Heap::new(TestSource::new(len))
}

pub fn heap_with(len: usize, tunables: Tunables) -> Heap<TestSource> {
  Heap::with_tunables(TestSource::new(len), tunables)
}

/// Deterministic xorshift64 for stress tests.
pub struct XorShift(u64);

impl XorShift {
  pub fn new(seed: u64) -> Self {
    Self(seed.max(1))
  }

  pub fn next(&mut self) -> u64 {
    let mut x = self.0;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    self.0 = x;
    x
  }

  pub fn below(&mut self, n: usize) -> usize {
    (self.next() % n as u64) as usize
  }
}
