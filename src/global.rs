//! Process-wide entry points: a spin-locked heap usable as `#[global_allocator]`
//! and, behind the `c_api` feature, the C malloc family.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  ptr::{self, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

use crate::{chunk::MALLOC_ALIGNMENT, heap::Heap, source::MemorySource};

// =============================================================================
// SpinLock
// =============================================================================

/// Test-and-test-and-set lock. Never blocks in the kernel, so it is usable
/// from inside the allocator.
pub struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  pub fn try_lock(&self) -> bool {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  #[inline]
  pub fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

impl Default for SpinLock {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// LockedHeap
// =============================================================================

/// A [`Heap`] behind a [`SpinLock`]; every operation runs under the lock.
pub struct LockedHeap<S: MemorySource> {
  lock: SpinLock,
  heap: UnsafeCell<Heap<S>>,
}

// SAFETY: the heap is only reached through `lock`, which serializes access.
unsafe impl<S: MemorySource + Send> Sync for LockedHeap<S> {}

impl<S: MemorySource> LockedHeap<S> {
  pub const fn new(heap: Heap<S>) -> Self {
    Self {
      lock: SpinLock::new(),
      heap: UnsafeCell::new(heap),
    }
  }

  /// Spins until the heap is free and returns exclusive access to it.
  pub fn lock(&self) -> HeapGuard<'_, S> {
    self.lock.lock();
    HeapGuard { owner: self }
  }

  pub fn try_lock(&self) -> Option<HeapGuard<'_, S>> {
    self.lock.try_lock().then(|| HeapGuard { owner: self })
  }

  /// Runs `f` with the lock held.
  pub fn with<R>(&self, f: impl FnOnce(&mut Heap<S>) -> R) -> R {
    f(&mut *self.lock())
  }
}

pub struct HeapGuard<'a, S: MemorySource> {
  owner: &'a LockedHeap<S>,
}

impl<S: MemorySource> Deref for HeapGuard<'_, S> {
  type Target = Heap<S>;

  fn deref(&self) -> &Heap<S> {
    unsafe { &*self.owner.heap.get() }
  }
}

impl<S: MemorySource> DerefMut for HeapGuard<'_, S> {
  fn deref_mut(&mut self) -> &mut Heap<S> {
    unsafe { &mut *self.owner.heap.get() }
  }
}

impl<S: MemorySource> Drop for HeapGuard<'_, S> {
  fn drop(&mut self) {
    self.owner.lock.unlock();
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

unsafe impl<S: MemorySource + Send> GlobalAlloc for LockedHeap<S> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let mut heap = self.lock();
    let result = if layout.align() > MALLOC_ALIGNMENT {
      heap.allocate_aligned(layout.align(), layout.size())
    } else {
      heap.allocate(layout.size())
    };
    result.map_or(null_mut(), |p| p.as_ptr())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    // Corruption is already logged; there is no way to report it from here.
    let _ = unsafe { self.lock().release(ptr) };
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= MALLOC_ALIGNMENT {
      return unsafe { self.lock().reallocate(ptr, new_size) }.map_or(null_mut(), |p| p.as_ptr());
    }

    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    let new_ptr = unsafe { self.alloc(new_layout) };
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        self.dealloc(ptr, layout);
      }
    }
    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > MALLOC_ALIGNMENT {
      let ptr = unsafe { self.alloc(layout) };
      if !ptr.is_null() {
        unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
      }
      return ptr;
    }
    let result = self.lock().allocate_zeroed(1, layout.size());
    result.map_or(null_mut(), |p| p.as_ptr())
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(all(feature = "c_api", unix))]
mod c_api {
  use core::ptr::null_mut;

  use super::LockedHeap;
  use crate::{config::Param, heap::Heap, source::ProgramBreak};

  const EINVAL: i32 = 22;
  const ENOMEM: i32 = 12;

  static HEAP: LockedHeap<ProgramBreak> = LockedHeap::new(Heap::new(ProgramBreak));

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    HEAP.lock().allocate(size).map_or(null_mut(), |p| p.as_ptr())
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut u8) {
    let _ = unsafe { HEAP.lock().release(ptr) };
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    HEAP
      .lock()
      .allocate_zeroed(nmemb, size)
      .map_or(null_mut(), |p| p.as_ptr())
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { HEAP.lock().reallocate(ptr, size) }.map_or(null_mut(), |p| p.as_ptr())
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
    HEAP
      .lock()
      .allocate_aligned(alignment, size)
      .map_or(null_mut(), |p| p.as_ptr())
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    unsafe { memalign(alignment, size) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut u8,
    alignment: usize,
    size: usize,
  ) -> i32 {
    if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
      return EINVAL;
    }
    match HEAP.lock().allocate_aligned(alignment, size) {
      Ok(p) => {
        unsafe { *memptr = p.as_ptr() };
        0
      }
      Err(_) => ENOMEM,
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn valloc(size: usize) -> *mut u8 {
    HEAP
      .lock()
      .allocate_page_aligned(size)
      .map_or(null_mut(), |p| p.as_ptr())
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn pvalloc(size: usize) -> *mut u8 {
    HEAP
      .lock()
      .allocate_page_rounded(size)
      .map_or(null_mut(), |p| p.as_ptr())
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
    unsafe { HEAP.lock().usable_size(ptr) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_trim(pad: usize) -> i32 {
    HEAP.lock().trim(pad).map_or(0, |released| (released > 0) as i32)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn mallopt(param: i32, value: i32) -> i32 {
    let (Some(param), Ok(value)) = (Param::from_mallopt(param), usize::try_from(value)) else {
      return 0;
    };
    HEAP.lock().set_option(param, value).is_ok() as i32
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn independent_calloc(
    n: usize,
    elem_size: usize,
    chunks: *mut *mut u8,
  ) -> *mut *mut u8 {
    unsafe { HEAP.lock().independent_calloc(n, elem_size, chunks) }
      .map_or(null_mut(), |p| p.as_ptr())
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn independent_comalloc(
    n: usize,
    sizes: *const usize,
    chunks: *mut *mut u8,
  ) -> *mut *mut u8 {
    if sizes.is_null() {
      return null_mut();
    }
    let sizes = unsafe { core::slice::from_raw_parts(sizes, n) };
    unsafe { HEAP.lock().independent_comalloc(sizes, chunks) }.map_or(null_mut(), |p| p.as_ptr())
  }
}
