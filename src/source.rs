//! Where heap memory comes from.
//!
//! A [`MemorySource`] models the two primitives a kernel or process offers an
//! allocator: a movable break (`sbrk`) and, optionally, independent page
//! mappings (`mmap` / `munmap`).

use core::ptr::NonNull;

/// Default page size when a source does not report one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Raw memory provider for a [`crate::Heap`].
///
/// # Safety
///
/// Implementors must uphold:
///
/// - `extend(delta)` with `delta > 0` returns the previous break and makes
///   `[prev, prev + delta)` readable and writable until the break moves back
///   below it. `extend(0)` returns the current break without side effects.
///   `delta < 0` moves the break down and returns the previous break.
/// - `map_pages(size)` returns a region of exactly `size` bytes, aligned to
///   [`MemorySource::page_size`], owned exclusively by the heap until passed
///   to `unmap_pages`.
/// - `page_size` is a constant power of two.
pub unsafe trait MemorySource {
  /// Moves the break by `delta` bytes; `None` if the request cannot be met.
  fn extend(&mut self, delta: isize) -> Option<NonNull<u8>>;

  /// Maps an independent region of `size` bytes.
  fn map_pages(&mut self, _size: usize) -> Option<NonNull<u8>> {
    None
  }

  /// Returns a region obtained from [`MemorySource::map_pages`].
  ///
  /// # Safety
  ///
  /// `addr` and `size` must describe exactly one live mapping.
  unsafe fn unmap_pages(&mut self, _addr: NonNull<u8>, _size: usize) -> bool {
    false
  }

  fn page_size(&self) -> usize {
    DEFAULT_PAGE_SIZE
  }

  /// Whether successive extensions are expected to be adjacent.
  fn contiguous(&self) -> bool {
    true
  }

  /// Whether freshly mapped pages are known to be zero.
  fn maps_zeroed(&self) -> bool {
    false
  }
}

// =============================================================================
// Region
// =============================================================================

/// A fixed address range handed out by a moving break. No page mapping.
///
/// This is the kernel configuration: the heap lives in a range reserved at
/// link or boot time.
pub struct Region {
  base: NonNull<u8>,
  len: usize,
  brk: usize,
}

// SAFETY: a `Region` owns its range exclusively.
unsafe impl Send for Region {}

impl Region {
  pub fn new(memory: &'static mut [u8]) -> Self {
    let len = memory.len();
    Self {
      base: NonNull::from(memory).cast(),
      len,
      brk: 0,
    }
  }

  /// # Safety
  ///
  /// `[base, base + len)` must be valid, writable, and unused by anything else
  /// for as long as the region and any heap built on it live.
  pub const unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
    Self { base, len, brk: 0 }
  }

  /// Bytes handed out so far.
  pub fn used(&self) -> usize {
    self.brk
  }

  pub fn capacity(&self) -> usize {
    self.len
  }
}

unsafe impl MemorySource for Region {
  fn extend(&mut self, delta: isize) -> Option<NonNull<u8>> {
    let prev = self.brk;
    let next = prev.checked_add_signed(delta)?;
    if next > self.len {
      return None;
    }
    self.brk = next;
    // SAFETY: `prev <= len`, so the result stays inside (or one past) the range.
    Some(unsafe { self.base.add(prev) })
  }
}

// =============================================================================
// Host sources
// =============================================================================

#[cfg(unix)]
unsafe fn os_mmap(size: usize, flags: libc::c_int) -> Option<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      core::ptr::null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | flags,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    None
  } else {
    NonNull::new(ptr.cast())
  }
}

#[cfg(unix)]
unsafe fn os_munmap(addr: NonNull<u8>, size: usize) -> bool {
  unsafe { libc::munmap(addr.as_ptr().cast(), size) == 0 }
}

#[cfg(unix)]
fn os_page_size() -> usize {
  match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
    n if n > 0 => n as usize,
    _ => DEFAULT_PAGE_SIZE,
  }
}

/// A private anonymous reservation used as the arena, plus real page
/// mappings for large chunks. Gives every heap its own break, which keeps
/// independent heaps in one process apart.
#[cfg(unix)]
pub struct MappedRegion {
  region: Region,
  page_size: usize,
}

#[cfg(unix)]
unsafe impl Send for MappedRegion {}

#[cfg(unix)]
impl MappedRegion {
  /// Reserves `capacity` bytes of address space. Pages are committed lazily.
  pub fn new(capacity: usize) -> Option<Self> {
    let page_size = os_page_size();
    let capacity = crate::chunk::checked_align_up(capacity, page_size)?;
    let base = unsafe { os_mmap(capacity, libc::MAP_NORESERVE)? };
    log::debug!("reserved {capacity} bytes at {base:p}");
    Some(Self {
      // SAFETY: the reservation is ours until `drop`.
      region: unsafe { Region::from_raw_parts(base, capacity) },
      page_size,
    })
  }

  pub fn used(&self) -> usize {
    self.region.used()
  }
}

#[cfg(unix)]
unsafe impl MemorySource for MappedRegion {
  fn extend(&mut self, delta: isize) -> Option<NonNull<u8>> {
    self.region.extend(delta)
  }

  fn map_pages(&mut self, size: usize) -> Option<NonNull<u8>> {
    unsafe { os_mmap(size, 0) }
  }

  unsafe fn unmap_pages(&mut self, addr: NonNull<u8>, size: usize) -> bool {
    unsafe { os_munmap(addr, size) }
  }

  fn page_size(&self) -> usize {
    self.page_size
  }

  fn maps_zeroed(&self) -> bool {
    true
  }
}

#[cfg(unix)]
impl Drop for MappedRegion {
  fn drop(&mut self) {
    unsafe { os_munmap(self.region.base, self.region.len) };
  }
}

/// The process break via `sbrk`, with `mmap` for large chunks.
///
/// Only one heap should drive the break of a process. Anything else moving
/// it is detected as foreign growth and handled, at the cost of contiguity.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgramBreak;

#[cfg(unix)]
unsafe impl MemorySource for ProgramBreak {
  fn extend(&mut self, delta: isize) -> Option<NonNull<u8>> {
    let prev = unsafe { libc::sbrk(delta as libc::intptr_t) };
    if prev as isize == -1 {
      None
    } else {
      NonNull::new(prev.cast())
    }
  }

  fn map_pages(&mut self, size: usize) -> Option<NonNull<u8>> {
    unsafe { os_mmap(size, 0) }
  }

  unsafe fn unmap_pages(&mut self, addr: NonNull<u8>, size: usize) -> bool {
    unsafe { os_munmap(addr, size) }
  }

  fn page_size(&self) -> usize {
    os_page_size()
  }

  fn maps_zeroed(&self) -> bool {
    true
  }
}
