//! Chunk layout and the `Chunk` view over raw heap memory.
//!
//! ```text
//!   chunk -> +-------------------------------+
//!            | prev_size (if previous free)  |
//!            +-------------------------------+
//!            | size                    |M|P|  M = IS_MMAPPED, P = PREV_INUSE
//!   mem   -> +-------------------------------+
//!            | fd (free only)                |
//!            +-------------------------------+
//!            | bk (free only)                |
//!            +-------------------------------+
//!            | ...payload...                 |
//!   next  -> +-------------------------------+
//!            | prev_size = size (footer)     |  only meaningful while free
//!            +-------------------------------+
//! ```
//!
//! Every pointer computation the allocator performs goes through this module.

use core::{
  mem::size_of,
  ptr::{self, NonNull},
};

// =============================================================================
// Constants
// =============================================================================

/// Width of one header word.
pub const SIZE_SZ: usize = size_of::<usize>();

/// Alignment of every pointer handed out by the heap.
pub const MALLOC_ALIGNMENT: usize = 2 * SIZE_SZ;
pub(crate) const MALLOC_ALIGN_MASK: usize = MALLOC_ALIGNMENT - 1;

/// Smallest chunk: header plus room for the two free-list links.
pub const MINSIZE: usize = (4 * SIZE_SZ + MALLOC_ALIGN_MASK) & !MALLOC_ALIGN_MASK;

/// Offset of the payload from the start of a chunk.
pub(crate) const MEM_OFFSET: usize = 2 * SIZE_SZ;

/// Previous physical chunk is in use.
pub(crate) const PREV_INUSE: usize = 0x1;
/// Chunk was obtained from a direct page mapping.
pub(crate) const IS_MMAPPED: usize = 0x2;
const SIZE_BITS: usize = PREV_INUSE | IS_MMAPPED;

/// Requests at or above this size are rejected before padding could wrap.
const MAX_REQUEST: usize = (isize::MAX as usize) - 2 * MINSIZE;

const _: () = assert!(MALLOC_ALIGNMENT.is_power_of_two());
const _: () = assert!(MINSIZE % MALLOC_ALIGNMENT == 0);
const _: () = assert!(SIZE_BITS < MALLOC_ALIGNMENT);

// =============================================================================
// Size math
// =============================================================================

/// Pads a request to a usable chunk size. Callers must have range-checked `req`.
#[inline(always)]
pub(crate) const fn request2size(req: usize) -> usize {
  if req + SIZE_SZ + MALLOC_ALIGN_MASK < MINSIZE {
    MINSIZE
  } else {
    (req + SIZE_SZ + MALLOC_ALIGN_MASK) & !MALLOC_ALIGN_MASK
  }
}

/// Like [`request2size`], but `None` for requests whose padding would wrap.
#[inline(always)]
pub(crate) const fn checked_request2size(req: usize) -> Option<usize> {
  if req >= MAX_REQUEST {
    None
  } else {
    Some(request2size(req))
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Checked variant of [`align_up`].
#[inline(always)]
pub(crate) const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
  match x.checked_add(align - 1) {
    Some(v) => Some(v & !(align - 1)),
    None => None,
  }
}

// =============================================================================
// Chunk view
// =============================================================================

/// Typed handle on a chunk header living inside heap-owned memory.
///
/// A `Chunk` is only ever created for memory the heap obtained from its
/// [`crate::MemorySource`], which is why the accessors are safe: the
/// invariant is established once, by the `unsafe` constructors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Chunk(NonNull<u8>);

impl Chunk {
  /// # Safety
  ///
  /// `ptr` must point at a chunk header inside heap-owned memory with at least
  /// `MINSIZE` readable and writable bytes (or `2 * SIZE_SZ` for fenceposts).
  #[inline(always)]
  pub const unsafe fn new(ptr: NonNull<u8>) -> Self {
    Self(ptr)
  }

  /// Rebuilds a chunk from a link word written by [`Chunk::expose`].
  ///
  /// # Safety
  ///
  /// `addr` must come from `expose` on a live chunk.
  #[inline(always)]
  pub unsafe fn from_exposed(addr: usize) -> Self {
    Self(unsafe { NonNull::new_unchecked(ptr::with_exposed_provenance_mut(addr)) })
  }

  /// # Safety
  ///
  /// `mem` must be a payload pointer previously produced by [`Chunk::mem`].
  #[inline(always)]
  pub unsafe fn from_mem(mem: NonNull<u8>) -> Self {
    Self(unsafe { NonNull::new_unchecked(mem.as_ptr().wrapping_sub(MEM_OFFSET)) })
  }

  #[inline(always)]
  pub fn addr(self) -> usize {
    self.0.as_ptr().addr()
  }

  /// Address suitable for storing in a link word.
  #[inline(always)]
  pub fn expose(self) -> usize {
    self.0.as_ptr().expose_provenance()
  }

  #[inline(always)]
  pub fn as_ptr(self) -> *mut u8 {
    self.0.as_ptr()
  }

  /// Payload pointer handed to callers.
  #[inline(always)]
  pub fn mem(self) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(self.0.as_ptr().wrapping_add(MEM_OFFSET)) }
  }

  #[inline(always)]
  fn word(self, offset: usize) -> *mut usize {
    self.0.as_ptr().wrapping_add(offset).cast()
  }

  #[inline(always)]
  fn read(self, offset: usize) -> usize {
    unsafe { self.word(offset).read() }
  }

  #[inline(always)]
  fn write(self, offset: usize, value: usize) {
    unsafe { self.word(offset).write(value) }
  }

  // --- header fields --------------------------------------------------------

  /// Raw size word including flag bits.
  #[inline(always)]
  pub fn head(self) -> usize {
    self.read(SIZE_SZ)
  }

  #[inline(always)]
  pub fn set_head(self, head: usize) {
    self.write(SIZE_SZ, head)
  }

  /// Replaces the size, keeping `PREV_INUSE`.
  #[inline(always)]
  pub fn set_head_size(self, size: usize) {
    self.set_head((self.head() & PREV_INUSE) | size)
  }

  #[inline(always)]
  pub fn size(self) -> usize {
    self.head() & !SIZE_BITS
  }

  #[inline(always)]
  pub fn prev_inuse(self) -> bool {
    self.head() & PREV_INUSE != 0
  }

  #[inline(always)]
  pub fn is_mmapped(self) -> bool {
    self.head() & IS_MMAPPED != 0
  }

  #[inline(always)]
  pub fn prev_size(self) -> usize {
    self.read(0)
  }

  #[inline(always)]
  pub fn set_prev_size(self, size: usize) {
    self.write(0, size)
  }

  // --- free-list links --------------------------------------------------------
  // `fd` is the next pointer of a fastbin stack or the forward link of a
  // doubly linked bin; which one depends on the list currently holding the chunk.

  #[inline(always)]
  pub fn fd(self) -> usize {
    self.read(2 * SIZE_SZ)
  }

  #[inline(always)]
  pub fn set_fd(self, link: usize) {
    self.write(2 * SIZE_SZ, link)
  }

  #[inline(always)]
  pub fn bk(self) -> usize {
    self.read(3 * SIZE_SZ)
  }

  #[inline(always)]
  pub fn set_bk(self, link: usize) {
    self.write(3 * SIZE_SZ, link)
  }

  // --- neighbours -----------------------------------------------------------

  #[inline(always)]
  pub fn plus(self, offset: usize) -> Chunk {
    Chunk(unsafe { NonNull::new_unchecked(self.0.as_ptr().wrapping_add(offset)) })
  }

  #[inline(always)]
  pub fn minus(self, offset: usize) -> Chunk {
    Chunk(unsafe { NonNull::new_unchecked(self.0.as_ptr().wrapping_sub(offset)) })
  }

  /// Physically following chunk.
  #[inline(always)]
  pub fn next(self) -> Chunk {
    self.plus(self.size())
  }

  /// Physically preceding chunk. Only valid while `!self.prev_inuse()`.
  #[inline(always)]
  pub fn prev(self) -> Chunk {
    self.minus(self.prev_size())
  }

  /// In-use state lives in the next chunk's `PREV_INUSE` bit.
  #[inline(always)]
  pub fn inuse(self) -> bool {
    self.next().prev_inuse()
  }

  #[inline(always)]
  pub fn inuse_bit_at(self, offset: usize) -> bool {
    self.plus(offset).prev_inuse()
  }

  #[inline(always)]
  pub fn set_inuse_bit_at(self, offset: usize) {
    let next = self.plus(offset);
    next.set_head(next.head() | PREV_INUSE);
  }

  /// Writes the boundary tag of a free chunk of `size` bytes.
  #[inline(always)]
  pub fn set_foot(self, size: usize) {
    self.plus(size).set_prev_size(size)
  }

  /// Zeroes `len` payload bytes.
  #[inline]
  pub fn zero_payload(self, len: usize) {
    unsafe { ptr::write_bytes(self.mem().as_ptr(), 0, len) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn request_sizes_are_aligned_and_bounded() {
    for req in 0..4096 {
      let nb = request2size(req);
      assert_eq!(nb % MALLOC_ALIGNMENT, 0);
      assert!(nb >= MINSIZE);
      // Payload capacity of an in-use chunk is its size minus one header word.
      assert!(nb - SIZE_SZ >= req, "req {req} -> {nb}");
      assert!(nb == MINSIZE || nb - SIZE_SZ < req + MALLOC_ALIGNMENT);
    }
  }

  #[test]
  fn oversized_requests_are_rejected() {
    assert_eq!(checked_request2size(usize::MAX), None);
    assert_eq!(checked_request2size(usize::MAX - SIZE_SZ), None);
    assert_eq!(checked_request2size(MAX_REQUEST), None);
    assert!(checked_request2size(MAX_REQUEST - 1).is_some());
  }

  #[test]
  fn header_flags_and_neighbours() {
    let mut buf = [0usize; 32];
    let base = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
    let a = unsafe { Chunk::new(base) };
    let size = 4 * MALLOC_ALIGNMENT;

    a.set_head(size | PREV_INUSE);
    assert_eq!(a.size(), size);
    assert!(a.prev_inuse());
    assert!(!a.is_mmapped());

    let b = a.next();
    assert_eq!(b.addr(), a.addr() + size);
    b.set_head(MINSIZE);
    assert!(!a.inuse());
    a.set_inuse_bit_at(size);
    assert!(a.inuse());
    assert_eq!(b.size(), MINSIZE);

    a.set_foot(size);
    assert_eq!(b.prev_size(), size);
    assert_eq!(b.prev(), a);

    a.set_head_size(2 * MALLOC_ALIGNMENT);
    assert_eq!(a.size(), 2 * MALLOC_ALIGNMENT);
    assert!(a.prev_inuse());

    assert_eq!(unsafe { Chunk::from_mem(a.mem()) }, a);
    assert_eq!(unsafe { Chunk::from_exposed(a.expose()) }, a);
  }
}
