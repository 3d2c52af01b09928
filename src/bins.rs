//! Free lists: fastbins, the unsorted list, small and large bins, and the binmap.
//!
//! Regular bins are circular doubly linked lists headed by a sentinel. The
//! sentinel is not a fake chunk overlaid on the bin array: link words hold
//! either a chunk address or, for values below [`NBINS`], the index of a bin
//! head. That keeps [`Bins`] free of self-references, so a heap can be built
//! in a `const` and moved freely before and after initialization.

use crate::{
  chunk::{Chunk, MINSIZE, request2size},
  error::Corruption,
};

// =============================================================================
// Constants
// =============================================================================

pub const NBINS: usize = 128;
pub const NSMALLBINS: usize = 64;
const SMALLBIN_WIDTH: usize = 8;
pub const MIN_LARGE_SIZE: usize = NSMALLBINS * SMALLBIN_WIDTH;

/// Largest request `max_fast` may be set to.
pub const MAX_FAST_SIZE: usize = 80;
pub const NFASTBINS: usize = fastbin_index(request2size(MAX_FAST_SIZE)) + 1;

/// Bin 1 stages freed chunks until the next allocation sorts them.
pub const UNSORTED: usize = 1;

const BINMAP_SHIFT: usize = 5;
const BITS_PER_MAP: usize = 1 << BINMAP_SHIFT;
const BINMAP_SIZE: usize = NBINS / BITS_PER_MAP;

const _: () = assert!(NBINS % BITS_PER_MAP == 0);
const _: () = assert!(MINSIZE < MIN_LARGE_SIZE);

// =============================================================================
// Bin indexing
// =============================================================================

#[inline(always)]
pub const fn fastbin_index(size: usize) -> usize {
  (size >> 3) - 2
}

#[inline(always)]
pub const fn in_smallbin_range(size: usize) -> bool {
  size < MIN_LARGE_SIZE
}

#[inline(always)]
pub const fn smallbin_index(size: usize) -> usize {
  size >> 3
}

/// Four bins per power of two above `MIN_LARGE_SIZE`; everything past the
/// last range lands in the final bin.
#[inline]
pub const fn largebin_index(size: usize) -> usize {
  let x = size >> 8;
  if x >= 0x10000 {
    return NBINS - 1;
  }
  if x == 0 {
    return NSMALLBINS;
  }
  let m = (usize::BITS - 1 - x.leading_zeros()) as usize;
  NSMALLBINS + (m << 2) + ((size >> (m + 6)) & 3)
}

#[inline]
pub const fn bin_index(size: usize) -> usize {
  if in_smallbin_range(size) {
    smallbin_index(size)
  } else {
    largebin_index(size)
  }
}

// =============================================================================
// Links
// =============================================================================

/// One end of a doubly linked list edge: a bin sentinel or a free chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Node {
  Bin(usize),
  Chunk(Chunk),
}

impl Node {
  #[inline(always)]
  fn encode(self) -> usize {
    match self {
      Node::Bin(idx) => idx,
      Node::Chunk(chunk) => chunk.expose(),
    }
  }

  /// # Safety
  ///
  /// `word` must have been produced by [`Node::encode`].
  #[inline(always)]
  unsafe fn decode(word: usize) -> Self {
    if word < NBINS {
      Node::Bin(word)
    } else {
      Node::Chunk(unsafe { Chunk::from_exposed(word) })
    }
  }
}

#[derive(Clone, Copy)]
struct BinHead {
  fd: usize,
  bk: usize,
}

// =============================================================================
// Bins
// =============================================================================

pub(crate) struct Bins {
  heads: [BinHead; NBINS],
  binmap: [u32; BINMAP_SIZE],
  fastbins: [Option<Chunk>; NFASTBINS],
  /// Some fastbin may be non-empty.
  pub have_fastchunks: bool,
  /// Some chunk was released since init. Until then every request is served
  /// from top.
  pub have_anychunks: bool,
}

impl Bins {
  pub const fn new() -> Self {
    Self {
      heads: [BinHead { fd: 0, bk: 0 }; NBINS],
      binmap: [0; BINMAP_SIZE],
      fastbins: [None; NFASTBINS],
      have_fastchunks: false,
      have_anychunks: false,
    }
  }

  /// Links every sentinel to itself.
  pub fn init(&mut self) {
    for (idx, head) in self.heads.iter_mut().enumerate() {
      *head = BinHead { fd: idx, bk: idx };
    }
    self.binmap = [0; BINMAP_SIZE];
    self.fastbins = [None; NFASTBINS];
    self.have_fastchunks = false;
    self.have_anychunks = false;
  }

  // --- raw link access ------------------------------------------------------

  #[inline(always)]
  pub fn fd(&self, node: Node) -> Node {
    let word = match node {
      Node::Bin(idx) => self.heads[idx].fd,
      Node::Chunk(chunk) => chunk.fd(),
    };
    // SAFETY: link words are only written by `set_fd` / `set_bk`.
    unsafe { Node::decode(word) }
  }

  #[inline(always)]
  pub fn bk(&self, node: Node) -> Node {
    let word = match node {
      Node::Bin(idx) => self.heads[idx].bk,
      Node::Chunk(chunk) => chunk.bk(),
    };
    // SAFETY: as above.
    unsafe { Node::decode(word) }
  }

  #[inline(always)]
  fn set_fd(&mut self, node: Node, to: Node) {
    match node {
      Node::Bin(idx) => self.heads[idx].fd = to.encode(),
      Node::Chunk(chunk) => chunk.set_fd(to.encode()),
    }
  }

  #[inline(always)]
  fn set_bk(&mut self, node: Node, to: Node) {
    match node {
      Node::Bin(idx) => self.heads[idx].bk = to.encode(),
      Node::Chunk(chunk) => chunk.set_bk(to.encode()),
    }
  }

  // --- regular bins ---------------------------------------------------------

  /// Oldest (small bins) or smallest (large bins) chunk of a bin.
  #[inline]
  pub fn last(&self, idx: usize) -> Option<Chunk> {
    match self.bk(Node::Bin(idx)) {
      Node::Chunk(chunk) => Some(chunk),
      Node::Bin(_) => None,
    }
  }

  #[inline]
  pub fn is_empty(&self, idx: usize) -> bool {
    self.last(idx).is_none()
  }

  /// Removes `chunk` from whatever doubly linked list holds it.
  pub fn unlink(&mut self, chunk: Chunk) -> Result<(), Corruption> {
    let me = Node::Chunk(chunk);
    let fd = self.fd(me);
    let bk = self.bk(me);
    if self.bk(fd) != me || self.fd(bk) != me {
      return Err(Corruption::BadLinks);
    }
    self.set_bk(fd, bk);
    self.set_fd(bk, fd);
    Ok(())
  }

  /// Pushes onto the front of the unsorted list.
  pub fn push_unsorted(&mut self, chunk: Chunk) {
    let bck = Node::Bin(UNSORTED);
    let fwd = self.fd(bck);
    self.link_between(chunk, bck, fwd);
  }

  /// Files a free chunk into its small or large bin. Large bins stay sorted by
  /// decreasing size from the front, so `last` is always the smallest entry.
  pub fn place(&mut self, chunk: Chunk, size: usize) {
    let idx = bin_index(size);
    let mut bck = Node::Bin(idx);
    let mut fwd = self.fd(bck);

    if !in_smallbin_range(size)
      && let Some(smallest) = self.last(idx)
    {
      if size < smallest.size() {
        fwd = bck;
        bck = self.bk(bck);
      } else {
        while let Node::Chunk(c) = fwd
          && size < c.size()
        {
          fwd = self.fd(fwd);
        }
        bck = self.bk(fwd);
      }
    }

    self.mark(idx);
    self.link_between(chunk, bck, fwd);
  }

  #[inline(always)]
  fn link_between(&mut self, chunk: Chunk, bck: Node, fwd: Node) {
    let me = Node::Chunk(chunk);
    self.set_bk(me, bck);
    self.set_fd(me, fwd);
    self.set_bk(fwd, me);
    self.set_fd(bck, me);
  }

  /// Chunks of a bin from `last` towards the front.
  pub fn iter(&self, idx: usize) -> BinIter<'_> {
    BinIter {
      bins: self,
      next: self.bk(Node::Bin(idx)),
    }
  }

  // --- binmap ---------------------------------------------------------------

  #[inline(always)]
  pub fn mark(&mut self, idx: usize) {
    self.binmap[idx >> BINMAP_SHIFT] |= 1 << (idx & (BITS_PER_MAP - 1));
  }

  #[inline(always)]
  pub fn unmark(&mut self, idx: usize) {
    self.binmap[idx >> BINMAP_SHIFT] &= !(1 << (idx & (BITS_PER_MAP - 1)));
  }

  #[inline(always)]
  pub fn is_marked(&self, idx: usize) -> bool {
    self.binmap[idx >> BINMAP_SHIFT] & (1 << (idx & (BITS_PER_MAP - 1))) != 0
  }

  /// First marked bin at or above `idx`. Bits may be stale (bin emptied since);
  /// the caller clears them when it finds out.
  pub fn next_marked(&self, idx: usize) -> Option<usize> {
    if idx >= NBINS {
      return None;
    }
    let mut block = idx >> BINMAP_SHIFT;
    let mut map = self.binmap[block] & (u32::MAX << (idx & (BITS_PER_MAP - 1)));
    loop {
      if map != 0 {
        return Some((block << BINMAP_SHIFT) + map.trailing_zeros() as usize);
      }
      block += 1;
      if block >= BINMAP_SIZE {
        return None;
      }
      map = self.binmap[block];
    }
  }

  // --- fastbins -------------------------------------------------------------

  #[inline(always)]
  pub fn fast_head(&self, idx: usize) -> Option<Chunk> {
    self.fastbins[idx]
  }

  #[inline(always)]
  pub fn push_fast(&mut self, idx: usize, chunk: Chunk) {
    chunk.set_fd(self.fastbins[idx].map_or(0, Chunk::expose));
    self.fastbins[idx] = Some(chunk);
    self.have_fastchunks = true;
    self.have_anychunks = true;
  }

  #[inline(always)]
  pub fn pop_fast(&mut self, idx: usize) -> Option<Chunk> {
    let chunk = self.fastbins[idx]?;
    self.fastbins[idx] = fast_next(chunk);
    Some(chunk)
  }

  /// Detaches a whole fastbin.
  #[inline]
  pub fn take_fast(&mut self, idx: usize) -> Option<Chunk> {
    self.fastbins[idx].take()
  }

  pub fn iter_fast(&self, idx: usize) -> FastIter {
    FastIter {
      next: self.fastbins[idx],
    }
  }
}

#[inline(always)]
pub(crate) fn fast_next(chunk: Chunk) -> Option<Chunk> {
  match chunk.fd() {
    0 => None,
    // SAFETY: fastbin links are written by `push_fast` only.
    word => Some(unsafe { Chunk::from_exposed(word) }),
  }
}

pub(crate) struct BinIter<'a> {
  bins: &'a Bins,
  next: Node,
}

impl Iterator for BinIter<'_> {
  type Item = Chunk;

  fn next(&mut self) -> Option<Chunk> {
    match self.next {
      Node::Bin(_) => None,
      node @ Node::Chunk(chunk) => {
        self.next = self.bins.bk(node);
        Some(chunk)
      }
    }
  }
}

pub(crate) struct FastIter {
  next: Option<Chunk>,
}

impl Iterator for FastIter {
  type Item = Chunk;

  fn next(&mut self) -> Option<Chunk> {
    let chunk = self.next?;
    self.next = fast_next(chunk);
    Some(chunk)
  }
}

#[cfg(test)]
mod tests {
  use core::ptr::NonNull;

  use super::*;
  use crate::chunk::{MALLOC_ALIGNMENT, PREV_INUSE};

  #[test]
  fn bin_indices_are_monotonic_and_in_range() {
    let mut last = 0;
    let mut size = MINSIZE;
    while size < 1 << 26 {
      let idx = bin_index(size);
      assert!(idx >= 2 && idx < NBINS, "size {size} -> {idx}");
      assert!(idx >= last, "size {size} went back to bin {idx} from {last}");
      last = idx;
      size += MALLOC_ALIGNMENT;
    }
    assert_eq!(bin_index(usize::MAX & !15), NBINS - 1);
    assert_eq!(smallbin_index(MIN_LARGE_SIZE - MALLOC_ALIGNMENT), (MIN_LARGE_SIZE >> 3) - 2);
    assert!(largebin_index(MIN_LARGE_SIZE) >= NSMALLBINS);
  }

  #[test]
  fn fastbin_indices_cover_max_fast() {
    assert_eq!(fastbin_index(MINSIZE), (MINSIZE >> 3) - 2);
    assert!(fastbin_index(request2size(MAX_FAST_SIZE)) < NFASTBINS);
  }

  #[test]
  fn binmap_scan_skips_blocks() {
    let mut bins = Bins::new();
    bins.init();
    assert_eq!(bins.next_marked(0), None);

    bins.mark(5);
    bins.mark(70);
    bins.mark(127);
    assert_eq!(bins.next_marked(0), Some(5));
    assert_eq!(bins.next_marked(5), Some(5));
    assert_eq!(bins.next_marked(6), Some(70));
    assert_eq!(bins.next_marked(71), Some(127));
    assert_eq!(bins.next_marked(NBINS), None);

    bins.unmark(70);
    assert!(!bins.is_marked(70));
    assert_eq!(bins.next_marked(6), Some(127));
  }

  /// Carves `sizes` chunks out of `buf` back to back.
  fn carve(buf: &mut [u128], sizes: &[usize]) -> Vec<Chunk> {
    let mut at = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
    sizes
      .iter()
      .map(|&size| {
        let chunk = unsafe { Chunk::new(at) };
        chunk.set_head(size | PREV_INUSE);
        at = NonNull::new(chunk.plus(size).as_ptr()).unwrap();
        chunk
      })
      .collect()
  }

  #[test]
  fn large_bins_stay_sorted_and_unlink_checks_links() {
    let mut buf = vec![0u128; 1024];
    let sizes = [1024, 1152, 1088, 1024, 1216];
    let chunks = carve(&mut buf, &sizes);

    let mut bins = Bins::new();
    bins.init();
    for (&chunk, &size) in chunks.iter().zip(&sizes) {
      bins.place(chunk, size);
    }

    let idx = bin_index(1024);
    assert!(bins.is_marked(idx));
    let walked: Vec<usize> = bins.iter(idx).map(Chunk::size).collect();
    let mut sorted = walked.clone();
    sorted.sort_unstable();
    assert_eq!(walked, sorted, "smallest first from the back");

    let smallest = bins.last(idx).unwrap();
    assert_eq!(bins.unlink(smallest), Ok(()));
    assert_eq!(bins.iter(idx).count(), sizes.len() - 1);

    // A chunk whose neighbours no longer point back at it is refused.
    let victim = bins.last(idx).unwrap();
    victim.set_fd(UNSORTED);
    assert_eq!(bins.unlink(victim), Err(Corruption::BadLinks));
  }

  #[test]
  fn fastbins_are_lifo() {
    let mut buf = vec![0u128; 64];
    let chunks = carve(&mut buf, &[MINSIZE, MINSIZE, MINSIZE]);
    let mut bins = Bins::new();
    bins.init();
    let idx = fastbin_index(MINSIZE);
    for &chunk in &chunks {
      bins.push_fast(idx, chunk);
    }
    assert!(bins.have_fastchunks);
    assert_eq!(bins.iter_fast(idx).count(), 3);
    assert_eq!(bins.pop_fast(idx), Some(chunks[2]));
    assert_eq!(bins.pop_fast(idx), Some(chunks[1]));
    assert_eq!(bins.take_fast(idx), Some(chunks[0]));
    assert_eq!(bins.pop_fast(idx), None);
  }
}
