//! Deallocation engine and fastbin consolidation.

use crate::{
  bins::{NFASTBINS, fast_next, fastbin_index},
  chunk::{Chunk, MALLOC_ALIGN_MASK, MINSIZE, PREV_INUSE, SIZE_SZ},
  error::{Corruption, HeapError, corrupted},
  heap::Heap,
  source::MemorySource,
};

impl<S: MemorySource> Heap<S> {
  /// Returns a block to the heap. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer obtained from this heap.
  pub unsafe fn release(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
    let Some(mem) = core::ptr::NonNull::new(ptr) else {
      return Ok(());
    };
    if !self.is_initialized() {
      return Err(corrupted(Corruption::ForeignPointer));
    }
    let result = self.free_chunk(unsafe { Chunk::from_mem(mem) });
    self.tripwire();
    result
  }

  /// Header checks shared by `release` and `reallocate`.
  pub(crate) fn check_inuse(&self, p: Chunk) -> Result<(), HeapError> {
    if p.addr() & MALLOC_ALIGN_MASK != 0 {
      return Err(corrupted(Corruption::Misaligned));
    }
    let size = p.size();
    if size < MINSIZE || size & MALLOC_ALIGN_MASK != 0 || p.addr() > usize::MAX - size {
      return Err(corrupted(Corruption::BadSize));
    }
    if p.is_mmapped() {
      return Ok(());
    }
    if Some(p) == self.top {
      return Err(corrupted(Corruption::DoubleFree));
    }
    let next = p.next();
    if self.contiguous
      && let Some(top) = self.top
      && next.addr() > top.addr() + top.size()
    {
      return Err(corrupted(Corruption::ForeignPointer));
    }
    if next.size() < 2 * SIZE_SZ {
      return Err(corrupted(Corruption::BadSize));
    }
    if !next.prev_inuse() {
      return Err(corrupted(Corruption::DoubleFree));
    }
    Ok(())
  }

  pub(crate) fn free_chunk(&mut self, p: Chunk) -> Result<(), HeapError> {
    self.check_inuse(p)?;
    if p.is_mmapped() {
      return self.unmap_chunk(p);
    }

    let size = p.size();
    if size <= self.max_fast && !(self.tunables.trim_fastbins && Some(p.plus(size)) == self.top) {
      let idx = fastbin_index(size);
      if self.bins.fast_head(idx) == Some(p) {
        return Err(corrupted(Corruption::DoubleFree));
      }
      self.bins.push_fast(idx, p);
      return Ok(());
    }

    self.bins.have_anychunks = true;
    let size = self.coalesce(p, size)?;

    if size >= self.tunables.consolidation_threshold {
      if self.bins.have_fastchunks {
        self.consolidate()?;
      }
      if self.top_size() >= self.tunables.trim_threshold {
        self.sys_trim(self.tunables.top_pad);
      }
    }
    Ok(())
  }

  /// Merges a chunk about to become free with its free neighbours, then files
  /// the result on the unsorted list or folds it into top. Returns the merged
  /// size.
  fn coalesce(&mut self, mut p: Chunk, mut size: usize) -> Result<usize, HeapError> {
    let next = p.plus(size);
    let next_size = next.size();

    if !p.prev_inuse() {
      let prev_size = p.prev_size();
      let prev = p.prev();
      if prev.size() != prev_size {
        return Err(corrupted(Corruption::PrevSizeMismatch));
      }
      self.bins.unlink(prev).map_err(corrupted)?;
      size += prev_size;
      p = prev;
    }

    if Some(next) == self.top {
      size += next_size;
      p.set_head(size | PREV_INUSE);
      self.top = Some(p);
      return Ok(size);
    }

    if next.inuse_bit_at(next_size) {
      next.set_head(next.head() & !PREV_INUSE);
    } else {
      self.bins.unlink(next).map_err(corrupted)?;
      size += next_size;
    }

    self.bins.push_unsorted(p);
    p.set_head(size | PREV_INUSE);
    p.set_foot(size);
    Ok(size)
  }

  /// Empties every fastbin through the regular merge path.
  pub(crate) fn consolidate(&mut self) -> Result<(), HeapError> {
    self.bins.have_fastchunks = false;
    for idx in 0..NFASTBINS {
      let mut next = self.bins.take_fast(idx);
      while let Some(p) = next {
        next = fast_next(p);
        self.coalesce(p, p.size())?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    Corruption, HeapError,
    bins::{UNSORTED, fastbin_index},
    chunk::Chunk,
    heap::tests::heap,
  };

  #[test]
  fn release_null_is_a_no_op() {
    let mut h = heap(1 << 20);
    assert_eq!(unsafe { h.release(core::ptr::null_mut()) }, Ok(()));
  }

  #[test]
  fn neighbours_merge_into_one_unsorted_chunk() {
    let mut h = heap(1 << 20);
    let a = h.allocate(200).unwrap();
    let b = h.allocate(200).unwrap();
    let c = h.allocate(200).unwrap();
    let _d = h.allocate(200).unwrap();
    let chunk = unsafe { Chunk::from_mem(a) };
    let size = chunk.size();

    unsafe {
      h.release(a.as_ptr()).unwrap();
      h.release(c.as_ptr()).unwrap();
      h.release(b.as_ptr()).unwrap();
    }

    let merged: Vec<Chunk> = h.bins.iter(UNSORTED).collect();
    assert_eq!(merged, vec![chunk]);
    assert_eq!(chunk.size(), 3 * size);
    assert_eq!(chunk.next().prev_size(), 3 * size);
  }

  #[test]
  fn chunk_next_to_top_is_absorbed() {
    let mut h = heap(1 << 20);
    let a = h.allocate(500).unwrap();
    let top = h.top_size();
    unsafe { h.release(a.as_ptr()).unwrap() };
    assert_eq!(h.top, Some(unsafe { Chunk::from_mem(a) }));
    assert!(h.top_size() > top);
    assert!(h.bins.is_empty(UNSORTED));
  }

  #[test]
  fn consolidate_empties_fastbins() {
    let mut h = heap(1 << 20);
    let ptrs: Vec<_> = (0..4).map(|_| h.allocate(24).unwrap()).collect();
    let _guard = h.allocate(24).unwrap();
    for p in &ptrs {
      unsafe { h.release(p.as_ptr()).unwrap() };
    }
    let idx = fastbin_index(unsafe { Chunk::from_mem(ptrs[0]) }.size());
    assert_eq!(h.bins.iter_fast(idx).count(), 4);

    h.consolidate().unwrap();
    assert!(!h.bins.have_fastchunks);
    assert_eq!(h.bins.iter_fast(idx).count(), 0);
    assert_eq!(h.bins.iter(UNSORTED).count(), 1);
    h.consolidate().unwrap();
    assert_eq!(h.bins.iter(UNSORTED).count(), 1);
  }

  #[cfg(not(feature = "debug-tripwire"))]
  #[test]
  fn double_free_is_detected() {
    let mut h = heap(1 << 20);
    let fast = h.allocate(16).unwrap();
    let slow = h.allocate(300).unwrap();
    let _guard = h.allocate(16).unwrap();
    unsafe {
      h.release(fast.as_ptr()).unwrap();
      h.release(slow.as_ptr()).unwrap();
      assert_eq!(
        h.release(fast.as_ptr()),
        Err(HeapError::CorruptionDetected(Corruption::DoubleFree))
      );
      assert_eq!(
        h.release(slow.as_ptr()),
        Err(HeapError::CorruptionDetected(Corruption::DoubleFree))
      );
    }
  }

  #[cfg(not(feature = "debug-tripwire"))]
  #[test]
  fn misaligned_pointer_is_rejected() {
    let mut h = heap(1 << 20);
    let p = h.allocate(64).unwrap();
    assert_eq!(
      unsafe { h.release(p.as_ptr().add(8)) },
      Err(HeapError::CorruptionDetected(Corruption::Misaligned))
    );
  }
}
