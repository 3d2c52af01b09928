//! Operations built on top of allocate and release.

use core::{
  mem::size_of,
  ptr::{self, NonNull},
};

use log::{debug, info};

use crate::{
  bins::{NBINS, NFASTBINS},
  chunk::{
    Chunk, IS_MMAPPED, MALLOC_ALIGNMENT, MEM_OFFSET, MINSIZE, PREV_INUSE, SIZE_SZ, align_up,
    checked_align_up, checked_request2size, request2size,
  },
  config::Param,
  error::{HeapError, corrupted},
  heap::Heap,
  source::MemorySource,
  stats::Statistics,
};

/// Element sizes of a batch allocation.
#[derive(Clone, Copy)]
enum ElementSizes<'a> {
  Same(usize),
  Each(&'a [usize]),
}

impl<S: MemorySource> Heap<S> {
  // ===========================================================================
  // Reallocation
  // ===========================================================================

  /// Resizes a block, moving it only when it cannot grow in place. Null
  /// behaves as [`Heap::allocate`]. On failure the old block is untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer obtained from this heap. After a
  /// successful call only the returned pointer is valid.
  pub unsafe fn reallocate(&mut self, ptr: *mut u8, bytes: usize) -> Result<NonNull<u8>, HeapError> {
    let Some(mem) = NonNull::new(ptr) else {
      return self.allocate(bytes);
    };
    let nb = checked_request2size(bytes).ok_or(HeapError::InvalidSize)?;
    let oldp = unsafe { Chunk::from_mem(mem) };
    self.check_inuse(oldp)?;

    let result = if oldp.is_mmapped() {
      self.realloc_mapped(oldp, nb)
    } else {
      self.realloc_chunk(oldp, nb)
    };
    self.tripwire();
    result.map(Chunk::mem)
  }

  fn realloc_chunk(&mut self, oldp: Chunk, nb: usize) -> Result<Chunk, HeapError> {
    let oldsize = oldp.size();

    let (newp, newsize) = if oldsize >= nb {
      (oldp, oldsize)
    } else {
      let next = oldp.plus(oldsize);
      let top = self.top;

      if Some(next) == top && oldsize + next.size() >= nb + MINSIZE {
        let newsize = oldsize + next.size();
        oldp.set_head_size(nb);
        let top = oldp.plus(nb);
        top.set_head((newsize - nb) | PREV_INUSE);
        self.top = Some(top);
        return Ok(oldp);
      }

      if Some(next) != top && !next.inuse() && oldsize + next.size() >= nb {
        self.bins.unlink(next).map_err(corrupted)?;
        (oldp, oldsize + next.size())
      } else {
        let newp = self.malloc_chunk(nb)?;
        if newp == next {
          // Got the neighbour; no copy needed.
          (oldp, oldsize + newp.size())
        } else {
          unsafe {
            ptr::copy_nonoverlapping(oldp.mem().as_ptr(), newp.mem().as_ptr(), oldsize - SIZE_SZ)
          };
          self.free_chunk(oldp)?;
          return Ok(newp);
        }
      }
    };

    let remainder_size = newsize - nb;
    if remainder_size < MINSIZE {
      newp.set_head_size(newsize);
      newp.set_inuse_bit_at(newsize);
    } else {
      let remainder = newp.plus(nb);
      newp.set_head_size(nb);
      remainder.set_head(remainder_size | PREV_INUSE);
      remainder.set_inuse_bit_at(remainder_size);
      self.free_chunk(remainder)?;
    }
    Ok(newp)
  }

  fn realloc_mapped(&mut self, oldp: Chunk, nb: usize) -> Result<Chunk, HeapError> {
    let oldsize = oldp.size();
    if oldsize >= nb + SIZE_SZ {
      return Ok(oldp);
    }
    let newp = self.malloc_chunk(nb)?;
    unsafe {
      ptr::copy_nonoverlapping(oldp.mem().as_ptr(), newp.mem().as_ptr(), oldsize - 2 * SIZE_SZ)
    };
    self.free_chunk(oldp)?;
    Ok(newp)
  }

  // ===========================================================================
  // Zeroed and aligned allocation
  // ===========================================================================

  /// Allocates `n * elem_size` zeroed bytes.
  pub fn allocate_zeroed(&mut self, n: usize, elem_size: usize) -> Result<NonNull<u8>, HeapError> {
    let bytes = n.checked_mul(elem_size).ok_or(HeapError::InvalidSize)?;
    let nb = checked_request2size(bytes).ok_or(HeapError::InvalidSize)?;
    let p = self.malloc_chunk(nb)?;

    if !p.is_mmapped() {
      p.zero_payload(p.size() - SIZE_SZ);
    } else if !self.source.maps_zeroed() {
      p.zero_payload(p.size() - 2 * SIZE_SZ);
    }
    self.tripwire();
    Ok(p.mem())
  }

  /// Allocates `bytes` at an address that is a multiple of `align`.
  /// Alignments that are not powers of two are rounded up to one.
  pub fn allocate_aligned(&mut self, align: usize, bytes: usize) -> Result<NonNull<u8>, HeapError> {
    let p = self.memalign_chunk(align, bytes);
    self.tripwire();
    p.map(Chunk::mem)
  }

  /// Allocates `bytes` on a page boundary.
  pub fn allocate_page_aligned(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
    self.ensure_init();
    let page = self.source.page_size();
    self.allocate_aligned(page, bytes)
  }

  /// Like [`Heap::allocate_page_aligned`], with the size rounded up to whole pages.
  pub fn allocate_page_rounded(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
    self.ensure_init();
    let page = self.source.page_size();
    let bytes = checked_align_up(bytes, page).ok_or(HeapError::InvalidSize)?;
    self.allocate_aligned(page, bytes)
  }

  fn memalign_chunk(&mut self, align: usize, bytes: usize) -> Result<Chunk, HeapError> {
    let nb = checked_request2size(bytes).ok_or(HeapError::InvalidSize)?;
    if align <= MALLOC_ALIGNMENT {
      return self.malloc_chunk(nb);
    }
    let align = align
      .max(MINSIZE)
      .checked_next_power_of_two()
      .ok_or(HeapError::InvalidSize)?;

    // Worst case padding to reach an aligned spot with room for a lead chunk.
    let padded = nb
      .checked_add(align)
      .and_then(|n| n.checked_add(MINSIZE))
      .and_then(checked_request2size)
      .ok_or(HeapError::InvalidSize)?;
    let mut p = self.malloc_chunk(padded)?;

    let mem = p.mem().as_ptr().addr();
    if mem % align != 0 {
      let mut lead = align_up(mem, align) - MEM_OFFSET - p.addr();
      if lead < MINSIZE {
        lead += align;
      }
      let newp = p.plus(lead);
      let newsize = p.size() - lead;

      if p.is_mmapped() {
        newp.set_prev_size(p.prev_size() + lead);
        newp.set_head(newsize | IS_MMAPPED);
        return Ok(newp);
      }

      newp.set_head(newsize | PREV_INUSE);
      newp.set_inuse_bit_at(newsize);
      p.set_head_size(lead);
      self.free_chunk(p)?;
      p = newp;
    }

    if !p.is_mmapped() {
      let size = p.size();
      if size > nb + MINSIZE {
        let remainder = p.plus(nb);
        remainder.set_head((size - nb) | PREV_INUSE);
        p.set_head_size(nb);
        self.free_chunk(remainder)?;
      }
    }
    Ok(p)
  }

  // ===========================================================================
  // Batch allocation
  // ===========================================================================

  /// Fills `out` with zeroed blocks of `elem_size` bytes carved from one
  /// chunk. Each block can be released on its own.
  pub fn allocate_batch_same_size(
    &mut self,
    elem_size: usize,
    out: &mut [*mut u8],
  ) -> Result<(), HeapError> {
    if out.is_empty() {
      return Ok(());
    }
    let result = unsafe {
      self.independent_alloc(out.len(), ElementSizes::Same(elem_size), true, out.as_mut_ptr())
    };
    self.tripwire();
    result.map(drop)
  }

  /// Fills `out` with one block per entry of `sizes`, carved from one chunk.
  pub fn allocate_batch_mixed_sizes(
    &mut self,
    sizes: &[usize],
    out: &mut [*mut u8],
  ) -> Result<(), HeapError> {
    if sizes.len() != out.len() {
      return Err(HeapError::InvalidSize);
    }
    if out.is_empty() {
      return Ok(());
    }
    let result = unsafe {
      self.independent_alloc(sizes.len(), ElementSizes::Each(sizes), false, out.as_mut_ptr())
    };
    self.tripwire();
    result.map(drop)
  }

  /// `n` zeroed blocks of `elem_size` bytes. With a null `chunks` the pointer
  /// array is carved from the end of the same chunk and must be released
  /// separately.
  ///
  /// # Safety
  ///
  /// `chunks` must be null or valid for `n` pointer writes.
  pub unsafe fn independent_calloc(
    &mut self,
    n: usize,
    elem_size: usize,
    chunks: *mut *mut u8,
  ) -> Result<NonNull<*mut u8>, HeapError> {
    let result = unsafe { self.independent_alloc(n, ElementSizes::Same(elem_size), true, chunks) };
    self.tripwire();
    result
  }

  /// One block per entry of `sizes`, laid out like [`Heap::independent_calloc`]
  /// but not zeroed.
  ///
  /// # Safety
  ///
  /// `chunks` must be null or valid for `sizes.len()` pointer writes.
  pub unsafe fn independent_comalloc(
    &mut self,
    sizes: &[usize],
    chunks: *mut *mut u8,
  ) -> Result<NonNull<*mut u8>, HeapError> {
    let result =
      unsafe { self.independent_alloc(sizes.len(), ElementSizes::Each(sizes), false, chunks) };
    self.tripwire();
    result
  }

  unsafe fn independent_alloc(
    &mut self,
    n: usize,
    sizes: ElementSizes<'_>,
    clear: bool,
    chunks: *mut *mut u8,
  ) -> Result<NonNull<*mut u8>, HeapError> {
    self.ensure_init();

    let array_size = match NonNull::new(chunks) {
      Some(chunks) if n == 0 => return Ok(chunks),
      Some(_) => 0,
      // An empty request still yields a releasable (empty) array.
      None if n == 0 => return self.malloc_chunk(MINSIZE).map(|p| p.mem().cast()),
      None => n
        .checked_mul(size_of::<*mut u8>())
        .and_then(checked_request2size)
        .ok_or(HeapError::InvalidSize)?,
    };

    let (element_size, contents_size) = match sizes {
      ElementSizes::Same(size) => {
        let element = checked_request2size(size).ok_or(HeapError::InvalidSize)?;
        (element, n.checked_mul(element).ok_or(HeapError::InvalidSize)?)
      }
      ElementSizes::Each(list) => {
        let total = list.iter().try_fold(0usize, |acc, &size| {
          acc.checked_add(checked_request2size(size)?)
        });
        (0, total.ok_or(HeapError::InvalidSize)?)
      }
    };
    let total = contents_size
      .checked_add(array_size)
      .ok_or(HeapError::InvalidSize)?;

    // Sub-chunks of a page mapping could not be released one by one.
    let mmap_max = self.tunables.mmap_max;
    self.tunables.mmap_max = 0;
    let p = self.malloc_chunk(total);
    self.tunables.mmap_max = mmap_max;
    let mut p = p?;

    let mut remainder_size = p.size();
    if clear {
      p.zero_payload(remainder_size - SIZE_SZ - array_size);
    }

    let marray: *mut *mut u8 = if chunks.is_null() {
      let array_chunk = p.plus(contents_size);
      array_chunk.set_head((remainder_size - contents_size) | PREV_INUSE);
      remainder_size = contents_size;
      array_chunk.mem().as_ptr().cast()
    } else {
      chunks
    };

    for i in 0..n {
      unsafe { marray.add(i).write(p.mem().as_ptr()) };
      if i + 1 == n {
        // The last element absorbs any slop.
        p.set_head(remainder_size | PREV_INUSE);
        break;
      }
      let size = match sizes {
        ElementSizes::Same(_) => element_size,
        ElementSizes::Each(list) => request2size(list[i]),
      };
      remainder_size -= size;
      p.set_head(size | PREV_INUSE);
      p = p.plus(size);
    }

    // SAFETY: `marray` is either the caller's non-null array or chunk memory.
    Ok(unsafe { NonNull::new_unchecked(marray) })
  }

  // ===========================================================================
  // Queries and maintenance
  // ===========================================================================

  /// Bytes actually usable behind `ptr`; `0` for null or a free chunk.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a pointer obtained from this heap.
  pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
    let Some(mem) = NonNull::new(ptr.cast_mut()) else {
      return 0;
    };
    let p = unsafe { Chunk::from_mem(mem) };
    if p.is_mmapped() {
      p.size() - 2 * SIZE_SZ
    } else if p.inuse() {
      p.size() - SIZE_SZ
    } else {
      0
    }
  }

  /// Consolidates, then returns unused pages above `pad` bytes of top to the
  /// memory source. Returns the number of bytes released.
  pub fn trim(&mut self, pad: usize) -> Result<usize, HeapError> {
    self.ensure_init();
    self.consolidate()?;
    let released = self.sys_trim(pad);
    self.tripwire();
    Ok(released)
  }

  /// Changes one tunable. Rejected values leave the heap unchanged.
  pub fn set_option(&mut self, param: Param, value: usize) -> Result<(), HeapError> {
    self.ensure_init();
    // Fastbins must be empty before their ceiling can move.
    self.consolidate()?;
    self.tunables.apply(param, value).inspect_err(|err| debug!("{err}"))?;
    self.max_fast = self.tunables.fast_chunk_limit();
    debug!("{param:?} set to {value}");
    Ok(())
  }

  /// Walks the free lists and reports usage.
  pub fn statistics(&self) -> Statistics {
    let top_bytes = self.top_size();
    let mut free_chunks = usize::from(self.top.is_some());
    let mut free_bytes = top_bytes;

    let mut fastbin_chunks = 0;
    let mut fastbin_bytes = 0;
    for idx in 0..NFASTBINS {
      for p in self.bins.iter_fast(idx) {
        fastbin_chunks += 1;
        fastbin_bytes += p.size();
      }
    }
    free_bytes += fastbin_bytes;

    for idx in 1..NBINS {
      for p in self.bins.iter(idx) {
        free_chunks += 1;
        free_bytes += p.size();
      }
    }

    let c = &self.counters;
    Statistics {
      system_bytes: c.sbrked_mem,
      free_chunks,
      fastbin_chunks,
      mapped_regions: c.n_mmaps,
      mapped_bytes: c.mmapped_mem,
      peak_bytes: c.max_total_mem,
      fastbin_bytes,
      in_use_bytes: c.sbrked_mem.saturating_sub(free_bytes),
      free_bytes,
      top_bytes,
    }
  }

  /// Logs the `malloc_stats` style summary at info level.
  pub fn log_statistics(&self) {
    for line in self.statistics().to_string().lines() {
      info!("{line}");
    }
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    HeapError, MALLOC_ALIGNMENT, Param,
    chunk::{Chunk, MINSIZE, SIZE_SZ},
    heap::tests::heap,
  };

  #[test]
  fn realloc_grows_into_top_in_place() {
    let mut h = heap(1 << 20);
    let p = h.allocate(100).unwrap();
    unsafe {
      p.as_ptr().write_bytes(0x5a, 100);
      let q = h.reallocate(p.as_ptr(), 2000).unwrap();
      assert_eq!(q, p);
      assert!(h.usable_size(q.as_ptr()) >= 2000);
      assert!(core::slice::from_raw_parts(q.as_ptr(), 100).iter().all(|&b| b == 0x5a));
    }
  }

  #[test]
  fn realloc_grows_into_free_neighbour() {
    let mut h = heap(1 << 20);
    let a = h.allocate(100).unwrap();
    let b = h.allocate(1000).unwrap();
    let _guard = h.allocate(16).unwrap();
    unsafe {
      h.release(b.as_ptr()).unwrap();
      let q = h.reallocate(a.as_ptr(), 600).unwrap();
      assert_eq!(q, a);
      assert!(h.usable_size(q.as_ptr()) >= 600);
    }
    h.verify().unwrap();
  }

  #[test]
  fn realloc_moves_and_copies_when_boxed_in() {
    let mut h = heap(1 << 20);
    let a = h.allocate(100).unwrap();
    let _b = h.allocate(100).unwrap();
    unsafe {
      for i in 0..100 {
        a.as_ptr().add(i).write(i as u8);
      }
      let q = h.reallocate(a.as_ptr(), 5000).unwrap();
      assert_ne!(q, a);
      for i in 0..100 {
        assert_eq!(q.as_ptr().add(i).read(), i as u8);
      }
    }
    h.verify().unwrap();
  }

  #[test]
  fn realloc_shrink_splits_off_the_tail() {
    let mut h = heap(1 << 20);
    let a = h.allocate(1000).unwrap();
    let _guard = h.allocate(16).unwrap();
    unsafe {
      let q = h.reallocate(a.as_ptr(), 100).unwrap();
      assert_eq!(q, a);
      assert_eq!(Chunk::from_mem(q).size(), 112);
    }
    assert!(h.statistics().free_chunks >= 2);
    h.verify().unwrap();
  }

  #[test]
  fn realloc_null_allocates() {
    let mut h = heap(1 << 20);
    let p = unsafe { h.reallocate(core::ptr::null_mut(), 40) }.unwrap();
    assert!(unsafe { h.usable_size(p.as_ptr()) } >= 40);
  }

  #[test]
  fn zeroed_memory_is_zero_even_when_reused() {
    let mut h = heap(1 << 20);
    let p = h.allocate(256).unwrap();
    let _guard = h.allocate(16).unwrap();
    unsafe {
      p.as_ptr().write_bytes(0xff, 256);
      h.release(p.as_ptr()).unwrap();
    }
    let z = h.allocate_zeroed(8, 32).unwrap();
    assert_eq!(z, p);
    let bytes = unsafe { core::slice::from_raw_parts(z.as_ptr(), h.usable_size(z.as_ptr())) };
    assert!(bytes.iter().all(|&b| b == 0));
  }

  #[test]
  fn zeroed_overflow_is_invalid() {
    let mut h = heap(1 << 20);
    assert_eq!(h.allocate_zeroed(usize::MAX / 2, 3), Err(HeapError::InvalidSize));
  }

  #[test]
  fn aligned_allocations_release_their_slack() {
    let mut h = heap(4 << 20);
    let mut align = 32;
    while align <= 4096 {
      let p = h.allocate_aligned(align, 100).unwrap();
      assert_eq!(p.as_ptr().addr() % align, 0);
      assert!(unsafe { h.usable_size(p.as_ptr()) } >= 100);
      align *= 2;
    }
    // Odd alignments round up to the next power of two.
    let p = h.allocate_aligned(48, 10).unwrap();
    assert_eq!(p.as_ptr().addr() % 64, 0);
    // Small alignments are already satisfied.
    let p = h.allocate_aligned(8, 10).unwrap();
    assert_eq!(p.as_ptr().addr() % MALLOC_ALIGNMENT, 0);
    h.verify().unwrap();
  }

  #[test]
  fn page_variants() {
    let mut h = heap(1 << 20);
    let p = h.allocate_page_aligned(10).unwrap();
    assert_eq!(p.as_ptr().addr() % 4096, 0);
    let p = h.allocate_page_rounded(10).unwrap();
    assert_eq!(p.as_ptr().addr() % 4096, 0);
    assert!(unsafe { h.usable_size(p.as_ptr()) } >= 4096);
  }

  #[test]
  fn batch_same_size_is_zeroed_and_independent() {
    let mut h = heap(1 << 20);
    let mut out = [core::ptr::null_mut(); 5];
    h.allocate_batch_same_size(40, &mut out).unwrap();
    for w in out.windows(2) {
      assert_eq!(w[1].addr() - w[0].addr(), 48);
    }
    for &p in &out {
      assert!(unsafe { h.usable_size(p) } >= 40);
      assert!(unsafe { core::slice::from_raw_parts(p, 40) }.iter().all(|&b| b == 0));
    }
    for &p in out.iter().rev() {
      unsafe { h.release(p).unwrap() };
    }
    h.verify().unwrap();
  }

  #[test]
  fn batch_mixed_sizes_with_inline_array() {
    let mut h = heap(1 << 20);
    let sizes = [10, 100, 1000];
    let array = unsafe { h.independent_comalloc(&sizes, core::ptr::null_mut()) }.unwrap();
    let ptrs = unsafe { core::slice::from_raw_parts(array.as_ptr(), 3) }.to_vec();
    for (&p, &size) in ptrs.iter().zip(&sizes) {
      assert!(unsafe { h.usable_size(p) } >= size);
    }
    // The array lives in its own chunk right after the elements.
    let last = unsafe { Chunk::from_mem(core::ptr::NonNull::new(ptrs[2]).unwrap()) };
    assert_eq!(last.next().mem().as_ptr().cast::<*mut u8>(), array.as_ptr());

    unsafe {
      h.release(array.as_ptr().cast()).unwrap();
      for p in ptrs {
        h.release(p).unwrap();
      }
    }
    h.verify().unwrap();

    let mut out = [core::ptr::null_mut(); 2];
    assert_eq!(h.allocate_batch_mixed_sizes(&sizes, &mut out), Err(HeapError::InvalidSize));
  }

  #[test]
  fn empty_batches() {
    let mut h = heap(1 << 20);
    h.allocate_batch_same_size(8, &mut []).unwrap();
    let array = unsafe { h.independent_calloc(0, 8, core::ptr::null_mut()) }.unwrap();
    assert!(unsafe { h.usable_size(array.as_ptr().cast()) } >= MINSIZE - SIZE_SZ);
  }

  #[test]
  fn set_option_moves_the_fastbin_ceiling() {
    let mut h = heap(1 << 20);
    h.set_option(Param::MaxFast, 0).unwrap();
    let p = h.allocate(24).unwrap();
    let _guard = h.allocate(24).unwrap();
    unsafe { h.release(p.as_ptr()).unwrap() };
    assert_eq!(h.statistics().fastbin_chunks, 0);

    assert_eq!(
      h.set_option(Param::MaxFast, 81),
      Err(HeapError::InvalidOption { param: Param::MaxFast, value: 81 })
    );
    assert_eq!(h.tunables().max_fast, 0);
  }

  #[test]
  fn statistics_balance() {
    let mut h = heap(1 << 20);
    let a = h.allocate(1000).unwrap();
    let b = h.allocate(24).unwrap();
    let _c = h.allocate(24).unwrap();
    unsafe {
      h.release(a.as_ptr()).unwrap();
      h.release(b.as_ptr()).unwrap();
    }
    let s = h.statistics();
    assert_eq!(s.fastbin_chunks, 1);
    assert_eq!(s.fastbin_bytes, 32);
    assert_eq!(s.free_chunks, 2);
    assert_eq!(s.free_bytes + s.in_use_bytes, s.system_bytes);
    assert_eq!(s.top_bytes, h.top_size());
    assert!(s.peak_bytes >= s.system_bytes);
    h.log_statistics();
  }
}
