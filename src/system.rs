//! Growing and shrinking the arena, and page-mapped chunks.

use core::ptr::NonNull;

use log::{debug, warn};

use crate::{
  chunk::{
    Chunk, IS_MMAPPED, MALLOC_ALIGN_MASK, MALLOC_ALIGNMENT, MEM_OFFSET, MINSIZE, PREV_INUSE, SIZE_SZ,
    align_up, checked_align_up,
  },
  config::MMAP_AS_MORECORE_SIZE,
  error::{Corruption, HeapError, corrupted},
  heap::Heap,
  source::MemorySource,
};

impl<S: MemorySource> Heap<S> {
  /// Obtains memory for an `nb`-byte chunk when nothing in the arena fits:
  /// a page mapping for large requests, otherwise a bigger top.
  pub(crate) fn sys_alloc(&mut self, nb: usize) -> Result<Chunk, HeapError> {
    let page = self.source.page_size();

    if nb >= self.tunables.mmap_threshold
      && self.counters.n_mmaps < self.tunables.mmap_max
      && let Some(p) = self.map_chunk(nb, page)
    {
      return Ok(p);
    }

    self.grow_top(nb, page)?;

    match self.use_top(nb) {
      Some(p) => Ok(p),
      None => {
        warn!("out of memory serving a {nb} byte chunk");
        Err(HeapError::OutOfMemory)
      }
    }
  }

  /// Extends the arena so top can hold `nb + MINSIZE` bytes. Falls back to a
  /// page mapping when the break cannot move, fencing off the old top.
  fn grow_top(&mut self, nb: usize, page: usize) -> Result<(), HeapError> {
    let old_top = self.top;
    let old_size = self.top_size();
    let old_end = old_top.map(|t| t.addr() + old_size);

    let mut size = nb
      .checked_add(self.tunables.top_pad)
      .and_then(|s| s.checked_add(MINSIZE))
      .ok_or(HeapError::OutOfMemory)?;
    // Only the shortfall is needed when the new space will merge with top.
    if self.contiguous {
      size -= old_size;
    }
    size = checked_align_up(size, page).ok_or(HeapError::OutOfMemory)?;

    let mut brk = isize::try_from(size).ok().and_then(|delta| self.source.extend(delta));
    let mut mapped = false;

    if brk.is_none() {
      // The break is stuck; use a page mapping as a new, detached top.
      if self.contiguous {
        size = size.saturating_add(old_size);
      }
      size = checked_align_up(size, page)
        .ok_or(HeapError::OutOfMemory)?
        .max(MMAP_AS_MORECORE_SIZE);
      brk = self.source.map_pages(size);
      if brk.is_some() {
        mapped = true;
        self.contiguous = false;
        debug!("arena extension failed, mapped {size} bytes instead");
      }
    }

    let Some(brk) = brk else {
      warn!("memory source exhausted growing the arena by {size} bytes");
      return Err(HeapError::OutOfMemory);
    };
    let brk_addr = brk.as_ptr().addr();
    self.counters.sbrked_mem += size;

    match old_top {
      Some(top) if !mapped && Some(brk_addr) == old_end => {
        top.set_head((old_size + size) | PREV_INUSE);
        debug!("arena grew by {size} bytes in place");
      }
      _ => self.rebase_top(old_top, old_size, old_end, brk, size, mapped)?,
    }

    self.counters.update_peaks();
    Ok(())
  }

  /// Installs a fresh top at `brk` when it does not continue the old one:
  /// first growth, a foreign break move, or a detached mapping.
  fn rebase_top(
    &mut self,
    old_top: Option<Chunk>,
    old_size: usize,
    old_end: Option<usize>,
    brk: NonNull<u8>,
    size: usize,
    mapped: bool,
  ) -> Result<(), HeapError> {
    let brk_addr = brk.as_ptr().addr();

    if self.contiguous && old_size != 0 && old_end.is_some_and(|end| brk_addr < end) {
      debug!("break moved below the arena end, arena is no longer contiguous");
      self.contiguous = false;
    }

    let front_misalign = (brk_addr + MEM_OFFSET) & MALLOC_ALIGN_MASK;
    let lead = if front_misalign > 0 { MALLOC_ALIGNMENT - front_misalign } else { 0 };
    let aligned = unsafe { NonNull::new_unchecked(brk.as_ptr().wrapping_add(lead)) };

    let mut correction = 0;
    let snd_brk;
    if self.contiguous {
      // Someone else moved the break forward; the gap still counts as ours.
      if let Some(end) = old_end
        && old_size != 0
      {
        self.counters.sbrked_mem += brk_addr - end;
        debug!("foreign break move left a {} byte gap", brk_addr - end);
      }

      // Ask again for what alignment cost us plus the old top we gave up,
      // rounded so the break ends on a page boundary.
      correction = lead + old_size;
      let end_misalign = brk_addr + size + correction;
      let page = self.source.page_size();
      correction += align_up(end_misalign, page) - end_misalign;

      match isize::try_from(correction).ok().and_then(|delta| self.source.extend(delta)) {
        Some(p) => snd_brk = p.as_ptr().addr(),
        None => {
          correction = 0;
          snd_brk = self.source.extend(0).map_or(brk_addr + size, |p| p.as_ptr().addr());
        }
      }
    } else if mapped {
      snd_brk = brk_addr + size;
    } else {
      snd_brk = self.source.extend(0).map_or(brk_addr + size, |p| p.as_ptr().addr());
    }

    // SAFETY: `aligned` lies inside memory just obtained from the source.
    let top = unsafe { Chunk::new(aligned) };
    let top_size = (snd_brk + correction)
      .checked_sub(aligned.as_ptr().addr())
      .ok_or(HeapError::OutOfMemory)?
      & !MALLOC_ALIGN_MASK;
    top.set_head(top_size | PREV_INUSE);
    self.top = Some(top);
    self.counters.sbrked_mem += correction;
    debug!("new top at {:p}, {top_size} bytes", aligned);

    // Fence off the abandoned top so nothing ever merges across the gap.
    if let Some(old_top) = old_top
      && old_size != 0
    {
      let fenced = (old_size - 3 * SIZE_SZ) & !MALLOC_ALIGN_MASK;
      old_top.set_head(fenced | PREV_INUSE);
      old_top.plus(fenced).set_head(2 * SIZE_SZ | PREV_INUSE);
      old_top.plus(fenced + 2 * SIZE_SZ).set_head(2 * SIZE_SZ | PREV_INUSE);

      if fenced >= MINSIZE {
        let trim_threshold = self.tunables.trim_threshold;
        self.tunables.trim_threshold = usize::MAX;
        let released = self.free_chunk(old_top);
        self.tunables.trim_threshold = trim_threshold;
        released?;
      }
    }
    Ok(())
  }

  /// Gives whole pages at the end of top back to the source, keeping `pad`
  /// bytes. Returns the number of bytes released.
  pub(crate) fn sys_trim(&mut self, pad: usize) -> usize {
    let Some(top) = self.top else {
      return 0;
    };
    let page = self.source.page_size();
    let top_size = top.size();
    let spare = top_size.saturating_sub(pad.saturating_add(MINSIZE));
    let extra = spare.div_ceil(page).saturating_sub(1) * page;
    if extra == 0 {
      return 0;
    }

    // Only shrink if the break is still where top ends.
    let end = top.addr() + top_size;
    if self.source.extend(0).map(|p| p.as_ptr().addr()) != Some(end) {
      return 0;
    }
    let Ok(delta) = isize::try_from(extra) else {
      return 0;
    };
    self.source.extend(-delta);

    let Some(new_brk) = self.source.extend(0) else {
      return 0;
    };
    let released = match end.checked_sub(new_brk.as_ptr().addr()) {
      Some(released) if released != 0 && released <= extra => released,
      _ => return 0,
    };

    self.counters.sbrked_mem -= released;
    top.set_head((top_size - released) | PREV_INUSE);
    debug!("trimmed {released} bytes from the arena");
    released
  }

  // ===========================================================================
  // Page-mapped chunks
  // ===========================================================================

  /// Serves `nb` bytes from a dedicated mapping. The offset from the mapping
  /// start lives in `prev_size`.
  fn map_chunk(&mut self, nb: usize, page: usize) -> Option<Chunk> {
    let size = checked_align_up(nb.checked_add(SIZE_SZ + MALLOC_ALIGN_MASK)?, page)?;
    let base = self.source.map_pages(size)?;

    let front_misalign = (base.as_ptr().addr() + MEM_OFFSET) & MALLOC_ALIGN_MASK;
    let offset = if front_misalign > 0 { MALLOC_ALIGNMENT - front_misalign } else { 0 };
    // SAFETY: the mapping is ours and far larger than `offset`.
    let p = unsafe { Chunk::new(NonNull::new_unchecked(base.as_ptr().wrapping_add(offset))) };
    p.set_prev_size(offset);
    p.set_head((size - offset) | IS_MMAPPED);

    self.counters.n_mmaps += 1;
    self.counters.mmapped_mem += size;
    self.counters.update_peaks();
    debug!("mapped {size} bytes at {base:p} for a {nb} byte chunk");
    Some(p)
  }

  pub(crate) fn unmap_chunk(&mut self, p: Chunk) -> Result<(), HeapError> {
    let offset = p.prev_size();
    let total = p.size() + offset;
    let base = p.minus(offset);
    let page = self.source.page_size();
    if (base.addr() | total) & (page - 1) != 0 {
      return Err(corrupted(Corruption::BadSize));
    }
    // SAFETY: `base`/`total` reconstruct the mapping made by `map_chunk`.
    let base = unsafe { NonNull::new_unchecked(base.as_ptr()) };
    if !unsafe { self.source.unmap_pages(base, total) } {
      return Err(corrupted(Corruption::ForeignPointer));
    }
    self.counters.n_mmaps = self.counters.n_mmaps.saturating_sub(1);
    self.counters.mmapped_mem = self.counters.mmapped_mem.saturating_sub(total);
    debug!("unmapped {total} bytes at {base:p}");
    Ok(())
  }
}
