//! Full consistency walk over the free lists.

use crate::{
  bins::{NBINS, NFASTBINS, NSMALLBINS, Node, UNSORTED, bin_index, fastbin_index},
  chunk::{Chunk, MALLOC_ALIGN_MASK, MINSIZE},
  error::{Corruption, HeapError, corrupted},
  heap::Heap,
  source::MemorySource,
};

impl<S: MemorySource> Heap<S> {
  /// Checks every free list, the binmap, and top. Linear in the number of
  /// free chunks; meant for tests and debugging.
  pub fn verify(&self) -> Result<(), HeapError> {
    if !self.is_initialized() {
      return Ok(());
    }
    self.verify_top().map_err(corrupted)?;
    self.verify_fastbins().map_err(corrupted)?;
    self.verify_bins().map_err(corrupted)
  }

  /// Upper bound on list length; anything longer must be a cycle.
  fn walk_limit(&self) -> usize {
    self.counters.sbrked_mem / MINSIZE + 1
  }

  fn verify_top(&self) -> Result<(), Corruption> {
    let Some(top) = self.top else {
      return Ok(());
    };
    if top.addr() & MALLOC_ALIGN_MASK != 0 || top.size() < MINSIZE || !top.prev_inuse() {
      return Err(Corruption::BadTop);
    }
    Ok(())
  }

  fn verify_fastbins(&self) -> Result<(), Corruption> {
    let limit = self.walk_limit();
    for idx in 0..NFASTBINS {
      for (n, p) in self.bins.iter_fast(idx).enumerate() {
        if n > limit {
          return Err(Corruption::BadLinks);
        }
        let size = p.size();
        if size < MINSIZE || size > self.max_fast || fastbin_index(size) != idx {
          return Err(Corruption::WrongBin);
        }
        // Fastbin chunks still look allocated to their neighbours.
        if !p.inuse() {
          return Err(Corruption::DoubleFree);
        }
      }
    }
    Ok(())
  }

  fn verify_bins(&self) -> Result<(), Corruption> {
    let limit = self.walk_limit();
    for idx in UNSORTED..NBINS {
      if idx != UNSORTED && !self.bins.is_empty(idx) && !self.bins.is_marked(idx) {
        return Err(Corruption::BinmapMismatch);
      }

      let mut smaller = 0;
      for (n, p) in self.bins.iter(idx).enumerate() {
        if n > limit {
          return Err(Corruption::BadLinks);
        }
        let node = Node::Chunk(p);
        if self.bins.fd(self.bins.bk(node)) != node || self.bins.bk(self.bins.fd(node)) != node {
          return Err(Corruption::BadLinks);
        }

        let size = self.verify_free_chunk(p)?;
        if idx != UNSORTED && bin_index(size) != idx {
          return Err(Corruption::WrongBin);
        }
        if idx >= NSMALLBINS {
          if size < smaller {
            return Err(Corruption::UnsortedLargeBin);
          }
          smaller = size;
        }
      }
    }
    Ok(())
  }

  /// Boundary tags of a chunk on a regular free list.
  fn verify_free_chunk(&self, p: Chunk) -> Result<usize, Corruption> {
    if p.addr() & MALLOC_ALIGN_MASK != 0 {
      return Err(Corruption::Misaligned);
    }
    let size = p.size();
    if size < MINSIZE || size & MALLOC_ALIGN_MASK != 0 || p.is_mmapped() {
      return Err(Corruption::BadSize);
    }
    if !p.prev_inuse() {
      return Err(Corruption::AdjacentFree);
    }
    let next = p.next();
    if next.prev_size() != size || next.prev_inuse() {
      return Err(Corruption::FooterMismatch);
    }
    if Some(next) == self.top || !next.inuse() {
      return Err(Corruption::AdjacentFree);
    }
    Ok(size)
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    Corruption, HeapError,
    chunk::SIZE_SZ,
    heap::tests::heap,
  };

  #[test]
  fn fresh_and_busy_heaps_verify() {
    let mut h = heap(4 << 20);
    h.verify().unwrap();

    let mut live = Vec::new();
    for i in 0..200usize {
      live.push(h.allocate(16 + (i * 37) % 3000).unwrap());
    }
    for p in live.iter().step_by(3) {
      unsafe { h.release(p.as_ptr()).unwrap() };
    }
    h.verify().unwrap();
    let _ = h.allocate(5000).unwrap();
    h.verify().unwrap();
  }

  #[cfg(not(feature = "debug-tripwire"))]
  #[test]
  fn overwritten_footer_is_reported() {
    let mut h = heap(1 << 20);
    let a = h.allocate(200).unwrap();
    let b = h.allocate(200).unwrap();
    unsafe {
      h.release(a.as_ptr()).unwrap();
      // `b`'s prev_size word is the footer of free `a`.
      let footer = b.as_ptr().sub(2 * SIZE_SZ).cast::<usize>();
      footer.write(footer.read() + 16);
    }
    assert_eq!(h.verify(), Err(HeapError::CorruptionDetected(Corruption::FooterMismatch)));
  }
}
