//! Arena state and the allocation engine.

use core::ptr::NonNull;

use log::{debug, warn};

use crate::{
  bins::{Bins, Node, UNSORTED, bin_index, fastbin_index, in_smallbin_range, smallbin_index},
  chunk::{Chunk, MINSIZE, PREV_INUSE, checked_request2size},
  config::Tunables,
  error::{Corruption, HeapError, corrupted},
  source::MemorySource,
  stats::Counters,
};

/// A boundary-tag heap over one [`MemorySource`].
///
/// The heap does no locking of its own: it is `Send` but not `Sync`, and
/// sharing it means wrapping every call in one lock (see
/// [`crate::LockedHeap`]). State is initialized lazily by the first
/// operation, so a `Heap` can sit in a `static`.
///
/// Releasing or reallocating a pointer this heap never handed out is
/// undefined behavior. The checks on those paths catch common mistakes such
/// as double frees and overwritten headers, not arbitrary pointers.
pub struct Heap<S: MemorySource> {
  pub(crate) source: S,
  pub(crate) bins: Bins,
  /// Highest chunk, bordering the unused end of the arena. `None` until the
  /// first extension.
  pub(crate) top: Option<Chunk>,
  /// Remainder of the most recent split serving a small request.
  pub(crate) last_remainder: Option<Chunk>,
  pub(crate) tunables: Tunables,
  /// Chunk-size ceiling for fastbins, derived from `tunables.max_fast`.
  pub(crate) max_fast: usize,
  /// Extensions are assumed adjacent until proven otherwise.
  pub(crate) contiguous: bool,
  initialized: bool,
  pub(crate) counters: Counters,
}

// SAFETY: chunks reachable from the heap belong to memory owned through `source`.
unsafe impl<S: MemorySource + Send> Send for Heap<S> {}

impl<S: MemorySource> Heap<S> {
  pub const fn new(source: S) -> Self {
    Self::with_tunables(source, Tunables::new())
  }

  pub const fn with_tunables(source: S, tunables: Tunables) -> Self {
    Self {
      source,
      bins: Bins::new(),
      top: None,
      last_remainder: None,
      tunables,
      max_fast: 0,
      contiguous: true,
      initialized: false,
      counters: Counters::new(),
    }
  }

  pub fn tunables(&self) -> &Tunables {
    &self.tunables
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  /// Direct access to the memory source. Moving its break behind the heap's
  /// back is tolerated but costs contiguity.
  pub fn source_mut(&mut self) -> &mut S {
    &mut self.source
  }

  pub(crate) fn ensure_init(&mut self) {
    if self.initialized {
      return;
    }
    self.bins.init();
    if self.tunables.sanitize() {
      warn!("out-of-range tunables clamped to {:?}", self.tunables);
    }
    self.max_fast = self.tunables.fast_chunk_limit();
    self.contiguous = self.source.contiguous();
    self.initialized = true;
    debug!(
      "heap initialized: page {} contiguous {} {:?}",
      self.source.page_size(),
      self.contiguous,
      self.tunables
    );
  }

  #[inline]
  pub(crate) fn is_initialized(&self) -> bool {
    self.initialized
  }

  #[inline]
  pub(crate) fn top_size(&self) -> usize {
    self.top.map_or(0, Chunk::size)
  }

  /// Runs the full consistency walk after public operations when the
  /// `debug-tripwire` feature is on.
  #[inline(always)]
  pub(crate) fn tripwire(&mut self) {
    #[cfg(feature = "debug-tripwire")]
    if self.initialized {
      let _ = self.verify();
    }
  }

  // ===========================================================================
  // Allocation engine
  // ===========================================================================

  /// Allocates at least `bytes` usable bytes aligned to
  /// [`crate::MALLOC_ALIGNMENT`].
  pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
    let nb = checked_request2size(bytes).ok_or(HeapError::InvalidSize)?;
    let chunk = self.malloc_chunk(nb);
    self.tripwire();
    chunk.map(Chunk::mem)
  }

  /// Returns an in-use chunk of at least `nb` bytes, a normalized size.
  pub(crate) fn malloc_chunk(&mut self, nb: usize) -> Result<Chunk, HeapError> {
    self.ensure_init();

    // Nothing binned yet.
    if !self.bins.have_anychunks {
      return match self.use_top(nb) {
        Some(victim) => Ok(victim),
        None => self.sys_alloc(nb),
      };
    }

    if nb <= self.max_fast {
      let idx = fastbin_index(nb);
      if let Some(victim) = self.bins.pop_fast(idx) {
        if fastbin_index(victim.size()) != idx {
          return Err(corrupted(Corruption::WrongBin));
        }
        return Ok(victim);
      }
    }

    if in_smallbin_range(nb) {
      if let Some(victim) = self.bins.last(smallbin_index(nb)) {
        self.bins.unlink(victim).map_err(corrupted)?;
        victim.set_inuse_bit_at(nb);
        return Ok(victim);
      }
    } else if self.bins.have_fastchunks {
      // Large requests flush fastbins first so fragments can merge.
      self.consolidate()?;
    }

    loop {
      if let Some(victim) = self.drain_unsorted(nb)? {
        return Ok(victim);
      }

      let mut idx = bin_index(nb);

      if !in_smallbin_range(nb)
        && let Some(victim) = self.bins.iter(idx).find(|c| c.size() >= nb)
      {
        return self.split_or_exhaust(victim, nb, false);
      }

      // Every chunk in a higher bin is large enough; take the smallest one.
      idx += 1;
      while let Some(bin) = self.bins.next_marked(idx) {
        match self.bins.last(bin) {
          Some(victim) => return self.split_or_exhaust(victim, nb, in_smallbin_range(nb)),
          None => {
            self.bins.unmark(bin);
            idx = bin + 1;
          }
        }
      }

      if let Some(victim) = self.use_top(nb) {
        return Ok(victim);
      }

      // Merging fastbin chunks may build enough room; otherwise grow.
      if self.bins.have_fastchunks {
        self.consolidate()?;
        continue;
      }
      return self.sys_alloc(nb);
    }
  }

  /// Sorts the unsorted list into bins, returning early on an exact fit or a
  /// split of the last remainder.
  fn drain_unsorted(&mut self, nb: usize) -> Result<Option<Chunk>, HeapError> {
    while let Some(victim) = self.bins.last(UNSORTED) {
      let size = victim.size();
      if size < MINSIZE || size > self.counters.sbrked_mem {
        return Err(corrupted(Corruption::BadSize));
      }

      // Consecutive small requests carve the same remainder for locality.
      if in_smallbin_range(nb)
        && Some(victim) == self.last_remainder
        && self.bins.fd(Node::Bin(UNSORTED)) == Node::Chunk(victim)
        && size > nb + MINSIZE
      {
        self.bins.unlink(victim).map_err(corrupted)?;
        let remainder_size = size - nb;
        let remainder = victim.plus(nb);
        self.bins.push_unsorted(remainder);
        self.last_remainder = Some(remainder);
        victim.set_head(nb | PREV_INUSE);
        remainder.set_head(remainder_size | PREV_INUSE);
        remainder.set_foot(remainder_size);
        return Ok(Some(victim));
      }

      self.bins.unlink(victim).map_err(corrupted)?;

      if size == nb {
        victim.set_inuse_bit_at(size);
        return Ok(Some(victim));
      }

      self.bins.place(victim, size);
    }
    Ok(None)
  }

  /// Takes `victim` out of its bin and trims it to `nb`, sending any usable
  /// tail to the unsorted list.
  pub(crate) fn split_or_exhaust(
    &mut self,
    victim: Chunk,
    nb: usize,
    advertise: bool,
  ) -> Result<Chunk, HeapError> {
    let size = victim.size();
    if size < nb {
      return Err(corrupted(Corruption::WrongBin));
    }
    self.bins.unlink(victim).map_err(corrupted)?;

    let remainder_size = size - nb;
    if remainder_size < MINSIZE {
      victim.set_inuse_bit_at(size);
    } else {
      let remainder = victim.plus(nb);
      self.bins.push_unsorted(remainder);
      if advertise {
        self.last_remainder = Some(remainder);
      }
      victim.set_head(nb | PREV_INUSE);
      remainder.set_head(remainder_size | PREV_INUSE);
      remainder.set_foot(remainder_size);
    }
    Ok(victim)
  }

  /// Splits `nb` bytes off the bottom of top, keeping at least `MINSIZE`.
  pub(crate) fn use_top(&mut self, nb: usize) -> Option<Chunk> {
    let top = self.top?;
    let size = top.size();
    if size < nb + MINSIZE {
      return None;
    }
    let remainder = top.plus(nb);
    self.top = Some(remainder);
    top.set_head(nb | PREV_INUSE);
    remainder.set_head((size - nb) | PREV_INUSE);
    Some(top)
  }
}
