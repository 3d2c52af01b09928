use crate::{
  bins::MAX_FAST_SIZE,
  chunk::request2size,
  error::HeapError,
};

// =============================================================================
// Defaults
// =============================================================================

pub const DEFAULT_MAX_FAST: usize = 64;
pub const DEFAULT_TRIM_THRESHOLD: usize = 256 * 1024;
pub const DEFAULT_TOP_PAD: usize = 0;
pub const DEFAULT_MMAP_THRESHOLD: usize = 256 * 1024;
pub const DEFAULT_MMAP_MAX: usize = 65536;

/// Releasing a chunk at least this large triggers consolidation and a trim check.
pub const DEFAULT_CONSOLIDATION_THRESHOLD: usize = 64 * 1024;

/// Minimum size of a page mapping used in place of a failed arena extension.
pub(crate) const MMAP_AS_MORECORE_SIZE: usize = 1024 * 1024;

// =============================================================================
// Tunables
// =============================================================================

/// Runtime parameters of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
  /// Largest request (in bytes) served from fastbins. `0` disables them.
  pub max_fast: usize,
  /// Top chunk size above which a release gives memory back.
  pub trim_threshold: usize,
  /// Extra bytes requested on every arena extension and kept on trim.
  pub top_pad: usize,
  /// Requests at or above this size get their own page mapping.
  pub mmap_threshold: usize,
  /// Cap on simultaneous page-mapped chunks. `0` disables mapping.
  pub mmap_max: usize,
  /// Do not fastbin chunks that border top, so they can be trimmed.
  pub trim_fastbins: bool,
  /// Merged size of a released chunk that flushes fastbins and checks for trim.
  pub consolidation_threshold: usize,
}

impl Tunables {
  pub const fn new() -> Self {
    Self {
      max_fast: DEFAULT_MAX_FAST,
      trim_threshold: DEFAULT_TRIM_THRESHOLD,
      top_pad: DEFAULT_TOP_PAD,
      mmap_threshold: DEFAULT_MMAP_THRESHOLD,
      mmap_max: DEFAULT_MMAP_MAX,
      trim_fastbins: false,
      consolidation_threshold: DEFAULT_CONSOLIDATION_THRESHOLD,
    }
  }

  /// Largest chunk size that goes to a fastbin. Below `MINSIZE` when disabled.
  /// Values above [`MAX_FAST_SIZE`] are clamped to it.
  #[inline]
  pub(crate) const fn fast_chunk_limit(&self) -> usize {
    match self.max_fast {
      0 => 8,
      n if n > MAX_FAST_SIZE => request2size(MAX_FAST_SIZE),
      n => request2size(n),
    }
  }

  /// Brings seeded values into the range [`Tunables::apply`] accepts.
  /// Returns whether anything changed.
  pub(crate) fn sanitize(&mut self) -> bool {
    let mut changed = false;
    if self.max_fast > MAX_FAST_SIZE {
      self.max_fast = MAX_FAST_SIZE;
      changed = true;
    }
    if self.consolidation_threshold == 0 {
      self.consolidation_threshold = DEFAULT_CONSOLIDATION_THRESHOLD;
      changed = true;
    }
    changed
  }

  /// Validates and applies one parameter change.
  pub fn apply(&mut self, param: Param, value: usize) -> Result<(), HeapError> {
    match param {
      Param::MaxFast if value <= MAX_FAST_SIZE => self.max_fast = value,
      Param::TrimThreshold => self.trim_threshold = value,
      Param::TopPad => self.top_pad = value,
      Param::MmapThreshold => self.mmap_threshold = value,
      Param::MmapMax => self.mmap_max = value,
      Param::TrimFastbins if value <= 1 => self.trim_fastbins = value == 1,
      Param::ConsolidationThreshold if value > 0 => self.consolidation_threshold = value,
      _ => return Err(HeapError::InvalidOption { param, value }),
    }
    Ok(())
  }
}

impl Default for Tunables {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Param
// =============================================================================

/// Parameter names accepted by [`crate::Heap::set_option`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
  MaxFast,
  TrimThreshold,
  TopPad,
  MmapThreshold,
  MmapMax,
  TrimFastbins,
  ConsolidationThreshold,
}

impl Param {
  /// Maps the classic `mallopt` parameter numbers.
  pub const fn from_mallopt(number: i32) -> Option<Self> {
    match number {
      1 => Some(Param::MaxFast),
      -1 => Some(Param::TrimThreshold),
      -2 => Some(Param::TopPad),
      -3 => Some(Param::MmapThreshold),
      -4 => Some(Param::MmapMax),
      _ => None,
    }
  }
}
