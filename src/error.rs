use crate::config::Param;

/// Failure of a heap operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
  #[error("out of memory")]
  OutOfMemory,
  #[error("requested size cannot be represented")]
  InvalidSize,
  #[error("heap corruption detected: {0}")]
  CorruptionDetected(#[from] Corruption),
  #[error("invalid value {value} for {param:?}")]
  InvalidOption { param: Param, value: usize },
}

/// The consistency check that failed.
///
/// The cheap checks on the allocation and release paths catch the common
/// cases; the remaining variants are only reported by [`crate::Heap::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Corruption {
  #[error("double free or release of a free chunk")]
  DoubleFree,
  #[error("pointer is not aligned to a chunk boundary")]
  Misaligned,
  #[error("chunk size is impossible")]
  BadSize,
  #[error("prev_size does not match the previous chunk")]
  PrevSizeMismatch,
  #[error("free list links are broken")]
  BadLinks,
  #[error("pointer does not belong to this heap")]
  ForeignPointer,
  #[error("memory just before the block was overwritten or the block was already released")]
  GuardHeadOverwritten,
  #[error("block released with a different length than it was allocated with")]
  GuardLengthMismatch,
  #[error("memory just after the block was overwritten")]
  GuardTailOverwritten,
  #[error("binmap bit clear for a non-empty bin")]
  BinmapMismatch,
  #[error("chunk is filed in the wrong bin")]
  WrongBin,
  #[error("large bin is not sorted by size")]
  UnsortedLargeBin,
  #[error("top chunk is malformed")]
  BadTop,
  #[error("two free chunks are adjacent")]
  AdjacentFree,
  #[error("free chunk footer does not match its header")]
  FooterMismatch,
}

/// Reports a detected corruption and turns it into an error.
#[cold]
pub(crate) fn corrupted(kind: Corruption) -> HeapError {
  log::error!("heap corruption: {kind}");
  #[cfg(feature = "debug-tripwire")]
  panic!("heap corruption: {kind}");
  #[cfg(not(feature = "debug-tripwire"))]
  HeapError::CorruptionDetected(kind)
}
