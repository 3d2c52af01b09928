//! Canary-wrapped blocks for catching overruns and bad releases.
//!
//! ```text
//!   [len][HEAD_CANARY][payload ... padded to words][TAIL_CANARY][base]
//!                     ^ pointer handed out
//! ```
//!
//! The wrapper is independent of chunk headers: it sits inside an ordinary
//! allocation and is checked on release.

use core::ptr::NonNull;

use crate::{
  error::{Corruption, HeapError, corrupted},
  heap::Heap,
  source::MemorySource,
};

const WORD: usize = size_of::<usize>();
const HEAD_CANARY: usize = 0xa512_34ab;
const TAIL_CANARY: usize = 0xdead_fedc;

/// Total words of a guarded block with `len` payload bytes.
#[inline]
fn guarded_words(len: usize) -> Option<usize> {
  len.div_ceil(WORD).checked_add(4)
}

impl<S: MemorySource> Heap<S> {
  /// Allocates `len` zeroed bytes between two canary words.
  pub fn allocate_guarded(&mut self, len: usize) -> Result<NonNull<u8>, HeapError> {
    if len == 0 {
      return Err(HeapError::InvalidSize);
    }
    let words = guarded_words(len).ok_or(HeapError::InvalidSize)?;
    let bytes = words.checked_mul(WORD).ok_or(HeapError::InvalidSize)?;

    let base = self.allocate(bytes)?.cast::<usize>();
    unsafe {
      let w = base.as_ptr();
      w.write(len);
      w.add(1).write(HEAD_CANARY);
      w.add(words - 2).write(TAIL_CANARY);
      w.add(words - 1).write(base.as_ptr().addr());
      w.add(2).cast::<u8>().write_bytes(0, bytes - 4 * WORD);
      Ok(NonNull::new_unchecked(w.add(2).cast()))
    }
  }

  /// Checks the canaries of a guarded block, wipes it, and releases it.
  /// A zero `len` is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must come from [`Heap::allocate_guarded`] on this heap.
  pub unsafe fn release_guarded(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), HeapError> {
    if len == 0 {
      return Ok(());
    }
    let words = guarded_words(len).ok_or(HeapError::InvalidSize)?;
    unsafe {
      let w = ptr.as_ptr().cast::<usize>().sub(2);
      if w.add(1).read() != HEAD_CANARY {
        return Err(corrupted(Corruption::GuardHeadOverwritten));
      }
      if w.read() != len {
        return Err(corrupted(Corruption::GuardLengthMismatch));
      }
      if w.add(words - 2).read() != TAIL_CANARY || w.add(words - 1).read() != w.addr() {
        return Err(corrupted(Corruption::GuardTailOverwritten));
      }
      w.write_bytes(0, words);
      self.release(w.cast())
    }
  }

  /// [`Heap::release_guarded`] with the length taken from the block itself.
  ///
  /// # Safety
  ///
  /// As for [`Heap::release_guarded`].
  pub unsafe fn release_guarded_unsized(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
    unsafe {
      let len = ptr.as_ptr().cast::<usize>().sub(2).read();
      self.release_guarded(ptr, len)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::heap::tests::heap;

  #[test]
  fn guarded_round_trip() {
    let mut h = heap(1 << 20);
    let p = h.allocate_guarded(13).unwrap();
    let payload = unsafe { core::slice::from_raw_parts_mut(p.as_ptr(), 13) };
    assert!(payload.iter().all(|&b| b == 0));
    payload.fill(0x77);
    unsafe { h.release_guarded(p, 13).unwrap() };

    let q = h.allocate_guarded(100).unwrap();
    unsafe { h.release_guarded_unsized(q).unwrap() };
    h.verify().unwrap();
  }

  #[test]
  fn zero_length() {
    let mut h = heap(1 << 20);
    assert_eq!(h.allocate_guarded(0), Err(HeapError::InvalidSize));
    let p = h.allocate_guarded(8).unwrap();
    assert_eq!(unsafe { h.release_guarded(p, 0) }, Ok(()));
  }

  #[cfg(not(feature = "debug-tripwire"))]
  #[test]
  fn canary_violations_are_reported() {
    let mut h = heap(1 << 20);

    let p = h.allocate_guarded(16).unwrap();
    unsafe { p.as_ptr().add(16).write(1) };
    assert_eq!(
      unsafe { h.release_guarded(p, 16) },
      Err(HeapError::CorruptionDetected(Corruption::GuardTailOverwritten))
    );

    let p = h.allocate_guarded(16).unwrap();
    assert_eq!(
      unsafe { h.release_guarded(p, 24) },
      Err(HeapError::CorruptionDetected(Corruption::GuardLengthMismatch))
    );

    let p = h.allocate_guarded(16).unwrap();
    unsafe { p.as_ptr().cast::<usize>().sub(1).write(0) };
    assert_eq!(
      unsafe { h.release_guarded(p, 16) },
      Err(HeapError::CorruptionDetected(Corruption::GuardHeadOverwritten))
    );
  }

  #[cfg(not(feature = "debug-tripwire"))]
  #[test]
  fn second_release_is_caught_by_the_wiped_canary() {
    let mut h = heap(1 << 20);
    let p = h.allocate_guarded(8).unwrap();
    let _keep = h.allocate(8).unwrap();
    unsafe {
      h.release_guarded(p, 8).unwrap();
      assert_eq!(
        h.release_guarded(p, 8),
        Err(HeapError::CorruptionDetected(Corruption::GuardHeadOverwritten))
      );
    }
  }
}
