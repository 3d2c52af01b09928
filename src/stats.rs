use core::fmt;

/// Snapshot of heap usage, in the shape of the classic `mallinfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
  /// Bytes obtained by extending the arena (including page-mapped extensions).
  pub system_bytes: usize,
  /// Free chunks in regular bins, plus top.
  pub free_chunks: usize,
  /// Chunks sitting in fastbins.
  pub fastbin_chunks: usize,
  /// Live page-mapped chunks.
  pub mapped_regions: usize,
  pub mapped_bytes: usize,
  /// Highest `system_bytes + mapped_bytes` ever reached.
  pub peak_bytes: usize,
  pub fastbin_bytes: usize,
  /// Arena bytes not available for reuse.
  pub in_use_bytes: usize,
  /// Arena bytes free, including fastbins and top.
  pub free_bytes: usize,
  /// Releasable size of top.
  pub top_bytes: usize,
}

impl fmt::Display for Statistics {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "max system bytes = {:>10}", self.peak_bytes)?;
    writeln!(f, "system bytes     = {:>10}", self.system_bytes + self.mapped_bytes)?;
    write!(f, "in use bytes     = {:>10}", self.in_use_bytes + self.mapped_bytes)
  }
}

/// Running totals maintained by growth, trim, and page mapping.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
  pub sbrked_mem: usize,
  pub max_sbrked_mem: usize,
  pub mmapped_mem: usize,
  pub max_mmapped_mem: usize,
  pub n_mmaps: usize,
  pub max_n_mmaps: usize,
  pub max_total_mem: usize,
}

impl Counters {
  pub const fn new() -> Self {
    Self {
      sbrked_mem: 0,
      max_sbrked_mem: 0,
      mmapped_mem: 0,
      max_mmapped_mem: 0,
      n_mmaps: 0,
      max_n_mmaps: 0,
      max_total_mem: 0,
    }
  }

  /// Refreshes the high-water marks.
  pub fn update_peaks(&mut self) {
    self.max_sbrked_mem = self.max_sbrked_mem.max(self.sbrked_mem);
    self.max_mmapped_mem = self.max_mmapped_mem.max(self.mmapped_mem);
    self.max_n_mmaps = self.max_n_mmaps.max(self.n_mmaps);
    self.max_total_mem = self.max_total_mem.max(self.sbrked_mem + self.mmapped_mem);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn display_matches_malloc_stats_layout() {
    let stats = Statistics {
      system_bytes: 4096,
      mapped_bytes: 8192,
      in_use_bytes: 100,
      peak_bytes: 20000,
      ..Default::default()
    };
    let text = stats.to_string();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "max system bytes =      20000");
    assert_eq!(lines[1], "system bytes     =      12288");
    assert_eq!(lines[2], "in use bytes     =       8292");
  }

  #[test]
  fn peaks_only_grow() {
    let mut c = Counters::new();
    c.sbrked_mem = 100;
    c.mmapped_mem = 50;
    c.n_mmaps = 1;
    c.update_peaks();
    c.sbrked_mem = 10;
    c.mmapped_mem = 0;
    c.n_mmaps = 0;
    c.update_peaks();
    assert_eq!(c.max_sbrked_mem, 100);
    assert_eq!(c.max_mmapped_mem, 50);
    assert_eq!(c.max_n_mmaps, 1);
    assert_eq!(c.max_total_mem, 150);
  }
}
