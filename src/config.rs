/// Self-check switches for a [`Heap`](crate::Heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
  /// Run the block codec self-test before reserving the arena.
  pub check_encoding: bool,
  /// Verify the whole heap after every mutating call. Only honoured in
  /// builds with debug assertions; a violation panics.
  pub check_heap: bool,
}

impl HeapConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn check_encoding(
    mut self,
    enabled: bool,
  ) -> Self {
    self.check_encoding = enabled;
    self
  }

  pub fn check_heap(
    mut self,
    enabled: bool,
  ) -> Self {
    self.check_heap = enabled;
    self
  }

  /// Whether the per-call heap verification actually runs in this build.
  pub(crate) fn heap_checks_enabled(&self) -> bool {
    cfg!(debug_assertions) && self.check_heap
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      check_encoding: cfg!(debug_assertions),
      check_heap: false,
    }
  }
}
