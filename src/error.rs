use thiserror::Error;

/// Failures while bringing up an allocator context.
///
/// Allocation itself never produces one of these: running out of arena space is reported as a
/// null pointer so the caller can free memory and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
  #[error("failed to reserve {0} bytes of address space for the arena")]
  Reserve(usize),
  #[error("arena exhausted while carving the {0}-byte heap table")]
  HeapTable(usize),
  #[error("arena page size {found} does not match the superblock size {expected}")]
  PageSize { found: usize, expected: usize },
  #[error("arena region at {0:#x} is not superblock-aligned")]
  Misaligned(usize),
}
