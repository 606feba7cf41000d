//! Raw memory supply: a contiguous, monotonically growing address range.

use core::ptr::{NonNull, null_mut};

use crate::{Error, SUPERBLOCK_SIZE, align_up, lock::Lock};

/// Provider of the address range superblocks are carved from.
///
/// # Safety
///
/// `grow` must return `SUPERBLOCK_SIZE`-aligned, readable and writable regions of at least the
/// requested size that are never handed out twice and never unmapped while the allocator lives.
/// `contains` must be true for every byte of every region `grow` returned, and false for
/// pointers owned by the fallback allocator. Every address `contains` accepts must be readable,
/// since freeing inspects the page around it.
pub unsafe trait Arena: Send + Sync {
  /// Extends the arena by `bytes` (a multiple of the page size), returning the start of the new
  /// region, or `None` when the range is exhausted.
  fn grow(&self, bytes: usize) -> Option<NonNull<u8>>;

  /// Whether `ptr` falls inside the arena's address range.
  fn contains(&self, ptr: *const u8) -> bool;

  fn page_size(&self) -> usize {
    SUPERBLOCK_SIZE
  }

  fn processor_count(&self) -> usize;
}

/// Arena backed by one up-front anonymous reservation.
///
/// The reservation uses `MAP_NORESERVE`, so untouched pages cost nothing. Growth bumps a break
/// offset under a single lock shared by every heap.
pub struct MmapArena {
  /// Superblock-aligned start of the usable range.
  base: *mut u8,
  capacity: usize,
  /// Offset of the first byte not yet handed out.
  brk: Lock<usize>,
  processors: usize,
  /// Original mapping (for munmap).
  map_base: *mut u8,
  map_size: usize,
}

unsafe impl Send for MmapArena {}
unsafe impl Sync for MmapArena {}

impl MmapArena {
  /// Reserves `capacity` bytes (rounded up to whole superblocks) of address space.
  pub fn reserve(capacity: usize) -> Result<Self, Error> {
    let capacity = align_up(capacity, SUPERBLOCK_SIZE);
    // Over-allocate for alignment padding.
    let map_size = capacity
      .checked_add(SUPERBLOCK_SIZE)
      .ok_or(Error::Reserve(capacity))?;
    let map_base = unsafe { os_mmap(map_size) };
    if map_base.is_null() {
      return Err(Error::Reserve(capacity));
    }

    Ok(Self {
      base: align_up(map_base as usize, SUPERBLOCK_SIZE) as *mut u8,
      capacity,
      brk: Lock::new(0),
      processors: online_processors(),
      map_base,
      map_size,
    })
  }

  /// Overrides the processor count reported to the allocator.
  pub fn with_processor_count(mut self, processors: usize) -> Self {
    self.processors = processors.max(1);
    self
  }

  /// Bytes handed out so far.
  pub fn used(&self) -> usize {
    *self.brk.lock()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }
}

unsafe impl Arena for MmapArena {
  fn grow(&self, bytes: usize) -> Option<NonNull<u8>> {
    let bytes = align_up(bytes, SUPERBLOCK_SIZE);
    let mut brk = self.brk.lock();
    let end = brk.checked_add(bytes)?;
    if end > self.capacity {
      return None;
    }
    let region = unsafe { self.base.add(*brk) };
    *brk = end;
    NonNull::new(region)
  }

  #[inline]
  fn contains(&self, ptr: *const u8) -> bool {
    let base = self.base as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + self.capacity
  }

  fn processor_count(&self) -> usize {
    self.processors
  }
}

impl Drop for MmapArena {
  fn drop(&mut self) {
    unsafe { libc::munmap(self.map_base.cast(), self.map_size) };
  }
}

/// Maps `size` bytes of private anonymous memory, or null on failure.
pub(crate) unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

fn online_processors() -> usize {
  let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
  if n < 1 { 1 } else { n as usize }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn grows_monotonically_in_aligned_pages() {
    let arena = MmapArena::reserve(4 * SUPERBLOCK_SIZE - 1).unwrap();
    assert_eq!(arena.capacity(), 4 * SUPERBLOCK_SIZE);
    let a = arena.grow(1).unwrap();
    let b = arena.grow(SUPERBLOCK_SIZE).unwrap();
    assert_eq!(a.as_ptr() as usize % SUPERBLOCK_SIZE, 0);
    assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, SUPERBLOCK_SIZE);
    assert_eq!(arena.used(), 2 * SUPERBLOCK_SIZE);
    assert!(arena.contains(a.as_ptr()));
    assert!(arena.contains(unsafe { b.as_ptr().add(SUPERBLOCK_SIZE - 1) }));
  }

  #[test]
  fn exhaustion_returns_none_and_keeps_break() {
    let arena = MmapArena::reserve(2 * SUPERBLOCK_SIZE).unwrap();
    assert!(arena.grow(3 * SUPERBLOCK_SIZE).is_none());
    assert_eq!(arena.used(), 0);
    assert!(arena.grow(2 * SUPERBLOCK_SIZE).is_some());
    assert!(arena.grow(1).is_none());
  }

  #[test]
  fn foreign_pointers_are_outside() {
    let arena = MmapArena::reserve(SUPERBLOCK_SIZE).unwrap();
    let local = 0u64;
    assert!(!arena.contains(&local as *const u64 as *const u8));
    assert!(!arena.contains(core::ptr::null()));
  }

  #[test]
  fn processor_count_is_positive() {
    let arena = MmapArena::reserve(SUPERBLOCK_SIZE).unwrap();
    assert!(arena.processor_count() >= 1);
    assert_eq!(arena.with_processor_count(0).processor_count(), 1);
  }
}
