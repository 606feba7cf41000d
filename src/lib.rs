#![allow(clippy::missing_safety_doc)]
//! Segregated-heap allocator: one heap per processor plus a shared global heap, each holding
//! page-sized superblocks of power-of-two blocks.
//!
//! [`Context`] is the allocator itself and can be constructed over any [`Arena`] and
//! [`Fallback`]. [`Allocator`] wraps a lazily initialized process-wide context for use as the
//! `#[global_allocator]`:
//!
//! ```no_run
//! #[global_allocator]
//! static GLOBAL: hoardling::Allocator = hoardling::Allocator;
//! ```

use core::{
  alloc::{GlobalAlloc, Layout},
  mem::size_of,
  ptr::{self, null_mut},
  sync::atomic::{AtomicU32, Ordering},
};
use std::sync::OnceLock;

mod arena;
mod context;
mod error;
mod fallback;
mod heap;
mod lock;
mod size_class;
mod superblock;

pub use arena::{Arena, MmapArena};
pub use context::Context;
pub use error::Error;
pub use fallback::{Fallback, MmapFallback};
pub use heap::HeapStats;
pub use size_class::{CLASSES_COUNT, class_to_size, classify, size_class};

// =============================================================================
// Constants
// =============================================================================

pub const SUPERBLOCK_SIZE_BITS: usize = 12;
/// One arena page; every superblock is exactly this large and aligned to it.
pub const SUPERBLOCK_SIZE: usize = 1 << SUPERBLOCK_SIZE_BITS; // 4KB
const SUPERBLOCK_ALIGN_MASK: usize = !(SUPERBLOCK_SIZE - 1);
const SUPERBLOCK_HEADER_SIZE: usize = size_of::<superblock::Superblock>();
/// Bytes of a superblock available for blocks.
pub const SUPERBLOCK_USABLE: usize = SUPERBLOCK_SIZE - SUPERBLOCK_HEADER_SIZE;

/// Largest request served from superblocks; anything bigger goes to the fallback.
pub const MAX_SMALL_SIZE: usize = SUPERBLOCK_USABLE / 2;
/// Block data starts right after the header, which bounds the alignment blocks can promise.
const MAX_BLOCK_ALIGN: usize = SUPERBLOCK_HEADER_SIZE;

/// Occupancy buckets per heap.
pub const FULLNESS_GROUPS: usize = 4;
pub const SIZE_CLASS_BASE: usize = 2;
/// Smallest class (4-byte blocks): a block must hold a free-list index.
pub const SIZE_CLASS_MIN: usize = 2;
/// Local heaps per processor.
pub const HEAP_CPU_FACTOR: usize = 2;

/// A local heap returns a mostly-empty superblock to the global heap once more than this share
/// of its capacity is idle...
const RELEASE_THRESHOLD_PERCENT: usize = 25;
/// ...and the idle capacity exceeds one superblock.
const RELEASE_SLACK: usize = SUPERBLOCK_USABLE;

/// Address space reserved for the process-wide context.
pub const ARENA_RESERVE: usize = 1 << 30; // 1GB

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(SUPERBLOCK_SIZE.is_power_of_two());
const _: () = assert!(SUPERBLOCK_HEADER_SIZE == 64);
const _: () = assert!(SIZE_CLASS_BASE == 2); // block alignment relies on powers of two
const _: () = assert!(class_to_size(SIZE_CLASS_MIN) >= size_of::<superblock::BlockIndex>());
const _: () = assert!(class_to_size(CLASSES_COUNT - 1) <= SUPERBLOCK_USABLE);
const _: () = assert!(CLASSES_COUNT <= u8::MAX as usize);
const _: () = assert!(
  SUPERBLOCK_USABLE / class_to_size(SIZE_CLASS_MIN) < superblock::BLOCK_NONE as usize
);
const _: () = assert!(FULLNESS_GROUPS >= 2 && FULLNESS_GROUPS <= u8::MAX as usize);
const _: () = assert!(RELEASE_THRESHOLD_PERCENT < 100);
const _: () = assert!(ARENA_RESERVE % SUPERBLOCK_SIZE == 0);

// =============================================================================
// Platform
// =============================================================================

/// Stable per-thread identifier used to pick a local heap.
pub fn thread_id() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(0);
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }

  // For dynamic linking (LD_PRELOAD), TLS may be destroyed during exit.
  #[cfg(feature = "dynamic")]
  {
    TID.try_with(|&id| id).unwrap_or(0)
  }

  #[cfg(not(feature = "dynamic"))]
  {
    TID.with(|&id| id)
  }
}

// =============================================================================
// Process-wide context
// =============================================================================

static CONTEXT: OnceLock<Result<Context, Error>> = OnceLock::new();

/// Initializes the process-wide context on first call and returns it. Later calls return the
/// same context, or the same error.
pub fn init() -> Result<&'static Context, Error> {
  CONTEXT
    .get_or_init(|| Context::new(MmapArena::reserve(ARENA_RESERVE)?, MmapFallback))
    .as_ref()
    .map_err(|e| *e)
}

// =============================================================================
// GlobalAlloc
// =============================================================================

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    init()
      .ok()
      .and_then(|ctx| ctx.allocate_layout(layout))
      .map_or(null_mut(), |p| p.as_ptr())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if let Some(Ok(ctx)) = CONTEXT.get() {
      unsafe { ctx.free(ptr) };
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
      return unsafe {
        self.alloc(Layout::from_size_align_unchecked(
          new_size.max(1),
          layout.align(),
        ))
      };
    }

    // Same size class optimization (small only)
    let old_size = layout.size();
    let align = layout.align();
    if align <= MAX_BLOCK_ALIGN
      && old_size.max(align) <= MAX_SMALL_SIZE
      && new_size.max(align) <= MAX_SMALL_SIZE
      && size_class(old_size.max(align)) == size_class(new_size.max(align))
    {
      return ptr;
    }

    let new_ptr = unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, align)) };

    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }

    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

/// Alignment of every pointer returned through the C API (`max_align_t`).
const C_ALIGN: usize = 16;

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  unsafe { hoard_malloc(size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { hoard_free(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  static A: Allocator = Allocator;
  unsafe { A.alloc_zeroed(Layout::from_size_align_unchecked(total.max(1), C_ALIGN)) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return unsafe { hoard_malloc(size) };
  }

  if size == 0 {
    unsafe { hoard_free(ptr) };
    return null_mut();
  }

  let Ok(ctx) = init() else {
    return null_mut();
  };

  // Keep the block while it still fits and is at least half used.
  let old = unsafe { ctx.usable_size(ptr) };
  if size <= old && size > old / 2 {
    return ptr;
  }

  let new_ptr = unsafe { hoard_malloc(size) };

  if !new_ptr.is_null() {
    unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old.min(size)) };
    unsafe { ctx.free(ptr) };
  }

  new_ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> i32 {
  if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  static A: Allocator = Allocator;
  let ptr = unsafe { A.alloc(Layout::from_size_align_unchecked(size.max(1), alignment)) };

  if ptr.is_null() {
    return libc::ENOMEM;
  }

  unsafe { *memptr = ptr };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  match CONTEXT.get() {
    Some(Ok(ctx)) => unsafe { ctx.usable_size(ptr) },
    _ => 0,
  }
}

/// `malloc` on the process-wide context.
pub unsafe fn hoard_malloc(size: usize) -> *mut u8 {
  static A: Allocator = Allocator;
  unsafe { A.alloc(Layout::from_size_align_unchecked(size.max(1), C_ALIGN)) }
}

/// `free` on the process-wide context.
pub unsafe fn hoard_free(ptr: *mut u8) {
  static A: Allocator = Allocator;
  unsafe { A.dealloc(ptr, Layout::from_size_align_unchecked(1, 1)) }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn align_up_rounds_to_multiples() {
    assert_eq!(align_up(0, 4096), 0);
    assert_eq!(align_up(1, 4096), 4096);
    assert_eq!(align_up(4096, 4096), 4096);
    assert_eq!(align_up(4097, 16), 4112);
  }

  #[test]
  fn thread_ids_are_stable_and_distinct() {
    let here = thread_id();
    assert_eq!(thread_id(), here);
    let there = std::thread::spawn(thread_id).join().unwrap();
    assert_ne!(here, there);
  }

  #[test]
  fn global_context_is_shared() {
    let a = init().unwrap();
    let b = init().unwrap();
    assert!(core::ptr::eq(a, b));

    unsafe {
      let p = hoard_malloc(24);
      assert!(!p.is_null());
      assert_eq!(p as usize % C_ALIGN, 0);
      assert!(a.arena().contains(p));
      hoard_free(p);
    }
  }

  #[test]
  fn realloc_keeps_block_within_class() {
    let a = Allocator;
    unsafe {
      let layout = Layout::from_size_align(40, 8).unwrap();
      let p = a.alloc(layout);
      p.write_bytes(7, 40);
      assert_eq!(a.realloc(p, layout, 60), p);

      let grown = a.realloc(p, layout, 500);
      assert_ne!(grown, p);
      assert!((0..40).all(|i| *grown.add(i) == 7));
      a.dealloc(grown, Layout::from_size_align(500, 8).unwrap());

      let z = a.alloc_zeroed(Layout::from_size_align(3000, 8).unwrap());
      assert!((0..3000).all(|i| *z.add(i) == 0));
      a.dealloc(z, Layout::from_size_align(3000, 8).unwrap());
    }
  }
}
