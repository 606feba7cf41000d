//! Allocator for requests too large (or too aligned) for a superblock.

use core::{alloc::Layout, mem::size_of, ptr::null_mut};

use crate::{align_up, arena::os_mmap};

/// Backing allocator for requests superblocks cannot serve.
///
/// # Safety
///
/// `allocate` must return memory satisfying `layout` (or null), and none of it may lie inside the
/// arena range of the context it is paired with.
pub unsafe trait Fallback: Send + Sync {
  unsafe fn allocate(&self, layout: Layout) -> *mut u8;

  /// Releases a pointer returned by `allocate`. Pointers it does not recognize are ignored.
  unsafe fn deallocate(&self, ptr: *mut u8);

  /// Bytes usable at `ptr`, which must come from `allocate`.
  unsafe fn usable_size(&self, ptr: *mut u8) -> usize;
}

/// Magic number to identify valid mapping headers
const MAPPING_MAGIC: u64 = 0x484F_4152_444D_4150; // "HOARDMAP"
const MAPPING_HEADER_SIZE: usize = size_of::<MappingHeader>();
/// Alignment every fallback pointer gets regardless of the layout.
const MAPPING_MIN_ALIGN: usize = 16;

const _: () = assert!(MAPPING_HEADER_SIZE % MAPPING_MIN_ALIGN == 0);

/// Sits immediately before every pointer handed out by [`MmapFallback`].
#[repr(C, align(16))]
struct MappingHeader {
  /// Original mmap base (for munmap).
  base: *mut u8,
  /// Total mmap size.
  len: usize,
  /// Requested size.
  size: usize,
  magic: u64,
}

/// One private mapping per request. Never calls `malloc`, so it is safe to use when this crate
/// itself provides `malloc`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MmapFallback;

unsafe impl Fallback for MmapFallback {
  unsafe fn allocate(&self, layout: Layout) -> *mut u8 {
    let align = layout.align().max(MAPPING_MIN_ALIGN);
    let total = match layout
      .size()
      .checked_add(MAPPING_HEADER_SIZE)
      .and_then(|v| v.checked_add(align))
    {
      Some(v) => v,
      None => return null_mut(),
    };

    let raw = unsafe { os_mmap(total) };
    if raw.is_null() {
      return null_mut();
    }

    // Place header so that returned pointer is aligned.
    let user = align_up(raw as usize + MAPPING_HEADER_SIZE, align);
    let header = (user - MAPPING_HEADER_SIZE) as *mut MappingHeader;

    unsafe {
      header.write(MappingHeader {
        base: raw,
        len: total,
        size: layout.size(),
        magic: MAPPING_MAGIC,
      });
    }
    user as *mut u8
  }

  unsafe fn deallocate(&self, ptr: *mut u8) {
    let Some(header) = (unsafe { header_of(ptr) }) else {
      // It's a foreign pointer, is ignored.
      return;
    };
    unsafe {
      (*header).magic = 0;
      libc::munmap((*header).base.cast(), (*header).len);
    }
  }

  unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    match unsafe { header_of(ptr) } {
      Some(header) => unsafe { (*header).base as usize + (*header).len - ptr as usize },
      None => 0,
    }
  }
}

unsafe fn header_of(ptr: *mut u8) -> Option<*mut MappingHeader> {
  if ptr.is_null() || (ptr as usize) % MAPPING_MIN_ALIGN != 0 {
    return None;
  }
  let header = (ptr as usize - MAPPING_HEADER_SIZE) as *mut MappingHeader;
  (unsafe { (*header).magic } == MAPPING_MAGIC).then_some(header)
}
