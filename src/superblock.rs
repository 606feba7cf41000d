//! Superblocks: one arena page carved into equal blocks of a single size class.
//!
//! ```text
//! +----------------+---------+---------+-----+---------+-------+
//! | header (64 B)  | block 0 | block 1 | ... | block n | slack |
//! +----------------+---------+---------+-----+---------+-------+
//! ^ page aligned   ^ data start (64-aligned)
//! ```
//!
//! Blocks below the high-water mark are either live or on the intrusive free list, whose links are
//! 32-bit block indices stored in the freed blocks themselves. Blocks at or above the mark have
//! never been handed out.

use core::{
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
  FULLNESS_GROUPS, SUPERBLOCK_ALIGN_MASK, SUPERBLOCK_HEADER_SIZE, SUPERBLOCK_SIZE, heap::Heap,
  size_class::class_to_size,
};

/// Index of a block relative to its superblock's data start.
pub(crate) type BlockIndex = u32;

/// Free-list terminator.
pub(crate) const BLOCK_NONE: BlockIndex = BlockIndex::MAX;

/// Marks a page that has been formatted as a superblock at least once.
const SUPERBLOCK_MAGIC: u32 = 0x484F_4152; // "HOAR"

/// Superblock metadata. Sits at offset 0 of each arena page.
#[repr(C, align(64))]
pub(crate) struct Superblock {
  /// Heap whose bucket list holds this superblock. Written under both heaps' locks, read racily
  /// by the free path before it knows which lock to take.
  owner: AtomicPtr<Heap>,
  /// Bucket list links (owner's lock).
  pub(crate) prev: *mut Superblock,
  pub(crate) next: *mut Superblock,
  block_size: u32,
  capacity: u32,
  used: u32,
  /// High-water mark: first never-allocated block.
  next_block: BlockIndex,
  /// Head of the free list.
  next_free: BlockIndex,
  magic: u32,
  class: u8,
  /// Bucket this superblock is currently linked into.
  pub(crate) group: u8,
}

impl Superblock {
  /// Formats the page at `sb` for `class`. The previous header contents, if any, are discarded,
  /// so the page must not be linked into any heap and must hold no live blocks.
  pub(crate) unsafe fn format(sb: *mut Superblock, class: usize) {
    let block_size = class_to_size(class);
    let capacity = (SUPERBLOCK_SIZE - SUPERBLOCK_HEADER_SIZE) / block_size;
    debug_assert!(capacity > 0, "class {class} does not fit a superblock");
    debug_assert!(sb as usize & !SUPERBLOCK_ALIGN_MASK == 0, "unaligned superblock {sb:p}");

    unsafe {
      ptr::write(
        sb,
        Superblock {
          owner: AtomicPtr::new(null_mut()),
          prev: null_mut(),
          next: null_mut(),
          block_size: block_size as u32,
          capacity: capacity as u32,
          used: 0,
          next_block: 0,
          next_free: BLOCK_NONE,
          magic: SUPERBLOCK_MAGIC,
          class: class as u8,
          group: 0,
        },
      )
    };
  }

  /// Superblock enclosing `ptr`: superblocks are page-sized and page-aligned.
  #[inline]
  pub(crate) fn containing(ptr: *const u8) -> *mut Superblock {
    (ptr as usize & SUPERBLOCK_ALIGN_MASK) as *mut Superblock
  }

  #[inline]
  pub(crate) fn is_formatted(&self) -> bool {
    self.magic == SUPERBLOCK_MAGIC
  }

  #[inline]
  pub(crate) fn owner(&self) -> *mut Heap {
    self.owner.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn set_owner(&self, heap: *const Heap) {
    self.owner.store(heap as *mut Heap, Ordering::Release);
  }

  #[inline]
  pub(crate) fn class(&self) -> usize {
    self.class as usize
  }

  #[inline]
  pub(crate) fn block_size(&self) -> usize {
    self.block_size as usize
  }

  #[inline]
  pub(crate) fn used(&self) -> usize {
    self.used as usize
  }

  #[inline]
  pub(crate) fn capacity(&self) -> usize {
    self.capacity as usize
  }

  #[inline]
  pub(crate) fn is_full(&self) -> bool {
    self.used >= self.capacity
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.used == 0
  }

  /// Bytes handed out from this superblock.
  #[inline]
  pub(crate) fn used_bytes(&self) -> usize {
    self.used() * self.block_size()
  }

  /// Bytes this superblock can hand out in total.
  #[inline]
  pub(crate) fn capacity_bytes(&self) -> usize {
    self.capacity() * self.block_size()
  }

  /// Occupancy quartile: 0 = mostly empty, `FULLNESS_GROUPS - 1` = (almost) full.
  #[inline]
  pub(crate) fn fullness_group(&self) -> usize {
    let group = self.used() * FULLNESS_GROUPS / self.capacity();
    group.min(FULLNESS_GROUPS - 1)
  }

  /// Address of block 0.
  #[inline]
  fn data_start(&self) -> usize {
    self as *const Self as usize + SUPERBLOCK_HEADER_SIZE
  }

  /// Pointer to block `idx`, derived from the page pointer `sb` so it may be written through.
  #[inline]
  unsafe fn block_ptr(sb: NonNull<Superblock>, idx: BlockIndex) -> *mut u8 {
    let (capacity, block_size) = unsafe { ((*sb.as_ptr()).capacity, (*sb.as_ptr()).block_size()) };
    debug_assert!(idx < capacity, "block {idx} out of {capacity}");
    unsafe {
      sb.as_ptr()
        .cast::<u8>()
        .add(SUPERBLOCK_HEADER_SIZE + idx as usize * block_size)
    }
  }

  /// Index of the block starting at `ptr`, or `None` if `ptr` is not the start of a block that
  /// has ever been handed out.
  pub(crate) fn block_index(&self, ptr: *const u8) -> Option<BlockIndex> {
    let offset = (ptr as usize).checked_sub(self.data_start())?;
    if offset % self.block_size() != 0 {
      return None;
    }
    let idx = offset / self.block_size();
    (idx < self.next_block as usize).then_some(idx as BlockIndex)
  }

  /// Hands out a block of the superblock at `sb`: free list first, then the high-water mark.
  /// `None` when full.
  ///
  /// `sb` must point to a formatted superblock with provenance over its whole page, and nothing
  /// else may access its header concurrently.
  pub(crate) unsafe fn allocate_block(sb: NonNull<Superblock>) -> Option<NonNull<u8>> {
    let s = sb.as_ptr();
    unsafe {
      if (*s).is_full() {
        return None;
      }

      let idx = if (*s).next_free != BLOCK_NONE {
        let idx = (*s).next_free;
        (*s).next_free = Self::block_ptr(sb, idx).cast::<BlockIndex>().read();
        idx
      } else {
        let idx = (*s).next_block;
        (*s).next_block += 1;
        idx
      };

      (*s).used += 1;
      NonNull::new(Self::block_ptr(sb, idx))
    }
  }

  /// Returns block `idx` to the free list of the superblock at `sb`. Its contents are overwritten
  /// with the list link. Same requirements on `sb` as [`Superblock::allocate_block`].
  pub(crate) unsafe fn free_block(sb: NonNull<Superblock>, idx: BlockIndex) {
    let s = sb.as_ptr();
    unsafe {
      debug_assert!((*s).used > 0, "free_block: used underflow in {s:p}");
      debug_assert!((*s).next_block > idx, "free_block: block {idx} never allocated");

      Self::block_ptr(sb, idx).cast::<BlockIndex>().write((*s).next_free);
      (*s).next_free = idx;
      (*s).used -= 1;
    }
  }
}
