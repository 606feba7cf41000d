//! The allocator context: heap table plus the allocation and deallocation engines.
//!
//! Lock order is fixed: a thread holds at most its local heap (or, when freeing, the superblock's
//! owner) and then the global heap. The global heap is never held while acquiring another heap.

use core::{alloc::Layout, mem::size_of, ptr::NonNull};

use crate::{
  Error, HEAP_CPU_FACTOR, MAX_BLOCK_ALIGN, MAX_SMALL_SIZE, SUPERBLOCK_ALIGN_MASK, SUPERBLOCK_SIZE,
  align_up,
  arena::{Arena, MmapArena},
  fallback::{Fallback, MmapFallback},
  heap::{Heap, HeapGuard, HeapStats},
  size_class::classify,
  superblock::Superblock,
  thread_id,
};

/// Index of the global heap in the heap table.
const GLOBAL_HEAP: usize = 0;

/// An allocator instance: one global heap plus `processors * HEAP_CPU_FACTOR` local heaps, all
/// backed by one arena.
///
/// The heap table lives in the first pages of the arena, so a context never allocates from
/// anywhere but its own arena and fallback.
pub struct Context<A: Arena = MmapArena, F: Fallback = MmapFallback> {
  arena: A,
  fallback: F,
  /// `locals + 1` heaps; index 0 is the global heap.
  heaps: NonNull<Heap>,
  locals: usize,
  /// First byte past the heap table.
  blocks_base: usize,
}

unsafe impl<A: Arena, F: Fallback> Send for Context<A, F> {}
unsafe impl<A: Arena, F: Fallback> Sync for Context<A, F> {}

impl<A: Arena, F: Fallback> Context<A, F> {
  /// Carves the heap table out of `arena` and initializes every heap.
  pub fn new(arena: A, fallback: F) -> Result<Self, Error> {
    let page = arena.page_size();
    if page != SUPERBLOCK_SIZE {
      return Err(Error::PageSize {
        found: page,
        expected: SUPERBLOCK_SIZE,
      });
    }

    let locals = arena.processor_count().max(1) * HEAP_CPU_FACTOR;
    let table_size = align_up(size_of::<Heap>() * (locals + 1), SUPERBLOCK_SIZE);
    let table = arena.grow(table_size).ok_or(Error::HeapTable(table_size))?;
    if table.as_ptr() as usize & !SUPERBLOCK_ALIGN_MASK != 0 {
      return Err(Error::Misaligned(table.as_ptr() as usize));
    }

    let heaps = table.cast::<Heap>();
    for index in 0..=locals {
      unsafe { heaps.as_ptr().add(index).write(Heap::new(index)) };
    }

    Ok(Self {
      arena,
      fallback,
      heaps,
      locals,
      blocks_base: table.as_ptr() as usize + table_size,
    })
  }

  pub fn arena(&self) -> &A {
    &self.arena
  }

  pub fn fallback(&self) -> &F {
    &self.fallback
  }

  /// Number of local heaps (the global heap not included).
  pub fn heap_count(&self) -> usize {
    self.locals
  }

  /// Start of the block-bearing part of the arena.
  pub fn blocks_base(&self) -> *const u8 {
    self.blocks_base as *const u8
  }

  /// Local heap serving `thread_id`.
  #[inline]
  pub fn heap_index(&self, thread_id: u32) -> usize {
    1 + thread_id as usize % self.locals
  }

  /// Local heap serving the calling thread.
  #[inline]
  pub fn current_heap_index(&self) -> usize {
    self.heap_index(thread_id())
  }

  /// Counters of heap `index` (0 = global), or `None` past the table.
  pub fn stats(&self, index: usize) -> Option<HeapStats> {
    (index <= self.locals).then(|| self.heap(index).lock().stats())
  }

  /// Counters summed over every heap. Heaps are locked one at a time, so under concurrent use
  /// the sum is not a single consistent snapshot.
  pub fn total_stats(&self) -> HeapStats {
    let mut total = HeapStats::default();
    for index in 0..=self.locals {
      total += self.heap(index).lock().stats();
    }
    total
  }

  /// Allocates `size` bytes. `None` only when the arena (or the fallback) is out of memory.
  #[inline]
  pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
    self.allocate_layout(Layout::from_size_align(size, 1).ok()?)
  }

  /// Allocates memory fitting `layout`. Blocks of class `c` are aligned to `min(2^c, 64)`, so
  /// small requests with modest alignment are served from superblocks by classifying
  /// `max(size, align)`.
  pub fn allocate_layout(&self, layout: Layout) -> Option<NonNull<u8>> {
    let size = layout.size().max(layout.align());
    if size <= MAX_SMALL_SIZE && layout.align() <= MAX_BLOCK_ALIGN {
      return self.allocate_small(size);
    }
    NonNull::new(unsafe { self.fallback.allocate(layout) })
  }

  /// Releases `ptr`. Null is a no-op; pointers outside the arena go to the fallback.
  ///
  /// # Safety
  ///
  /// `ptr` must come from this context and not have been freed since. Invalid pointers inside
  /// the arena are detected and ignored (or abort with `debug-tripwire`); invalid pointers
  /// elsewhere, double frees and `trusted-free` builds are undefined.
  pub unsafe fn free(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    if !self.arena.contains(ptr) {
      unsafe { self.fallback.deallocate(ptr) };
      return;
    }

    let sb = Superblock::containing(ptr);
    #[cfg(not(feature = "trusted-free"))]
    if !self.is_superblock(sb) {
      invalid_free(ptr);
      return;
    }

    let Some(mut owner) = (unsafe { self.lock_owner(sb) }) else {
      invalid_free(ptr);
      return;
    };
    // Safety: `lock_owner` saw a heap back-reference, so `sb` is a formatted superblock.
    let sb = unsafe { NonNull::new_unchecked(sb) };
    let Some(idx) = (unsafe { sb.as_ref() }).block_index(ptr) else {
      drop(owner);
      invalid_free(ptr);
      return;
    };

    unsafe { owner.free_to(sb, idx) };

    if owner.heap().index() == GLOBAL_HEAP
      || !owner.should_release()
      || unsafe { sb.as_ref() }.fullness_group() != 0
    {
      return;
    }

    // Owner before global.
    let mut global = self.global().lock();
    unsafe { owner.transfer(&mut global, sb) };
  }

  /// Bytes usable at `ptr`.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this context.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    if ptr.is_null() {
      0
    } else if self.arena.contains(ptr) {
      unsafe { (*Superblock::containing(ptr)).block_size() }
    } else {
      unsafe { self.fallback.usable_size(ptr) }
    }
  }

  #[inline]
  fn heap(&self, index: usize) -> &Heap {
    debug_assert!(index <= self.locals, "heap {index} out of {}", self.locals);
    unsafe { &*self.heaps.as_ptr().add(index) }
  }

  #[inline]
  fn global(&self) -> &Heap {
    self.heap(GLOBAL_HEAP)
  }

  /// Maps a superblock's owner back-reference to a heap of this table.
  fn heap_at(&self, heap: *mut Heap) -> Option<&Heap> {
    let offset = (heap as usize).checked_sub(self.heaps.as_ptr() as usize)?;
    let index = offset / size_of::<Heap>();
    (offset % size_of::<Heap>() == 0 && index <= self.locals).then(|| self.heap(index))
  }

  /// `sb` is a formatted superblock page rather than the heap table or untouched arena space.
  #[cfg(not(feature = "trusted-free"))]
  fn is_superblock(&self, sb: *mut Superblock) -> bool {
    let addr = sb as usize;
    if addr >= self.heaps.as_ptr() as usize && addr < self.blocks_base {
      return false;
    }
    unsafe { (*sb).is_formatted() }
  }

  fn allocate_small(&self, size: usize) -> Option<NonNull<u8>> {
    let (class, _) = classify(size);
    let mut local = self.heap(self.current_heap_index()).lock();

    let sb = match local.find(class) {
      Some(sb) => sb,
      None => self.refill(&mut local, class)?,
    };
    unsafe { local.allocate_from(sb) }
  }

  /// Gives `local` a superblock with room for `class`: a matching one from the global heap, else
  /// an empty global one reformatted for `class`, else a fresh page from the arena.
  #[inline(never)]
  fn refill(&self, local: &mut HeapGuard<'_>, class: usize) -> Option<NonNull<Superblock>> {
    debug_assert_ne!(local.heap().index(), GLOBAL_HEAP);

    // Local before global.
    let mut global = self.global().lock();

    if !global.is_full() {
      if let Some(sb) = global.find(class) {
        unsafe { global.transfer(local, sb) };
        return Some(sb);
      }

      if let Some(sb) = global.find_empty() {
        unsafe {
          global.detach(sb);
          Superblock::format(sb.as_ptr(), class);
          local.attach(sb);
        }
        return Some(sb);
      }
    }

    let sb = self.arena.grow(SUPERBLOCK_SIZE)?.cast::<Superblock>();
    debug_assert!(
      sb.as_ptr() as usize & !SUPERBLOCK_ALIGN_MASK == 0,
      "arena returned unaligned superblock {:p}",
      sb
    );
    unsafe {
      Superblock::format(sb.as_ptr(), class);
      local.attach(sb);
    }
    Some(sb)
  }

  /// Locks the heap owning `sb`. The owner can change until its lock is held, so the
  /// back-reference is re-checked after locking.
  unsafe fn lock_owner(&self, sb: *mut Superblock) -> Option<HeapGuard<'_>> {
    loop {
      let owner = unsafe { (*sb).owner() };
      let heap = self.heap_at(owner)?;
      let guard = heap.lock();
      if unsafe { (*sb).owner() } == owner {
        return Some(guard);
      }
    }
  }
}

#[cold]
#[inline(never)]
fn invalid_free(ptr: *mut u8) {
  #[cfg(feature = "debug-tripwire")]
  {
    let _ = ptr;
    unsafe { libc::abort() };
  }

  // Undefined input: ignored.
  #[cfg(not(feature = "debug-tripwire"))]
  let _ = ptr;
}
