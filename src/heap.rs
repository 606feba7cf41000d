//! Heaps: lock-protected sets of superblocks bucketed by fullness.

use core::ptr::{NonNull, null_mut};

use crate::{
  FULLNESS_GROUPS, RELEASE_SLACK, RELEASE_THRESHOLD_PERCENT,
  lock::{Lock, LockGuard},
  superblock::{BlockIndex, Superblock},
};

/// Snapshot of a heap's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Bytes in live blocks.
  pub used: usize,
  /// Bytes of block capacity across member superblocks.
  pub allocated: usize,
  /// Member superblocks per fullness group. Full superblocks count in the top group.
  pub superblocks: [usize; FULLNESS_GROUPS],
}

impl HeapStats {
  pub fn superblock_count(&self) -> usize {
    self.superblocks.iter().sum()
  }
}

impl core::ops::AddAssign for HeapStats {
  fn add_assign(&mut self, rhs: Self) {
    self.used += rhs.used;
    self.allocated += rhs.allocated;
    for (a, b) in self.superblocks.iter_mut().zip(rhs.superblocks) {
      *a += b;
    }
  }
}

/// List holding superblocks with no free block. Never searched.
const FULL_LIST: usize = FULLNESS_GROUPS;

pub(crate) struct HeapState {
  used: usize,
  allocated: usize,
  /// Doubly linked superblock lists, indexed by fullness group, plus [`FULL_LIST`].
  buckets: [*mut Superblock; FULLNESS_GROUPS + 1],
}

// Superblocks reachable from the buckets are only touched under the heap lock.
unsafe impl Send for HeapState {}

pub(crate) struct Heap {
  index: usize,
  state: Lock<HeapState>,
}

impl Heap {
  pub(crate) const fn new(index: usize) -> Self {
    Self {
      index,
      state: Lock::new(HeapState {
        used: 0,
        allocated: 0,
        buckets: [null_mut(); FULLNESS_GROUPS + 1],
      }),
    }
  }

  #[inline]
  pub(crate) fn index(&self) -> usize {
    self.index
  }

  #[inline]
  pub(crate) fn lock(&self) -> HeapGuard<'_> {
    HeapGuard {
      heap: self,
      state: self.state.lock(),
    }
  }
}

/// A locked heap. Every superblock and bucket mutation goes through one of these.
pub(crate) struct HeapGuard<'a> {
  heap: &'a Heap,
  state: LockGuard<'a, HeapState>,
}

impl<'a> HeapGuard<'a> {
  #[inline]
  pub(crate) fn heap(&self) -> &'a Heap {
    self.heap
  }

  /// No member superblock has a free block.
  #[inline]
  pub(crate) fn is_full(&self) -> bool {
    self.state.used >= self.state.allocated
  }

  /// Enough idle capacity that the heap should hand mostly-empty superblocks back to the
  /// global heap.
  pub(crate) fn should_release(&self) -> bool {
    let idle = self.state.allocated - self.state.used;
    idle > RELEASE_SLACK && idle * 100 > self.state.allocated * RELEASE_THRESHOLD_PERCENT
  }

  /// First superblock of `class` with a free block, scanning from the fullest bucket down.
  pub(crate) fn find(&self, class: usize) -> Option<NonNull<Superblock>> {
    for group in (0..FULLNESS_GROUPS).rev() {
      let mut sb = self.state.buckets[group];
      while let Some(cur) = NonNull::new(sb) {
        let s = unsafe { cur.as_ref() };
        debug_assert!(!s.is_full(), "full superblock {cur:p} in bucket {group}");
        if s.class() == class {
          return Some(cur);
        }
        sb = s.next;
      }
    }
    None
  }

  /// Any superblock with no live blocks, regardless of class.
  pub(crate) fn find_empty(&self) -> Option<NonNull<Superblock>> {
    let mut sb = self.state.buckets[0];
    while let Some(cur) = NonNull::new(sb) {
      let s = unsafe { cur.as_ref() };
      if s.is_empty() {
        return Some(cur);
      }
      sb = s.next;
    }
    None
  }

  /// Takes a block from `sb`, which must belong to this heap.
  pub(crate) unsafe fn allocate_from(&mut self, sb: NonNull<Superblock>) -> Option<NonNull<u8>> {
    debug_assert!(
      core::ptr::eq(unsafe { sb.as_ref() }.owner(), self.heap),
      "allocate_from: foreign superblock"
    );
    let block = unsafe { Superblock::allocate_block(sb) }?;
    self.state.used += unsafe { sb.as_ref() }.block_size();
    unsafe { self.rebucket(sb) };
    Some(block)
  }

  /// Returns block `idx` to `sb`, which must belong to this heap.
  pub(crate) unsafe fn free_to(&mut self, sb: NonNull<Superblock>, idx: BlockIndex) {
    debug_assert!(
      core::ptr::eq(unsafe { sb.as_ref() }.owner(), self.heap),
      "free_to: foreign superblock"
    );
    unsafe { Superblock::free_block(sb, idx) };
    let s = unsafe { sb.as_ref() };
    debug_assert!(self.state.used >= s.block_size(), "heap {} used underflow", self.heap.index);
    self.state.used -= s.block_size();
    unsafe { self.rebucket(sb) };
  }

  /// Makes this heap the owner of a detached superblock.
  pub(crate) unsafe fn attach(&mut self, sb: NonNull<Superblock>) {
    let s = unsafe { sb.as_ref() };
    s.set_owner(self.heap);
    self.state.allocated += s.capacity_bytes();
    self.state.used += s.used_bytes();
    unsafe { self.link(sb) };
  }

  /// Unlinks `sb` from this heap. The owner back-reference is left for the next `attach`.
  pub(crate) unsafe fn detach(&mut self, sb: NonNull<Superblock>) {
    let s = unsafe { sb.as_ref() };
    debug_assert!(core::ptr::eq(s.owner(), self.heap), "detach: foreign superblock");
    self.state.allocated -= s.capacity_bytes();
    self.state.used -= s.used_bytes();
    unsafe { self.unlink(sb) };
  }

  /// Moves `sb` from this heap to `to`. Both locks are held, so no observer sees it in both
  /// heaps or in neither.
  pub(crate) unsafe fn transfer(&mut self, to: &mut HeapGuard<'_>, sb: NonNull<Superblock>) {
    unsafe {
      self.detach(sb);
      to.attach(sb);
    }
  }

  pub(crate) fn stats(&self) -> HeapStats {
    let mut superblocks = [0; FULLNESS_GROUPS];
    for (list, &head) in self.state.buckets.iter().enumerate() {
      let mut sb = head;
      while !sb.is_null() {
        superblocks[list.min(FULLNESS_GROUPS - 1)] += 1;
        sb = unsafe { (*sb).next };
      }
    }
    HeapStats {
      used: self.state.used,
      allocated: self.state.allocated,
      superblocks,
    }
  }

  /// Moves `sb` to the list matching its occupancy if that changed.
  unsafe fn rebucket(&mut self, sb: NonNull<Superblock>) {
    let s = unsafe { sb.as_ref() };
    if list_of(s) != s.group as usize {
      unsafe {
        self.unlink(sb);
        self.link(sb);
      }
    }
  }

  unsafe fn link(&mut self, sb: NonNull<Superblock>) {
    let s = unsafe { &mut *sb.as_ptr() };
    let group = list_of(s);
    let head = self.state.buckets[group];
    s.group = group as u8;
    s.prev = null_mut();
    s.next = head;
    if !head.is_null() {
      unsafe { (*head).prev = sb.as_ptr() };
    }
    self.state.buckets[group] = sb.as_ptr();
  }

  unsafe fn unlink(&mut self, sb: NonNull<Superblock>) {
    let s = unsafe { &mut *sb.as_ptr() };
    if s.prev.is_null() {
      debug_assert_eq!(self.state.buckets[s.group as usize], sb.as_ptr());
      self.state.buckets[s.group as usize] = s.next;
    } else {
      unsafe { (*s.prev).next = s.next };
    }
    if !s.next.is_null() {
      unsafe { (*s.next).prev = s.prev };
    }
    s.prev = null_mut();
    s.next = null_mut();
  }
}

/// List a superblock belongs in: its fullness group, or [`FULL_LIST`] with no free block left.
#[inline]
fn list_of(s: &Superblock) -> usize {
  if s.is_full() { FULL_LIST } else { s.fullness_group() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{size_class::size_class, superblock::tests::Page};

  fn attached(guard: &mut HeapGuard<'_>, class: usize) -> Page {
    let page = Page::new(class);
    unsafe { guard.attach(NonNull::new(page.ptr()).unwrap()) };
    page
  }

  #[test]
  fn attach_and_detach_keep_counters() {
    let heap = Heap::new(1);
    let mut guard = heap.lock();
    assert!(guard.is_full());

    let page = attached(&mut guard, size_class(64));
    let sb = NonNull::new(page.ptr()).unwrap();
    let cap = unsafe { sb.as_ref().capacity_bytes() };
    assert_eq!(guard.stats().allocated, cap);
    assert!(!guard.is_full());
    assert!(core::ptr::eq(unsafe { sb.as_ref().owner() }, &heap));

    let block = unsafe { guard.allocate_from(sb) }.unwrap();
    assert_eq!(guard.stats().used, 64);

    let other = Heap::new(0);
    let mut global = other.lock();
    unsafe { guard.transfer(&mut global, sb) };
    assert_eq!(guard.stats(), HeapStats::default());
    assert_eq!(global.stats().used, 64);
    assert_eq!(global.stats().allocated, cap);
    assert!(core::ptr::eq(unsafe { sb.as_ref().owner() }, &other));

    let idx = unsafe { sb.as_ref().block_index(block.as_ptr()) }.unwrap();
    unsafe { global.free_to(sb, idx) };
    assert_eq!(global.stats().used, 0);
  }

  #[test]
  fn superblocks_move_between_buckets() {
    let heap = Heap::new(1);
    let mut guard = heap.lock();
    // 3 blocks per superblock: each allocation crosses a quartile boundary.
    let page = attached(&mut guard, size_class(1024));
    let sb = NonNull::new(page.ptr()).unwrap();
    assert_eq!(guard.stats().superblocks, [1, 0, 0, 0]);

    let mut blocks = Vec::new();
    for expected in [[0, 1, 0, 0], [0, 0, 1, 0], [0, 0, 0, 1]] {
      blocks.push(unsafe { guard.allocate_from(sb) }.unwrap());
      assert_eq!(guard.stats().superblocks, expected);
    }
    assert!(guard.is_full());
    assert!(guard.find(size_class(1024)).is_none());

    let idx = unsafe { sb.as_ref().block_index(blocks[0].as_ptr()) }.unwrap();
    unsafe { guard.free_to(sb, idx) };
    assert_eq!(guard.stats().superblocks, [0, 0, 1, 0]);
    assert_eq!(guard.find(size_class(1024)), Some(sb));
  }

  #[test]
  fn find_prefers_fuller_superblocks() {
    let heap = Heap::new(1);
    let mut guard = heap.lock();
    let class = size_class(512);
    let emptier = attached(&mut guard, class);
    let fuller = attached(&mut guard, class);
    let fuller_sb = NonNull::new(fuller.ptr()).unwrap();

    for _ in 0..4 {
      unsafe { guard.allocate_from(fuller_sb) }.unwrap();
    }
    assert_eq!(guard.find(class), Some(fuller_sb));
    assert_eq!(guard.find_empty(), NonNull::new(emptier.ptr()));
    assert!(guard.find(size_class(16)).is_none());
  }

  #[test]
  fn middle_of_bucket_unlinks_cleanly() {
    let heap = Heap::new(1);
    let mut guard = heap.lock();
    let class = size_class(32);
    let pages: Vec<_> = (0..3).map(|_| attached(&mut guard, class)).collect();
    assert_eq!(guard.stats().superblocks, [3, 0, 0, 0]);

    let middle = NonNull::new(pages[1].ptr()).unwrap();
    unsafe { guard.detach(middle) };
    assert_eq!(guard.stats().superblocks, [2, 0, 0, 0]);
    let other = Heap::new(0);
    let mut to = other.lock();
    unsafe { to.attach(middle) };
    assert_eq!(to.stats().superblock_count(), 1);
  }

  #[test]
  fn release_needs_idle_capacity_beyond_slack() {
    let heap = Heap::new(1);
    let mut guard = heap.lock();
    let _one = attached(&mut guard, size_class(64));
    assert!(!guard.should_release());
    let _two = attached(&mut guard, size_class(64));
    assert!(guard.should_release());
  }

  /// Superblocks on the searched lists, in search order.
  fn searched(guard: &HeapGuard<'_>) -> Vec<*mut Superblock> {
    let mut out = Vec::new();
    for group in (0..FULLNESS_GROUPS).rev() {
      let mut sb = guard.state.buckets[group];
      while !sb.is_null() {
        out.push(sb);
        sb = unsafe { (*sb).next };
      }
    }
    out
  }

  #[test]
  fn full_superblocks_are_kept_off_the_search_path() {
    let heap = Heap::new(1);
    let mut guard = heap.lock();
    let class = size_class(1024);

    let partial = attached(&mut guard, class);
    let partial_sb = NonNull::new(partial.ptr()).unwrap();
    unsafe { guard.allocate_from(partial_sb) }.unwrap();

    let full: Vec<_> = (0..50).map(|_| attached(&mut guard, class)).collect();
    let mut last = None;
    for page in &full {
      let sb = NonNull::new(page.ptr()).unwrap();
      while let Some(p) = unsafe { guard.allocate_from(sb) } {
        last = Some((sb, p));
      }
    }

    assert_eq!(searched(&guard), vec![partial.ptr()]);
    assert!(searched(&guard).iter().all(|&sb| !unsafe { &*sb }.is_full()));
    assert_eq!(guard.stats().superblocks, [0, 1, 0, 50]);
    assert_eq!(guard.find(class), Some(partial_sb));

    // A free makes a full superblock searchable again.
    let (sb, p) = last.unwrap();
    let idx = unsafe { sb.as_ref().block_index(p.as_ptr()) }.unwrap();
    unsafe { guard.free_to(sb, idx) };
    assert_eq!(searched(&guard), vec![sb.as_ptr(), partial.ptr()]);
    assert_eq!(guard.find(class), Some(sb));
    assert_eq!(guard.stats().superblocks, [0, 1, 1, 49]);
  }
}
