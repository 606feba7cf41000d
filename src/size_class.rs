//! Power-of-base size classes.
//!
//! A request of `size` bytes lands in the smallest class `k` with `SIZE_CLASS_BASE^k >= size`,
//! floored at `SIZE_CLASS_MIN` so every block can hold a free-list index.

use crate::{MAX_SMALL_SIZE, SIZE_CLASS_BASE, SIZE_CLASS_MIN};

/// Number of classes serviced from superblocks (`0..CLASSES_COUNT`, the low ones unused).
pub const CLASSES_COUNT: usize = size_class(MAX_SMALL_SIZE) + 1;

/// Convert allocation size to class index.
pub const fn size_class(size: usize) -> usize {
  let mut unit = 1;
  let mut rest = size;
  let mut class = 0;
  while rest >= SIZE_CLASS_BASE {
    rest /= SIZE_CLASS_BASE;
    unit *= SIZE_CLASS_BASE;
    class += 1;
  }

  // `unit` is the largest power not above `size`; anything past it needs the next class.
  if size > unit {
    class += 1;
  }

  if class < SIZE_CLASS_MIN {
    SIZE_CLASS_MIN
  } else {
    class
  }
}

/// Convert class index to block size (inverse of `size_class` on class boundaries).
#[inline(always)]
pub const fn class_to_size(class: usize) -> usize {
  SIZE_CLASS_BASE.pow(class as u32)
}

/// Returns `(class, block_size)` for a request.
#[inline]
pub const fn classify(size: usize) -> (usize, usize) {
  let class = size_class(size);
  (class, class_to_size(class))
}
