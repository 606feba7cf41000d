use core::{
  cell::UnsafeCell,
  ops::{Deref, DerefMut},
};

/// Blocking mutex over `pthread_mutex_t`.
///
/// Never allocates, so it is usable from inside the allocator. The mutex must not be moved while
/// locked; heaps live in arena memory and never move at all.
pub(crate) struct Lock<T> {
  mutex: UnsafeCell<libc::pthread_mutex_t>,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Lock<T> {}
unsafe impl<T: Send> Send for Lock<T> {}

impl<T> Lock<T> {
  pub(crate) const fn new(data: T) -> Self {
    Self {
      mutex: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
      data: UnsafeCell::new(data),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> LockGuard<'_, T> {
    let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
    debug_assert_eq!(rc, 0, "pthread_mutex_lock failed: {rc}");
    LockGuard { lock: self }
  }
}

/// Scoped ownership of a [`Lock`]; unlocks on drop.
pub(crate) struct LockGuard<'a, T> {
  lock: &'a Lock<T>,
}

impl<T> Deref for LockGuard<'_, T> {
  type Target = T;

  #[inline]
  fn deref(&self) -> &T {
    unsafe { &*self.lock.data.get() }
  }
}

impl<T> DerefMut for LockGuard<'_, T> {
  #[inline]
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.lock.data.get() }
  }
}

impl<T> Drop for LockGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    let rc = unsafe { libc::pthread_mutex_unlock(self.lock.mutex.get()) };
    debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed: {rc}");
  }
}
