//! Poison-free wrappers over `std::sync` locking.
//!
//! A panicking worker must not wedge every later lock acquisition, so
//! poisoning is stripped by taking the inner value.

use std::sync;

pub(crate) struct Mutex<T: ?Sized>(sync::Mutex<T>);

impl<T> Mutex<T> {
  pub(crate) const fn new(value: T) -> Mutex<T> {
    Mutex(sync::Mutex::new(value))
  }
}

impl<T: ?Sized> Mutex<T> {
  pub(crate) fn lock(&self) -> sync::MutexGuard<'_, T> {
    self.0.lock().unwrap_or_else(sync::PoisonError::into_inner)
  }
}

pub(crate) struct Condvar(sync::Condvar);

impl Condvar {
  pub(crate) const fn new() -> Condvar {
    Condvar(sync::Condvar::new())
  }

  pub(crate) fn wait<'a, T>(
    &self,
    guard: sync::MutexGuard<'a, T>,
  ) -> sync::MutexGuard<'a, T> {
    self.0.wait(guard).unwrap_or_else(sync::PoisonError::into_inner)
  }

  pub(crate) fn notify_one(&self) {
    self.0.notify_one();
  }

  pub(crate) fn notify_all(&self) {
    self.0.notify_all();
  }
}
