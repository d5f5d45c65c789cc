//! Thread pool for intrinsically blocking operations.
//!
//! Workers drain one shared intrusive FIFO under a mutex and a not-empty
//! condition. An item is claimed by an atomic `Pending -> Running`
//! compare-exchange, which is also what settles the race against
//! [`ThreadPool::cancel`]: whoever wins the exchange decides whether the
//! work function runs at all.

use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::completion::{Completion, State};
use crate::error::Error;
use crate::queue::Queue;
use crate::sync::{Condvar, Mutex};
use crate::sys;

/// Worker-count bounds for [`ThreadPool::new`].
///
/// The pool spawns one worker per CPU, clamped into
/// `min_threads..=max_threads`.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
  pub min_threads: usize,
  pub max_threads: usize,
}

impl Default for PoolOptions {
  fn default() -> PoolOptions {
    PoolOptions { min_threads: 1, max_threads: default_parallelism() }
  }
}

fn default_parallelism() -> usize {
  thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

struct PoolState {
  pending: Queue,
  shutdown: bool,
}

struct Inner {
  state: Mutex<PoolState>,
  not_empty: Condvar,
}

// SAFETY: the queue inside holds raw completion pointers; every access
// goes through the mutex, and an item belongs to exactly one worker once
// popped.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// Bounded set of workers executing blocking completions.
pub struct ThreadPool {
  inner: Arc<Inner>,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
  /// Spawns the workers. A spawn failure is fatal and reported as
  /// [`Error::SystemResources`].
  pub fn new(options: PoolOptions) -> Result<ThreadPool, Error> {
    let max = options.max_threads.max(1);
    let min = options.min_threads.clamp(1, max);
    let count = default_parallelism().clamp(min, max);

    let inner = Arc::new(Inner {
      state: Mutex::new(PoolState { pending: Queue::new(), shutdown: false }),
      not_empty: Condvar::new(),
    });

    let mut workers = Vec::with_capacity(count);
    for id in 0..count {
      let inner = Arc::clone(&inner);
      let handle = thread::Builder::new()
        .name(format!("evio-worker-{id}"))
        .spawn(move || worker_main(inner))
        .map_err(|_| Error::SystemResources)?;
      workers.push(handle);
    }
    debug!("thread pool started with {count} workers");

    Ok(ThreadPool { inner, workers: Mutex::new(workers) })
  }

  /// Enqueues `work` and wakes exactly one worker.
  ///
  /// # Safety
  ///
  /// `work` must point to a live completion in the `Pending` state whose
  /// storage outlives execution, and must not be queued anywhere else.
  pub unsafe fn submit(&self, work: *mut Completion) {
    let work = NonNull::new(work).expect("null work completion");
    debug_assert_eq!(unsafe { work.as_ref() }.state(), State::Pending);
    {
      let mut state = self.inner.state.lock();
      assert!(!state.shutdown, "submit after ThreadPool::stop");
      unsafe { state.pending.push(work) };
    }
    self.inner.not_empty.notify_one();
  }

  /// Cancels `work` if no worker has claimed it yet.
  ///
  /// Returns `true` when the completion was atomically moved to
  /// `Canceled` *and* unlinked from the queue; its callback will never
  /// fire. Returns `false` when the work already runs (or ran), in which
  /// case the completion finishes normally — possibly with a
  /// [`Error::Canceled`] result if the claim race was lost between pop
  /// and claim.
  pub fn cancel(&self, work: &Completion) -> bool {
    if !work.try_transition(State::Pending, State::Canceled) {
      return false;
    }
    // The exchange won, but a worker may have popped the item already;
    // only a successful unlink guarantees the callback never fires.
    let mut state = self.inner.state.lock();
    state.pending.remove(NonNull::from(work))
  }

  /// Sets shutdown, wakes every worker, and joins them.
  ///
  /// Idempotent. Work still queued at this point is dropped unrun.
  pub fn stop(&self) {
    {
      let mut state = self.inner.state.lock();
      if state.shutdown {
        return;
      }
      state.shutdown = true;
    }
    self.inner.not_empty.notify_all();
    let mut workers = self.workers.lock();
    for handle in workers.drain(..) {
      let _ = handle.join();
    }
    debug!("thread pool stopped");
  }
}

impl Drop for ThreadPool {
  fn drop(&mut self) {
    self.stop();
  }
}

fn worker_main(inner: Arc<Inner>) {
  loop {
    let work = {
      let mut state = inner.state.lock();
      loop {
        if state.shutdown {
          return;
        }
        if let Some(work) = state.pending.pop() {
          break work;
        }
        state = inner.not_empty.wait(state);
      }
    };

    // The mutex is released while the work runs.
    let c = unsafe { &mut *work.as_ptr() };
    if c.try_transition(State::Pending, State::Running) {
      let result = sys::perform_blocking(c);
      c.set_result(result);
      c.set_state(State::Completed);
    } else {
      // Canceled between pop and claim: skip the work, record the fact.
      c.set_error(Error::Canceled);
    }

    // Hand the finished item back to its loop, if it came from one.
    if let Some(shared) = c.shared.clone() {
      unsafe { shared.push_work_completion(work) };
      shared.notify();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::completion::OpKind;
  use std::ffi::c_void;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn nop(_: &mut crate::Loop, _: &mut Completion) {}

  fn bump(data: *mut c_void) {
    let counter = unsafe { &*(data as *const AtomicUsize) };
    counter.fetch_add(1, Ordering::SeqCst);
  }

  fn wait_for(counter: &AtomicUsize, want: usize) {
    let mut spins = 0;
    while counter.load(Ordering::SeqCst) < want {
      thread::sleep(Duration::from_millis(1));
      spins += 1;
      assert!(spins < 5000, "worker never ran the submitted work");
    }
  }

  #[test]
  fn runs_submitted_work() {
    let pool =
      ThreadPool::new(PoolOptions { min_threads: 1, max_threads: 2 }).unwrap();
    let counter = AtomicUsize::new(0);
    let mut c = Completion::work(
      bump,
      &counter as *const AtomicUsize as *mut c_void,
      nop,
    );
    assert_eq!(c.op_kind(), OpKind::Work);
    unsafe { pool.submit(&mut c) };

    wait_for(&counter, 1);
    while c.state() != State::Completed {
      thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(c.result_unit(), Ok(()));
    pool.stop();
  }

  #[test]
  fn cancel_before_pickup_skips_func() {
    // No workers can claim fast enough to matter if we never wake them:
    // submit while holding the state lock is not possible from outside,
    // so instead use a pool whose single worker is busy.
    let pool =
      ThreadPool::new(PoolOptions { min_threads: 1, max_threads: 1 }).unwrap();

    let gate = AtomicUsize::new(0);
    fn block_until(data: *mut c_void) {
      let gate = unsafe { &*(data as *const AtomicUsize) };
      while gate.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
      }
    }
    let mut blocker = Completion::work(
      block_until,
      &gate as *const AtomicUsize as *mut c_void,
      nop,
    );
    unsafe { pool.submit(&mut blocker) };

    let counter = AtomicUsize::new(0);
    let mut victim = Completion::work(
      bump,
      &counter as *const AtomicUsize as *mut c_void,
      nop,
    );
    unsafe { pool.submit(&mut victim) };

    // The single worker is parked in block_until, so the victim is still
    // queued and cancelable.
    assert!(pool.cancel(&victim));
    assert_eq!(victim.state(), State::Canceled);

    gate.store(1, Ordering::SeqCst);
    pool.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 0, "canceled work must not run");
  }

  #[test]
  fn cancel_after_completion_returns_false() {
    let pool =
      ThreadPool::new(PoolOptions { min_threads: 1, max_threads: 1 }).unwrap();
    let counter = AtomicUsize::new(0);
    let mut c = Completion::work(
      bump,
      &counter as *const AtomicUsize as *mut c_void,
      nop,
    );
    unsafe { pool.submit(&mut c) };
    wait_for(&counter, 1);
    while c.state() != State::Completed {
      thread::sleep(Duration::from_millis(1));
    }
    assert!(!pool.cancel(&c));
    pool.stop();
  }

  #[test]
  fn stop_is_idempotent_and_joins_workers() {
    let pool =
      ThreadPool::new(PoolOptions { min_threads: 2, max_threads: 4 }).unwrap();
    pool.stop();
    pool.stop();
  }
}
