//! The event loop: run-state machine, queues and dispatch.
//!
//! Single-threaded and cooperative. One iteration drains the submission
//! queue into the backend, collects pool-finished work, polls the backend,
//! and invokes callbacks. The only two cross-thread channels are the
//! work-completion queue the pool pushes onto and the backend's remote
//! waker; everything else is owned by the thread calling [`Loop::run`].

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};

use crate::backend::{Backend, BackendKind, RemoteWaker};
use crate::completion::{Completion, Home, Op, OpKind, OpResult, State};
use crate::error::Error;
use crate::pool::ThreadPool;
use crate::queue::Queue;
use crate::sync::Mutex;

/// How long one [`Loop::run`] call keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
  /// Poll with a zero timeout, dispatch whatever is ready, return.
  NoWait,
  /// Drain submissions, poll once (possibly blocking), dispatch, return.
  Once,
  /// Repeat until no operations are in flight or [`Loop::stop`] is called.
  UntilDone,
}

/// Loop construction options.
#[derive(Clone)]
pub struct Options {
  /// Sizes the ring / event buffers.
  pub entries: u32,
  /// Backend override; `None` picks the host default.
  pub backend: Option<BackendKind>,
  /// Pool executing blocking operations. Without one, submissions that
  /// need it complete with [`Error::NoThreadPool`].
  pub thread_pool: Option<Arc<ThreadPool>>,
  /// Upper bound for one blocking poll; `None` waits until woken.
  pub poll_budget: Option<Duration>,
}

impl Default for Options {
  fn default() -> Options {
    Options {
      entries: 256,
      backend: None,
      thread_pool: None,
      poll_budget: None,
    }
  }
}

/// State shared with pool workers and wakers on foreign threads.
pub(crate) struct LoopShared {
  work_completions: Mutex<Queue>,
  wake_requested: AtomicBool,
  waker: RemoteWaker,
}

impl LoopShared {
  /// Returns a pool-finished completion to the owning loop.
  ///
  /// # Safety
  ///
  /// `c` must be a completion previously handed to the pool by this
  /// loop's routing, not queued anywhere else.
  pub(crate) unsafe fn push_work_completion(&self, c: NonNull<Completion>) {
    unsafe { self.work_completions.lock().push(c) };
  }

  /// Unblocks the loop's poll without completing wake listeners.
  pub(crate) fn notify(&self) {
    self.waker.wake();
  }
}

/// Cross-thread wake handle for a [`Loop`].
///
/// Clonable and `Send`; waking marks the wake request and forces a
/// blocked poll to return promptly.
#[derive(Clone)]
pub struct LoopWaker {
  shared: Arc<LoopShared>,
}

impl LoopWaker {
  pub fn wake(&self) {
    self.shared.wake_requested.store(true, Ordering::Release);
    self.shared.notify();
  }
}

/// Single-threaded completion dispatcher owning one backend.
pub struct Loop {
  backend: Backend,
  shared: Arc<LoopShared>,
  pool: Option<Arc<ThreadPool>>,
  poll_budget: Option<Duration>,
  /// Completions awaiting backend dispatch.
  submissions: Queue,
  /// Completions with results, awaiting their callback.
  ready: Queue,
  /// Armed wake listeners.
  wake_waiters: Queue,
  /// In-flight operations, counted from `add` to callback.
  active: usize,
  stopped: bool,
}

impl Loop {
  pub fn new(options: Options) -> Result<Loop, Error> {
    let mut kind =
      options.backend.unwrap_or_else(BackendKind::default_for_host);
    let backend = match Backend::new(kind, options.entries) {
      Ok(backend) => backend,
      // Hosts can forbid the default mechanism (seccomp commonly blocks
      // io_uring); an unforced loop degrades to readiness polling.
      #[cfg(unix)]
      Err(err)
        if options.backend.is_none()
          && kind != BackendKind::ReadinessPoll =>
      {
        debug!("{kind:?} unavailable ({err}); using readiness poll");
        kind = BackendKind::ReadinessPoll;
        Backend::new(kind, options.entries)?
      }
      Err(err) => return Err(err),
    };
    let shared = Arc::new(LoopShared {
      work_completions: Mutex::new(Queue::new()),
      wake_requested: AtomicBool::new(false),
      waker: backend.waker(),
    });
    debug!("loop created on {kind:?}");
    Ok(Loop {
      backend,
      shared,
      pool: options.thread_pool,
      poll_budget: options.poll_budget,
      submissions: Queue::new(),
      ready: Queue::new(),
      wake_waiters: Queue::new(),
      active: 0,
      stopped: false,
    })
  }

  /// Operations currently in flight.
  pub fn active(&self) -> usize {
    self.active
  }

  /// Submits a completion.
  ///
  /// The completion is only enqueued here; it reaches the backend (or the
  /// pool) during the next [`run`](Loop::run) iteration.
  ///
  /// # Safety
  ///
  /// `c` must point to a completion that stays valid and does not move
  /// until its callback has fired, must not currently be in flight, and
  /// must not be submitted to another loop concurrently.
  pub unsafe fn add(&mut self, c: *mut Completion) {
    let mut nn = NonNull::new(c).expect("null completion");
    let comp = unsafe { nn.as_mut() };
    assert!(
      comp.state() != State::Running,
      "completion re-added while in flight"
    );
    comp.reset_for_add();
    unsafe { self.submissions.push(nn) };
    self.active += 1;
    trace!("added {:?}, active={}", comp.op_kind(), self.active);
  }

  /// Requests the current `run` to exit after the ongoing iteration.
  ///
  /// Safe to call repeatedly and from inside callbacks. The flag is
  /// sticky: a stopped loop returns from `run` immediately until dropped.
  pub fn stop(&mut self) {
    self.stopped = true;
  }

  /// Wakes the loop from its own thread: pending wake listeners complete
  /// on the next iteration.
  pub fn wake(&mut self) {
    self.shared.wake_requested.store(true, Ordering::Release);
  }

  /// Wakes the loop from any thread, unblocking a blocked poll.
  pub fn wake_from_anywhere(&self) {
    self.shared.wake_requested.store(true, Ordering::Release);
    self.shared.notify();
  }

  /// A clonable handle other threads can use to wake this loop.
  pub fn waker(&self) -> LoopWaker {
    LoopWaker { shared: Arc::clone(&self.shared) }
  }

  /// Runs the loop in the given mode and returns the number of callbacks
  /// dispatched. A backend poll failure is fatal and returned.
  pub fn run(&mut self, mode: RunMode) -> Result<usize, Error> {
    match mode {
      RunMode::NoWait => self.tick(Some(Duration::ZERO)),
      RunMode::Once => self.tick(self.poll_budget),
      RunMode::UntilDone => {
        let mut total = 0;
        while self.active > 0 && !self.stopped {
          total += self.tick(self.poll_budget)?;
        }
        Ok(total)
      }
    }
  }

  /// One loop iteration: submit, collect, poll, dispatch.
  fn tick(&mut self, budget: Option<Duration>) -> Result<usize, Error> {
    if self.stopped {
      return Ok(0);
    }

    while let Some(c) = self.submissions.pop() {
      self.route(c);
    }

    // Work the pool finished since the previous iteration.
    self.collect_work();
    self.flush_wake_waiters();

    let timeout = if self.ready.is_empty() {
      budget
    } else {
      Some(Duration::ZERO)
    };
    self.backend.poll(timeout, &mut self.ready)?;

    // The poll may have been unblocked by a pool handoff or a waker.
    self.collect_work();
    self.flush_wake_waiters();

    let mut dispatched = 0;
    while let Some(c) = self.ready.pop() {
      self.dispatch(c);
      dispatched += 1;
    }
    Ok(dispatched)
  }

  /// Decides where a drained submission goes: loop-internal handling,
  /// the thread pool, or the backend.
  fn route(&mut self, mut c: NonNull<Completion>) {
    let comp = unsafe { c.as_mut() };
    let kind = comp.op_kind();
    match kind {
      OpKind::Wake => {
        comp.set_state(State::Running);
        comp.home = Home::WakeList;
        unsafe { self.wake_waiters.push(c) };
      }
      OpKind::Cancel => self.handle_cancel(c),
      OpKind::Work => self.to_pool(c),
      kind if self.backend.offloads(kind) => self.to_pool(c),
      _ => {
        comp.set_state(State::Running);
        comp.home = Home::Backend;
        self.backend.submit(c, &mut self.ready);
      }
    }
  }

  fn to_pool(&mut self, mut c: NonNull<Completion>) {
    let comp = unsafe { c.as_mut() };
    match &self.pool {
      Some(pool) => {
        // State stays Pending: claiming it is the worker's job, and the
        // pending->canceled window is what cancel() races against.
        comp.home = Home::Pool;
        comp.shared = Some(Arc::clone(&self.shared));
        unsafe { pool.submit(c.as_ptr()) };
      }
      None => {
        comp.set_error(Error::NoThreadPool);
        comp.set_state(State::Completed);
        unsafe { self.ready.push(c) };
      }
    }
  }

  /// Best-effort cancellation. A still-queued target is withdrawn without
  /// its callback ever firing; a running target is asked to stop and
  /// completes normally, possibly with [`Error::Canceled`].
  fn handle_cancel(&mut self, mut c: NonNull<Completion>) {
    let comp = unsafe { c.as_mut() };
    comp.set_state(State::Running);
    let target = match &comp.op {
      Op::Cancel { target } => *target,
      _ => unreachable!("routed as cancel without cancel op"),
    };

    let result = match NonNull::new(target) {
      None => Err(Error::Unexpected),
      Some(target) => self.cancel_target(target),
    };
    comp.set_result(OpResult::Unit(result));
    comp.set_state(State::Completed);
    unsafe { self.ready.push(c) };
  }

  fn cancel_target(
    &mut self,
    mut target: NonNull<Completion>,
  ) -> Result<(), Error> {
    let t = unsafe { target.as_mut() };
    match t.state() {
      State::Pending => {
        if t.home == Home::Pool {
          if let Some(pool) = &self.pool {
            if pool.cancel(t) {
              // Withdrawn before pickup: no callback, drop it from the
              // in-flight accounting here.
              self.active -= 1;
              return Ok(());
            }
          }
          // Lost the claim race; the worker delivers Canceled.
          return Ok(());
        }
        if self.submissions.remove(target)
          && t.try_transition(State::Pending, State::Canceled)
        {
          self.active -= 1;
          Ok(())
        } else {
          Err(Error::Unexpected)
        }
      }
      State::Running => match t.home {
        Home::Backend => {
          self.backend.cancel(target, &mut self.ready);
          Ok(())
        }
        Home::WakeList => {
          if self.wake_waiters.remove(target) {
            t.set_error(Error::Canceled);
            t.set_state(State::Completed);
            unsafe { self.ready.push(target) };
          }
          Ok(())
        }
        // Claimed by a worker; it finishes on its own.
        _ => Ok(()),
      },
      State::Completed | State::Canceled => Err(Error::Unexpected),
    }
  }

  fn collect_work(&mut self) {
    let mut finished = self.shared.work_completions.lock();
    self.ready.append(&mut finished);
  }

  /// Completes every armed wake listener once a wake was requested.
  fn flush_wake_waiters(&mut self) {
    if self.wake_waiters.is_empty() {
      return;
    }
    if !self.shared.wake_requested.swap(false, Ordering::AcqRel) {
      return;
    }
    while let Some(mut c) = self.wake_waiters.pop() {
      let comp = unsafe { c.as_mut() };
      comp.set_result(OpResult::Unit(Ok(())));
      comp.set_state(State::Completed);
      unsafe { self.ready.push(c) };
    }
  }

  /// Pops one finished completion and fires its callback. Submissions
  /// made inside the callback land in the submission queue and wait for
  /// the next iteration.
  fn dispatch(&mut self, mut c: NonNull<Completion>) {
    let comp = unsafe { c.as_mut() };
    comp.home = Home::None;
    comp.shared = None;
    debug_assert!(comp.has_result(), "dispatching a completion w/o result");
    self.active -= 1;
    trace!("dispatch {:?}, active={}", comp.op_kind(), self.active);
    let callback = comp.callback;
    callback(self, unsafe { &mut *c.as_ptr() });
  }
}

impl Drop for Loop {
  fn drop(&mut self) {
    // In-flight completions are the caller's to cancel; dropping the loop
    // tears down the backend only.
    if self.active > 0 {
      debug!("loop dropped with {} operations in flight", self.active);
    }
  }
}
