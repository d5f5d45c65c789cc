//! Platform backends behind one submission/poll/cancel surface.
//!
//! The backend is a sum type, one variant per kernel mechanism; every
//! call site dispatches through a finite match. Backends never invoke
//! callbacks: they hand finished completions to the loop by pushing onto
//! the `done` queue they are given.

#[cfg(linux)]
pub(crate) mod uring;

#[cfg(windows)]
pub(crate) mod iocp;

#[cfg(unix)]
pub(crate) mod poll;

use std::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::completion::{Completion, OpKind, State};
use crate::error::Error;
use crate::queue::Queue;

/// Which platform mechanism a loop runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
  /// Kernel completion ring (io_uring). Linux only.
  CompletionRing,
  /// Overlapped I/O completion port. Windows only.
  OverlappedPort,
  /// Readiness polling (epoll/kqueue) plus inline non-blocking syscalls.
  ReadinessPoll,
}

impl BackendKind {
  /// The best mechanism for the host platform.
  pub fn default_for_host() -> BackendKind {
    #[cfg(linux)]
    {
      BackendKind::CompletionRing
    }
    #[cfg(windows)]
    {
      BackendKind::OverlappedPort
    }
    #[cfg(not(any(linux, windows)))]
    {
      BackendKind::ReadinessPoll
    }
  }
}

pub(crate) enum Backend {
  #[cfg(linux)]
  Uring(uring::Uring),
  #[cfg(windows)]
  Iocp(iocp::Iocp),
  #[cfg(unix)]
  Poll(poll::Poll),
}

impl Backend {
  pub(crate) fn new(kind: BackendKind, entries: u32) -> Result<Backend, Error> {
    match kind {
      #[cfg(linux)]
      BackendKind::CompletionRing => {
        Ok(Backend::Uring(uring::Uring::new(entries)?))
      }
      #[cfg(windows)]
      BackendKind::OverlappedPort => Ok(Backend::Iocp(iocp::Iocp::new(entries)?)),
      #[cfg(unix)]
      BackendKind::ReadinessPoll => Ok(Backend::Poll(poll::Poll::new(entries)?)),
      #[allow(unreachable_patterns)]
      _ => Err(Error::Unexpected),
    }
  }

  /// Hands one pending completion to the kernel mechanism. Synchronous
  /// operations finish inside this call and land on `done`.
  pub(crate) fn submit(&mut self, c: NonNull<Completion>, done: &mut Queue) {
    match self {
      #[cfg(linux)]
      Backend::Uring(b) => b.submit(c, done),
      #[cfg(windows)]
      Backend::Iocp(b) => b.submit(c, done),
      #[cfg(unix)]
      Backend::Poll(b) => b.submit(c, done),
    }
  }

  /// Waits up to `timeout` (`None` = unbounded) for completion events and
  /// pushes each finished completion onto `done`. Returns whether the
  /// wait timed out. Any error here is fatal to the loop.
  pub(crate) fn poll(
    &mut self,
    timeout: Option<Duration>,
    done: &mut Queue,
  ) -> Result<bool, Error> {
    match self {
      #[cfg(linux)]
      Backend::Uring(b) => b.poll(timeout, done),
      #[cfg(windows)]
      Backend::Iocp(b) => b.poll(timeout, done),
      #[cfg(unix)]
      Backend::Poll(b) => b.poll(timeout, done),
    }
  }

  /// Requests cancellation of an in-flight completion. Returns whether
  /// the request was accepted; the target still completes through `done`
  /// either way, with success or [`Error::Canceled`].
  pub(crate) fn cancel(
    &mut self,
    target: NonNull<Completion>,
    done: &mut Queue,
  ) -> bool {
    match self {
      #[cfg(linux)]
      Backend::Uring(b) => b.cancel(target, done),
      #[cfg(windows)]
      Backend::Iocp(b) => b.cancel(target, done),
      #[cfg(unix)]
      Backend::Poll(b) => b.cancel(target, done),
    }
  }

  /// Earliest armed timer owned by the backend, when the backend keeps
  /// timers in userspace.
  pub(crate) fn next_deadline(&self) -> Option<Instant> {
    match self {
      #[cfg(linux)]
      Backend::Uring(_) => None,
      #[cfg(windows)]
      Backend::Iocp(b) => b.next_deadline(),
      #[cfg(unix)]
      Backend::Poll(b) => b.next_deadline(),
    }
  }

  /// Whether the loop must route `kind` to the thread pool instead of
  /// this backend.
  pub(crate) fn offloads(&self, kind: OpKind) -> bool {
    let resolver =
      matches!(kind, OpKind::GetAddrInfo | OpKind::GetNameInfo);
    let file = matches!(
      kind,
      OpKind::FileOpen
        | OpKind::FileRead
        | OpKind::FileWrite
        | OpKind::FileSync
        | OpKind::FileRename
        | OpKind::FileDelete
    );
    match self {
      #[cfg(linux)]
      Backend::Uring(_) => resolver,
      #[cfg(windows)]
      Backend::Iocp(_) => {
        resolver | file | matches!(kind, OpKind::RecvFrom | OpKind::SendTo)
      }
      #[cfg(unix)]
      Backend::Poll(_) => resolver | file,
    }
  }

  /// A clonable handle that unblocks this backend's `poll` from any
  /// thread.
  pub(crate) fn waker(&self) -> RemoteWaker {
    match self {
      #[cfg(linux)]
      Backend::Uring(b) => b.waker(),
      #[cfg(windows)]
      Backend::Iocp(b) => b.waker(),
      #[cfg(unix)]
      Backend::Poll(b) => b.waker(),
    }
  }
}

/// Performs the synchronous operation class (bind, listen, close,
/// shutdown) inline, storing the result and marking the completion
/// `Completed` before `submit` returns.
///
/// Returns `false` when `c` is not in that class.
#[cfg(unix)]
pub(crate) fn submit_sync(c: &mut Completion) -> bool {
  use crate::completion::{Op, OpResult};
  use crate::sys;

  let result = match &c.op {
    Op::Bind { fd, addr } => OpResult::Unit(sys::bind(*fd, addr)),
    Op::Listen { fd, backlog } => OpResult::Unit(sys::listen(*fd, *backlog)),
    Op::SocketClose { fd } | Op::FileClose { fd } => {
      OpResult::Unit(sys::close(*fd))
    }
    Op::Shutdown { fd, how } => OpResult::Unit(sys::shutdown(*fd, *how)),
    _ => return false,
  };
  c.set_result(result);
  c.set_state(State::Completed);
  true
}

/// Cross-thread unblocking primitive for a backend's `poll`.
///
/// Cheap to clone and safe to use from any thread; waking an
/// already-woken backend is a no-op.
#[derive(Clone)]
pub(crate) struct RemoteWaker(Repr);

#[derive(Clone)]
enum Repr {
  /// eventfd shared with the ring's armed poll entry.
  #[cfg(linux)]
  Eventfd(std::sync::Arc<std::os::fd::OwnedFd>),
  /// Write end of the readiness backend's notifier pipe.
  #[cfg(unix)]
  Pipe(std::sync::Arc<std::os::fd::OwnedFd>),
  /// Port handle for a posted wake packet.
  #[cfg(windows)]
  Port(std::sync::Arc<iocp::SharedPort>),
}

impl RemoteWaker {
  #[cfg(linux)]
  pub(crate) fn eventfd(fd: std::sync::Arc<std::os::fd::OwnedFd>) -> RemoteWaker {
    RemoteWaker(Repr::Eventfd(fd))
  }

  #[cfg(unix)]
  pub(crate) fn pipe(fd: std::sync::Arc<std::os::fd::OwnedFd>) -> RemoteWaker {
    RemoteWaker(Repr::Pipe(fd))
  }

  #[cfg(windows)]
  pub(crate) fn port(port: std::sync::Arc<iocp::SharedPort>) -> RemoteWaker {
    RemoteWaker(Repr::Port(port))
  }

  pub(crate) fn wake(&self) {
    match &self.0 {
      #[cfg(linux)]
      Repr::Eventfd(fd) => {
        use std::os::fd::AsRawFd;
        let one: u64 = 1;
        // A full counter already means a pending wake.
        let _ = unsafe {
          libc::write(
            fd.as_raw_fd(),
            &one as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
          )
        };
      }
      #[cfg(unix)]
      Repr::Pipe(fd) => {
        use std::os::fd::AsRawFd;
        let byte = 1u8;
        // A full pipe already means a pending wake.
        let _ = unsafe {
          libc::write(
            fd.as_raw_fd(),
            &byte as *const u8 as *const libc::c_void,
            1,
          )
        };
      }
      #[cfg(windows)]
      Repr::Port(port) => port.post_wake(),
    }
  }
}
