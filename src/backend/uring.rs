//! Completion-ring backend.
//!
//! One SQE per operation, `user_data` carrying the completion's address;
//! CQEs map straight back to their records. Timers are timeout SQEs whose
//! timespec lives in the completion's scratch area. Cross-thread wakes go
//! through an eventfd armed with a one-shot poll SQE under a reserved
//! `user_data` value.

#![cfg(linux)]

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

use io_uring::types::{Fd, SubmitArgs, Timespec};
use io_uring::{opcode, squeue, IoUring};
use log::{debug, trace, warn};

use crate::backend::{submit_sync, RemoteWaker};
use crate::completion::{Completion, Op, OpResult, State};
use crate::error::Error;
use crate::queue::Queue;

/// CQE for the armed eventfd poll entry.
const WAKE_TOKEN: u64 = u64::MAX;
/// CQE we do not map back to a completion (async-cancel SQEs).
const IGNORE_TOKEN: u64 = u64::MAX - 1;

pub(crate) struct Uring {
  ring: IoUring,
  wake_fd: Arc<OwnedFd>,
  wake_armed: bool,
}

impl Uring {
  pub(crate) fn new(entries: u32) -> Result<Uring, Error> {
    let ring = IoUring::new(entries.max(4)).map_err(os_error)?;
    let raw = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
    let wake_fd = Arc::new(unsafe { OwnedFd::from_raw_fd(raw) });
    debug!("completion-ring backend up ({} entries)", entries.max(4));
    Ok(Uring { ring, wake_fd, wake_armed: false })
  }

  pub(crate) fn waker(&self) -> RemoteWaker {
    RemoteWaker::eventfd(Arc::clone(&self.wake_fd))
  }

  pub(crate) fn submit(&mut self, mut c: NonNull<Completion>, done: &mut Queue) {
    let comp = unsafe { c.as_mut() };
    if submit_sync(comp) {
      unsafe { done.push(c) };
      return;
    }

    let user_data = c.as_ptr() as u64;
    let entry = prepare(comp).user_data(user_data);
    trace!("ring submit {:?} user_data={user_data:#x}", comp.op_kind());
    if let Err(err) = self.push_entry(entry) {
      comp.set_error(err);
      comp.set_state(State::Completed);
      unsafe { done.push(c) };
    }
  }

  pub(crate) fn cancel(
    &mut self,
    target: NonNull<Completion>,
    _done: &mut Queue,
  ) -> bool {
    let entry = opcode::AsyncCancel::new(target.as_ptr() as u64)
      .build()
      .user_data(IGNORE_TOKEN);
    match self.push_entry(entry) {
      Ok(()) => true,
      Err(err) => {
        warn!("async-cancel submission failed: {err}");
        false
      }
    }
  }

  pub(crate) fn poll(
    &mut self,
    timeout: Option<Duration>,
    done: &mut Queue,
  ) -> Result<bool, Error> {
    let wait = timeout != Some(Duration::ZERO);

    // Arm the wake entry only when the call can actually block; the
    // one-shot poll is consumed by each delivered wake.
    if wait && !self.wake_armed {
      let entry =
        opcode::PollAdd::new(Fd(self.wake_fd.as_raw_fd()), libc::POLLIN as u32)
          .build()
          .user_data(WAKE_TOKEN);
      self.push_entry(entry)?;
      self.wake_armed = true;
    }

    let timed_out = match timeout {
      Some(Duration::ZERO) => {
        self.flush()?;
        false
      }
      Some(budget) => {
        let ts = Timespec::new()
          .sec(budget.as_secs())
          .nsec(budget.subsec_nanos());
        let args = SubmitArgs::new().timespec(&ts);
        match self.ring.submitter().submit_with_args(1, &args) {
          Ok(_) => false,
          Err(err) if err.raw_os_error() == Some(libc::ETIME) => true,
          Err(err) if recoverable(&err) => false,
          Err(err) => return Err(os_error(err)),
        }
      }
      None => match self.ring.submit_and_wait(1) {
        Ok(_) => false,
        Err(err) if recoverable(&err) => false,
        Err(err) => return Err(os_error(err)),
      },
    };

    let mut completion = self.ring.completion();
    completion.sync();
    let mut woken = false;
    for cqe in &mut completion {
      match cqe.user_data() {
        WAKE_TOKEN => woken = true,
        IGNORE_TOKEN => {
          trace!("async-cancel result {}", cqe.result());
        }
        addr => {
          let c = addr as *mut Completion;
          unsafe {
            store_result(&mut *c, cqe.result());
            done.push(NonNull::new_unchecked(c));
          }
        }
      }
    }
    drop(completion);

    if woken {
      self.wake_armed = false;
      drain_eventfd(self.wake_fd.as_raw_fd());
    }

    Ok(timed_out && done.is_empty())
  }

  /// Pushes one SQE, flushing the submission queue once when it is full.
  fn push_entry(&mut self, entry: squeue::Entry) -> Result<(), Error> {
    for _ in 0..2 {
      {
        let mut sq = self.ring.submission();
        if unsafe { sq.push(&entry) }.is_ok() {
          sq.sync();
          return Ok(());
        }
      }
      // Submission queue full: hand what we have to the kernel.
      self.flush()?;
    }
    Err(Error::SystemResources)
  }

  /// Submits queued SQEs without waiting; transient failures leave the
  /// entries queued for the next attempt.
  fn flush(&mut self) -> Result<(), Error> {
    match self.ring.submit() {
      Ok(_) => Ok(()),
      Err(err) if recoverable(&err) => Ok(()),
      Err(err) => Err(os_error(err)),
    }
  }
}

/// Builds the SQE for a completion. Pool-routed and loop-internal kinds
/// never reach this point.
fn prepare(c: &mut Completion) -> squeue::Entry {
  let Completion { op, scratch, .. } = c;
  match op {
    Op::Timer { deadline } => {
      let left = deadline.saturating_duration_since(Instant::now());
      scratch.ts =
        Timespec::new().sec(left.as_secs()).nsec(left.subsec_nanos());
      opcode::Timeout::new(&scratch.ts as *const Timespec).build()
    }
    Op::SocketOpen { domain, socktype, protocol } => {
      opcode::Socket::new(*domain, *socktype | libc::SOCK_CLOEXEC, *protocol)
        .build()
    }
    Op::Accept { fd } => {
      scratch.reset_addr();
      opcode::Accept::new(
        Fd(*fd),
        &mut scratch.addr as *mut libc::sockaddr_storage
          as *mut libc::sockaddr,
        &mut scratch.addr_len,
      )
      .flags(libc::SOCK_CLOEXEC)
      .build()
    }
    Op::Connect { fd, addr } => {
      opcode::Connect::new(Fd(*fd), addr.as_ptr(), addr.len()).build()
    }
    Op::Recv { fd, buf, len } => {
      opcode::Recv::new(Fd(*fd), *buf, *len as u32).build()
    }
    Op::Send { fd, buf, len } => {
      opcode::Send::new(Fd(*fd), *buf, *len as u32)
        .flags(libc::MSG_NOSIGNAL)
        .build()
    }
    Op::RecvFrom { fd, buf, len } => {
      scratch.reset_addr();
      scratch.iov =
        libc::iovec { iov_base: *buf as *mut libc::c_void, iov_len: *len };
      scratch.msg = unsafe { std::mem::zeroed() };
      scratch.msg.msg_name =
        &mut scratch.addr as *mut libc::sockaddr_storage as *mut libc::c_void;
      scratch.msg.msg_namelen = scratch.addr_len;
      scratch.msg.msg_iov = &mut scratch.iov;
      scratch.msg.msg_iovlen = 1;
      opcode::RecvMsg::new(Fd(*fd), &mut scratch.msg).build()
    }
    Op::SendTo { fd, buf, len, addr } => {
      scratch.iov = libc::iovec {
        iov_base: *buf as *mut libc::c_void,
        iov_len: *len,
      };
      scratch.msg = unsafe { std::mem::zeroed() };
      scratch.msg.msg_name = addr.as_ptr() as *mut libc::c_void;
      scratch.msg.msg_namelen = addr.len();
      scratch.msg.msg_iov = &mut scratch.iov;
      scratch.msg.msg_iovlen = 1;
      opcode::SendMsg::new(Fd(*fd), &scratch.msg).build()
    }
    Op::FileOpen { path, flags, mode } => {
      opcode::OpenAt::new(Fd(libc::AT_FDCWD), path.as_ptr())
        .flags(*flags | libc::O_CLOEXEC)
        .mode(*mode)
        .build()
    }
    Op::FileRead { fd, buf, len, offset } => {
      opcode::Read::new(Fd(*fd), *buf, *len as u32)
        .offset(*offset as u64)
        .build()
    }
    Op::FileWrite { fd, buf, len, offset } => {
      opcode::Write::new(Fd(*fd), *buf, *len as u32)
        .offset(*offset as u64)
        .build()
    }
    Op::FileSync { fd } => opcode::Fsync::new(Fd(*fd)).build(),
    Op::FileRename { from, to } => opcode::RenameAt::new(
      Fd(libc::AT_FDCWD),
      from.as_ptr(),
      Fd(libc::AT_FDCWD),
      to.as_ptr(),
    )
    .build(),
    Op::FileDelete { path } => {
      opcode::UnlinkAt::new(Fd(libc::AT_FDCWD), path.as_ptr()).build()
    }
    Op::Bind { .. }
    | Op::Listen { .. }
    | Op::SocketClose { .. }
    | Op::FileClose { .. }
    | Op::Shutdown { .. }
    | Op::Wake
    | Op::Cancel { .. }
    | Op::Work { .. }
    | Op::GetAddrInfo { .. }
    | Op::GetNameInfo { .. } => {
      unreachable!("op {:?} does not produce an SQE", op.kind())
    }
  }
}

/// Maps a raw CQE result onto the completion's tagged result slot.
fn store_result(c: &mut Completion, res: i32) {
  if let Op::Timer { .. } = c.op {
    // ETIME is the normal expiry; ECANCELED a removed timer.
    let result = match -res {
      0 | libc::ETIME => Ok(()),
      errno => Err(Error::from_errno(errno)),
    };
    c.set_result(OpResult::Unit(result));
    c.set_state(State::Completed);
    return;
  }

  if res < 0 {
    c.set_error(Error::from_errno(-res));
    c.set_state(State::Completed);
    return;
  }

  let result = match &c.op {
    Op::SocketOpen { .. } | Op::Accept { .. } | Op::FileOpen { .. } => {
      OpResult::Fd(Ok(res as RawFd))
    }
    Op::Recv { .. }
    | Op::Send { .. }
    | Op::SendTo { .. }
    | Op::FileRead { .. }
    | Op::FileWrite { .. } => OpResult::Bytes(Ok(res as usize)),
    Op::RecvFrom { .. } => {
      c.scratch.addr_len = c.scratch.msg.msg_namelen;
      OpResult::RecvFrom(Ok((res as usize, c.scratch.take_addr())))
    }
    Op::Connect { .. } => OpResult::Unit(Ok(())),
    Op::FileSync { .. } | Op::FileRename { .. } | Op::FileDelete { .. } => {
      OpResult::Unit(Ok(()))
    }
    other => unreachable!("unexpected ring completion for {:?}", other.kind()),
  };
  c.set_result(result);
  c.set_state(State::Completed);
}

fn drain_eventfd(fd: RawFd) {
  let mut counter = 0u64;
  loop {
    let n = unsafe {
      libc::read(
        fd,
        &mut counter as *mut u64 as *mut libc::c_void,
        std::mem::size_of::<u64>(),
      )
    };
    if n <= 0 {
      break;
    }
  }
}

fn recoverable(err: &std::io::Error) -> bool {
  matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::EBUSY))
}

fn os_error(err: std::io::Error) -> Error {
  err.raw_os_error().map(Error::from_errno).unwrap_or(Error::Unexpected)
}
