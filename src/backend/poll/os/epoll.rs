//! epoll shim for the readiness backend.

#![cfg(linux)]

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::backend::poll::Event;
use crate::error::Error;

pub(crate) struct OsPoller {
  epfd: OwnedFd,
  native: Vec<libc::epoll_event>,
}

impl OsPoller {
  pub(crate) fn new(capacity: usize) -> Result<OsPoller, Error> {
    let raw = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
    Ok(OsPoller {
      epfd: unsafe { OwnedFd::from_raw_fd(raw) },
      native: Vec::with_capacity(capacity.max(8)),
    })
  }

  pub(crate) fn add(
    &self,
    fd: RawFd,
    key: u64,
    read: bool,
    write: bool,
  ) -> Result<(), Error> {
    self.ctl(libc::EPOLL_CTL_ADD, fd, key, read, write)
  }

  pub(crate) fn modify(
    &self,
    fd: RawFd,
    key: u64,
    read: bool,
    write: bool,
  ) -> Result<(), Error> {
    self.ctl(libc::EPOLL_CTL_MOD, fd, key, read, write)
  }

  pub(crate) fn delete(&self, fd: RawFd) -> Result<(), Error> {
    syscall!(epoll_ctl(
      self.epfd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      std::ptr::null_mut(),
    ))
    .map(|_| ())
  }

  fn ctl(
    &self,
    op: libc::c_int,
    fd: RawFd,
    key: u64,
    read: bool,
    write: bool,
  ) -> Result<(), Error> {
    let mut events = 0u32;
    if read {
      events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if write {
      events |= libc::EPOLLOUT as u32;
    }
    let mut ev = libc::epoll_event { events, u64: key };
    syscall!(epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev)).map(|_| ())
  }

  /// Waits for events and appends them, converted, onto `out`.
  pub(crate) fn wait(
    &mut self,
    timeout: Option<Duration>,
    out: &mut Vec<Event>,
  ) -> Result<usize, Error> {
    let millis = match timeout {
      None => -1,
      Some(d) => {
        // Round up so a sub-millisecond timer does not spin.
        let ms = d.as_millis();
        let ms = if d.subsec_nanos() % 1_000_000 != 0 { ms + 1 } else { ms };
        ms.min(i32::MAX as u128) as libc::c_int
      }
    };

    let capacity = self.native.capacity();
    let n = loop {
      let n = unsafe {
        libc::epoll_wait(
          self.epfd.as_raw_fd(),
          self.native.as_mut_ptr(),
          capacity as libc::c_int,
          millis,
        )
      };
      if n >= 0 {
        break n as usize;
      }
      let errno = crate::error::errno();
      if errno != libc::EINTR {
        return Err(Error::from_errno(errno));
      }
    };
    // SAFETY: the kernel initialized the first `n` entries.
    unsafe { self.native.set_len(n) };

    for ev in &self.native {
      let events = ev.events;
      let err = events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
      out.push(Event {
        key: ev.u64,
        readable: err
          || events & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0,
        writable: err || events & libc::EPOLLOUT as u32 != 0,
      });
    }
    Ok(n)
  }
}
