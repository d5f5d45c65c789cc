//! kqueue shim for the readiness backend.
//!
//! Read and write interest are separate filters; `add`/`modify` install
//! both as needed and `delete` removes whichever are present.

#![cfg(kqueue)]

use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::backend::poll::Event;
use crate::error::Error;

pub(crate) struct OsPoller {
  kq: OwnedFd,
  native: Vec<libc::kevent>,
}

impl OsPoller {
  pub(crate) fn new(capacity: usize) -> Result<OsPoller, Error> {
    let raw = syscall!(kqueue())?;
    syscall!(fcntl(raw, libc::F_SETFD, libc::FD_CLOEXEC))?;
    Ok(OsPoller {
      kq: unsafe { OwnedFd::from_raw_fd(raw) },
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
    self.update(fd, key, read, write)
  }

  pub(crate) fn modify(
    &self,
    fd: RawFd,
    key: u64,
    read: bool,
    write: bool,
  ) -> Result<(), Error> {
    self.update(fd, key, read, write)
  }

  pub(crate) fn delete(&self, fd: RawFd) -> Result<(), Error> {
    let changes = [
      self.change(fd, 0, libc::EVFILT_READ, libc::EV_DELETE),
      self.change(fd, 0, libc::EVFILT_WRITE, libc::EV_DELETE),
    ];
    // One of the filters may not be installed; ENOENT per-filter is fine
    // and reported in the event flags, not the call result.
    let _ = unsafe {
      libc::kevent(
        self.kq.as_raw_fd(),
        changes.as_ptr(),
        changes.len() as libc::c_int,
        std::ptr::null_mut(),
        0,
        std::ptr::null(),
      )
    };
    Ok(())
  }

  fn update(
    &self,
    fd: RawFd,
    key: u64,
    read: bool,
    write: bool,
  ) -> Result<(), Error> {
    let mut changes = Vec::with_capacity(2);
    changes.push(self.change(
      fd,
      key,
      libc::EVFILT_READ,
      if read { libc::EV_ADD | libc::EV_ENABLE } else { libc::EV_DELETE },
    ));
    changes.push(self.change(
      fd,
      key,
      libc::EVFILT_WRITE,
      if write { libc::EV_ADD | libc::EV_ENABLE } else { libc::EV_DELETE },
    ));
    let res = unsafe {
      libc::kevent(
        self.kq.as_raw_fd(),
        changes.as_ptr(),
        changes.len() as libc::c_int,
        std::ptr::null_mut(),
        0,
        std::ptr::null(),
      )
    };
    if res == -1 {
      let errno = crate::error::errno();
      // Deleting an absent filter is part of normal interest updates.
      if errno != libc::ENOENT {
        return Err(Error::from_errno(errno));
      }
    }
    Ok(())
  }

  fn change(
    &self,
    fd: RawFd,
    key: u64,
    filter: i16,
    flags: u16,
  ) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = fd as libc::uintptr_t;
    ev.filter = filter;
    ev.flags = flags;
    ev.udata = key as _;
    ev
  }

  pub(crate) fn wait(
    &mut self,
    timeout: Option<Duration>,
    out: &mut Vec<Event>,
  ) -> Result<usize, Error> {
    let ts = timeout.map(|d| libc::timespec {
      tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
      tv_nsec: d.subsec_nanos() as _,
    });
    let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| t as *const _);

    let capacity = self.native.capacity();
    let n = loop {
      let n = unsafe {
        libc::kevent(
          self.kq.as_raw_fd(),
          std::ptr::null(),
          0,
          self.native.as_mut_ptr(),
          capacity as libc::c_int,
          ts_ptr,
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
      let err = ev.flags & libc::EV_ERROR != 0 || ev.flags & libc::EV_EOF != 0;
      out.push(Event {
        key: ev.udata as u64,
        readable: err || ev.filter == libc::EVFILT_READ,
        writable: err || ev.filter == libc::EVFILT_WRITE,
      });
    }
    Ok(n)
  }
}
