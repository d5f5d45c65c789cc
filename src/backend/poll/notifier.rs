//! Wake pipe for the readiness backend.
//!
//! The read end sits permanently in the interest set under a reserved
//! key; any thread writing a byte forces a blocked wait to return.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::error::Error;

/// Interest-set key of the notifier's read end.
pub(crate) const WAKE_KEY: u64 = u64::MAX;

pub(crate) struct Notifier {
  read_fd: OwnedFd,
  write_fd: Arc<OwnedFd>,
}

impl Notifier {
  pub(crate) fn new() -> Result<Notifier, Error> {
    let mut fds = [0 as libc::c_int; 2];
    #[cfg(not(apple))]
    {
      syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;
    }
    #[cfg(apple)]
    {
      syscall!(pipe(fds.as_mut_ptr()))?;
      for fd in fds {
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
      }
    }
    Ok(Notifier {
      read_fd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
      write_fd: Arc::new(unsafe { OwnedFd::from_raw_fd(fds[1]) }),
    })
  }

  pub(crate) fn read_fd(&self) -> RawFd {
    self.read_fd.as_raw_fd()
  }

  pub(crate) fn write_end(&self) -> Arc<OwnedFd> {
    Arc::clone(&self.write_fd)
  }

  /// Empties the pipe after a wake event.
  pub(crate) fn drain(&self) {
    let mut buf = [0u8; 64];
    loop {
      let n = unsafe {
        libc::read(
          self.read_fd.as_raw_fd(),
          buf.as_mut_ptr() as *mut libc::c_void,
          buf.len(),
        )
      };
      if n <= 0 {
        break;
      }
    }
  }
}
