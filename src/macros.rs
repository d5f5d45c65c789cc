/// Invokes a libc function, translating `-1` into the crate error taxonomy.
///
/// Returns `Ok(ret)` with the raw return value on success, or
/// `Err(Error)` mapped from `errno`.
macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) };
      if res == -1 {
          Err($crate::error::Error::last_os())
      } else {
          Ok(res)
      }
  }};
}

/// Same as `syscall!`, but retries while the call fails with `EINTR`.
macro_rules! syscall_eintr {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      loop {
          #[allow(unused_unsafe)]
          let res = unsafe { libc::$fn($($arg, )*) };
          if res != -1 {
              break Ok(res);
          }
          let errno = $crate::error::errno();
          if errno != libc::EINTR {
              break Err($crate::error::Error::from_errno(errno));
          }
      }
  }};
}
