//! The normalized error taxonomy.
//!
//! Every raw OS error that can surface from a submitted operation is
//! translated into this closed set at the shim boundary; codes with no
//! mapping become [`Error::Unexpected`].

use thiserror::Error;

/// Normalized operation error.
///
/// Stored on a completion when an operation fails and surfaced through the
/// typed result accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
  #[error("access denied")]
  AccessDenied,
  #[error("permission denied")]
  PermissionDenied,
  #[error("too many levels of symbolic links")]
  SymLinkLoop,
  #[error("process file descriptor quota exceeded")]
  ProcessFdQuotaExceeded,
  #[error("system file descriptor quota exceeded")]
  SystemFdQuotaExceeded,
  #[error("no such device")]
  NoDevice,
  #[error("file not found")]
  FileNotFound,
  #[error("name too long")]
  NameTooLong,
  #[error("system resources exhausted")]
  SystemResources,
  #[error("file too big")]
  FileTooBig,
  #[error("is a directory")]
  IsDir,
  #[error("no space left on device")]
  NoSpaceLeft,
  #[error("not a directory")]
  NotDir,
  #[error("path already exists")]
  PathAlreadyExists,
  #[error("device busy")]
  DeviceBusy,
  #[error("file busy")]
  FileBusy,
  #[error("bad path name")]
  BadPathName,
  #[error("operation would block")]
  WouldBlock,
  #[error("connection reset by peer")]
  ConnectionResetByPeer,
  #[error("connection timed out")]
  ConnectionTimedOut,
  #[error("input/output error")]
  InputOutput,
  #[error("operation aborted")]
  OperationAborted,
  #[error("broken pipe")]
  BrokenPipe,
  #[error("socket not connected")]
  SocketNotConnected,
  #[error("not open for reading")]
  NotOpenForReading,
  #[error("not open for writing")]
  NotOpenForWriting,
  #[error("disk quota exceeded")]
  DiskQuota,
  #[error("lock violation")]
  LockViolation,
  #[error("unknown host name")]
  UnknownHostName,
  #[error("temporary name server failure")]
  TemporaryNameServerFailure,
  #[error("address family not supported")]
  AddressFamilyNotSupported,
  #[error("service not available for socket type")]
  ServiceNotAvailableForSocketType,
  #[error("invalid flags")]
  InvalidFlags,
  #[error("permanent name server failure")]
  PermanentNameServerFailure,
  #[error("name has no usable address")]
  NameHasNoUsableAddress,
  #[error("operation canceled")]
  Canceled,
  #[error("no thread pool attached to the loop")]
  NoThreadPool,
  #[error("unexpected OS error")]
  Unexpected,
}

/// Reads the calling thread's `errno`.
#[cfg(unix)]
pub(crate) fn errno() -> i32 {
  #[cfg(linux)]
  unsafe {
    *libc::__errno_location()
  }
  #[cfg(any(apple, bsd))]
  unsafe {
    *libc::__error()
  }
  #[cfg(not(any(linux, apple, bsd)))]
  unsafe {
    *libc::__errno_location()
  }
}

impl Error {
  /// Translates the calling thread's current `errno`.
  #[cfg(unix)]
  pub(crate) fn last_os() -> Error {
    Error::from_errno(errno())
  }

  /// Translates a raw errno value into the taxonomy.
  #[cfg(unix)]
  pub fn from_errno(errno: i32) -> Error {
    match errno {
      libc::EACCES | libc::EROFS => Error::AccessDenied,
      libc::EPERM => Error::PermissionDenied,
      libc::ELOOP => Error::SymLinkLoop,
      libc::EMFILE => Error::ProcessFdQuotaExceeded,
      libc::ENFILE => Error::SystemFdQuotaExceeded,
      libc::ENODEV | libc::ENXIO => Error::NoDevice,
      libc::ENOENT => Error::FileNotFound,
      libc::ENAMETOOLONG => Error::NameTooLong,
      libc::ENOMEM | libc::ENOBUFS => Error::SystemResources,
      libc::EFBIG | libc::EOVERFLOW => Error::FileTooBig,
      libc::EISDIR => Error::IsDir,
      libc::ENOSPC => Error::NoSpaceLeft,
      libc::ENOTDIR => Error::NotDir,
      libc::EEXIST => Error::PathAlreadyExists,
      libc::EBUSY => Error::DeviceBusy,
      libc::ETXTBSY => Error::FileBusy,
      libc::EILSEQ => Error::BadPathName,
      libc::EAGAIN => Error::WouldBlock,
      libc::ECONNRESET => Error::ConnectionResetByPeer,
      libc::ETIMEDOUT => Error::ConnectionTimedOut,
      libc::EIO => Error::InputOutput,
      libc::ECONNABORTED => Error::OperationAborted,
      libc::EPIPE => Error::BrokenPipe,
      libc::ENOTCONN | libc::EDESTADDRREQ => Error::SocketNotConnected,
      libc::EDQUOT => Error::DiskQuota,
      libc::ECANCELED => Error::Canceled,
      libc::EAFNOSUPPORT => Error::AddressFamilyNotSupported,
      _ => Error::Unexpected,
    }
  }

  /// Translates a Win32/WinSock error code into the taxonomy.
  #[cfg(windows)]
  pub fn from_win32(code: i32) -> Error {
    use windows_sys::Win32::Foundation as f;
    use windows_sys::Win32::Networking::WinSock as ws;

    match code as u32 {
      c if c == f::ERROR_ACCESS_DENIED => Error::AccessDenied,
      c if c == f::ERROR_FILE_NOT_FOUND || c == f::ERROR_PATH_NOT_FOUND => {
        Error::FileNotFound
      }
      c if c == f::ERROR_ALREADY_EXISTS || c == f::ERROR_FILE_EXISTS => {
        Error::PathAlreadyExists
      }
      c if c == f::ERROR_DISK_FULL => Error::NoSpaceLeft,
      c if c == f::ERROR_LOCK_VIOLATION => Error::LockViolation,
      c if c == f::ERROR_OPERATION_ABORTED => Error::OperationAborted,
      c if c == f::ERROR_BROKEN_PIPE => Error::BrokenPipe,
      c if c == f::ERROR_NOT_ENOUGH_MEMORY || c == f::ERROR_OUTOFMEMORY => {
        Error::SystemResources
      }
      c if c == ws::WSAECONNRESET as u32 => Error::ConnectionResetByPeer,
      c if c == ws::WSAETIMEDOUT as u32 => Error::ConnectionTimedOut,
      c if c == ws::WSAENOTCONN as u32 => Error::SocketNotConnected,
      c if c == ws::WSAECONNABORTED as u32 => Error::OperationAborted,
      c if c == ws::WSAEWOULDBLOCK as u32 => Error::WouldBlock,
      c if c == ws::WSAEAFNOSUPPORT as u32 => Error::AddressFamilyNotSupported,
      c if c == ws::WSAEMFILE as u32 => Error::ProcessFdQuotaExceeded,
      c if c == ws::WSAHOST_NOT_FOUND as u32 => Error::UnknownHostName,
      c if c == ws::WSATRY_AGAIN as u32 => Error::TemporaryNameServerFailure,
      c if c == ws::WSANO_RECOVERY as u32 => Error::PermanentNameServerFailure,
      c if c == ws::WSANO_DATA as u32 => Error::NameHasNoUsableAddress,
      _ => Error::Unexpected,
    }
  }

  /// Translates a `getaddrinfo(3)`/`getnameinfo(3)` return code.
  ///
  /// `EAI_SYSTEM` defers to `errno`.
  #[cfg(unix)]
  pub(crate) fn from_eai(code: i32) -> Error {
    match code {
      libc::EAI_NONAME => Error::UnknownHostName,
      libc::EAI_AGAIN => Error::TemporaryNameServerFailure,
      libc::EAI_FAIL => Error::PermanentNameServerFailure,
      libc::EAI_FAMILY => Error::AddressFamilyNotSupported,
      libc::EAI_SERVICE => Error::ServiceNotAvailableForSocketType,
      libc::EAI_SOCKTYPE => Error::ServiceNotAvailableForSocketType,
      libc::EAI_BADFLAGS => Error::InvalidFlags,
      libc::EAI_MEMORY | libc::EAI_OVERFLOW => Error::SystemResources,
      libc::EAI_SYSTEM => Error::last_os(),
      _ => Error::Unexpected,
    }
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;

  #[test]
  fn maps_common_errnos() {
    assert_eq!(Error::from_errno(libc::ENOENT), Error::FileNotFound);
    assert_eq!(Error::from_errno(libc::EACCES), Error::AccessDenied);
    assert_eq!(Error::from_errno(libc::EAGAIN), Error::WouldBlock);
    assert_eq!(Error::from_errno(libc::ECANCELED), Error::Canceled);
    assert_eq!(Error::from_errno(libc::EPIPE), Error::BrokenPipe);
  }

  #[test]
  fn unknown_errno_is_unexpected() {
    assert_eq!(Error::from_errno(9999), Error::Unexpected);
  }

  #[test]
  fn eai_codes_map_to_resolver_errors() {
    assert_eq!(Error::from_eai(libc::EAI_NONAME), Error::UnknownHostName);
    assert_eq!(
      Error::from_eai(libc::EAI_AGAIN),
      Error::TemporaryNameServerFailure
    );
    assert_eq!(Error::from_eai(libc::EAI_OVERFLOW), Error::SystemResources);
  }
}
