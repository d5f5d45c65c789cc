//! OS shims: thin translation from raw syscalls to the normalized
//! taxonomy.
//!
//! Two entry points matter: [`perform_blocking`] runs an operation to
//! completion on the calling thread (used by pool workers), and
//! [`perform_nonblocking`] runs the readiness backend's post-poll syscall,
//! reporting `None` when the descriptor turned out not ready after all.

#![cfg(unix)]

use std::ffi::c_void;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;

use crate::addr::{AddrInfo, AddrInfoHints, SockAddr};
use crate::completion::{Completion, Op, OpResult, ShutdownHow};
use crate::error::Error;

pub(crate) fn socket(
  domain: i32,
  socktype: i32,
  protocol: i32,
) -> Result<RawFd, Error> {
  #[cfg(any(linux, bsd))]
  {
    syscall!(socket(domain, socktype | libc::SOCK_CLOEXEC, protocol))
  }
  #[cfg(not(any(linux, bsd)))]
  {
    let fd = syscall!(socket(domain, socktype, protocol))?;
    syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    Ok(fd)
  }
}

pub(crate) fn bind(fd: RawFd, addr: &SockAddr) -> Result<(), Error> {
  syscall!(bind(fd, addr.as_ptr(), addr.len())).map(|_| ())
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> Result<(), Error> {
  syscall!(listen(fd, backlog)).map(|_| ())
}

pub(crate) fn shutdown(fd: RawFd, how: ShutdownHow) -> Result<(), Error> {
  syscall!(shutdown(fd, how.as_raw())).map(|_| ())
}

pub(crate) fn close(fd: RawFd) -> Result<(), Error> {
  syscall!(close(fd)).map(|_| ())
}

/// Accepts one connection; the accepted descriptor is close-on-exec and
/// non-blocking.
pub(crate) fn accept(
  fd: RawFd,
  addr: *mut libc::sockaddr_storage,
  len: *mut libc::socklen_t,
) -> Result<RawFd, Error> {
  #[cfg(any(linux, bsd))]
  {
    syscall_eintr!(accept4(
      fd,
      addr as *mut libc::sockaddr,
      len,
      libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK
    ))
  }
  #[cfg(not(any(linux, bsd)))]
  {
    let sock = syscall_eintr!(accept(fd, addr as *mut libc::sockaddr, len))?;
    if let Err(err) = syscall!(fcntl(sock, libc::F_SETFD, libc::FD_CLOEXEC))
      .and_then(|_| syscall!(fcntl(sock, libc::F_SETFL, libc::O_NONBLOCK)))
    {
      unsafe { libc::close(sock) };
      return Err(err);
    }
    Ok(sock)
  }
}

// No EINTR retry: a second connect after an interrupted one reports
// EALREADY rather than progress.
pub(crate) fn connect(fd: RawFd, addr: &SockAddr) -> Result<(), Error> {
  syscall!(connect(fd, addr.as_ptr(), addr.len())).map(|_| ())
}

/// `connect` raw variant keeping `EINPROGRESS` visible for the readiness
/// backend's writable-then-check protocol.
pub(crate) fn connect_raw_errno(fd: RawFd, addr: &SockAddr) -> Result<(), i32> {
  let res = unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) };
  if res == 0 {
    Ok(())
  } else {
    Err(crate::error::errno())
  }
}

/// Fetches and clears the pending socket error after a writable event.
pub(crate) fn take_socket_error(fd: RawFd) -> Result<(), Error> {
  let mut err: libc::c_int = 0;
  let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
  syscall!(getsockopt(
    fd,
    libc::SOL_SOCKET,
    libc::SO_ERROR,
    &mut err as *mut libc::c_int as *mut c_void,
    &mut len,
  ))?;
  if err == 0 {
    Ok(())
  } else {
    Err(Error::from_errno(err))
  }
}

pub(crate) fn recv(
  fd: RawFd,
  buf: *mut u8,
  len: usize,
  flags: i32,
) -> Result<usize, Error> {
  syscall_eintr!(recv(fd, buf as *mut c_void, len, flags)).map(|n| n as usize)
}

pub(crate) fn send(
  fd: RawFd,
  buf: *const u8,
  len: usize,
  flags: i32,
) -> Result<usize, Error> {
  syscall_eintr!(send(fd, buf as *const c_void, len, send_flags(flags)))
    .map(|n| n as usize)
}

pub(crate) fn recv_from(
  fd: RawFd,
  buf: *mut u8,
  len: usize,
  flags: i32,
  addr: *mut libc::sockaddr_storage,
  addr_len: *mut libc::socklen_t,
) -> Result<usize, Error> {
  syscall_eintr!(recvfrom(
    fd,
    buf as *mut c_void,
    len,
    flags,
    addr as *mut libc::sockaddr,
    addr_len,
  ))
  .map(|n| n as usize)
}

pub(crate) fn send_to(
  fd: RawFd,
  buf: *const u8,
  len: usize,
  flags: i32,
  addr: &SockAddr,
) -> Result<usize, Error> {
  syscall_eintr!(sendto(
    fd,
    buf as *const c_void,
    len,
    send_flags(flags),
    addr.as_ptr(),
    addr.len(),
  ))
  .map(|n| n as usize)
}

// Suppress SIGPIPE where the platform allows it on the call.
fn send_flags(flags: i32) -> i32 {
  #[cfg(any(linux, bsd))]
  {
    flags | libc::MSG_NOSIGNAL
  }
  #[cfg(not(any(linux, bsd)))]
  {
    flags
  }
}

pub(crate) fn open(
  path: *const libc::c_char,
  flags: i32,
  mode: u32,
) -> Result<RawFd, Error> {
  syscall_eintr!(open(path, flags | libc::O_CLOEXEC, mode as libc::c_uint))
}

pub(crate) fn read(
  fd: RawFd,
  buf: *mut u8,
  len: usize,
  offset: i64,
) -> Result<usize, Error> {
  let n = if offset < 0 {
    syscall_eintr!(read(fd, buf as *mut c_void, len))?
  } else {
    syscall_eintr!(pread(fd, buf as *mut c_void, len, offset as libc::off_t))?
  };
  Ok(n as usize)
}

pub(crate) fn write(
  fd: RawFd,
  buf: *const u8,
  len: usize,
  offset: i64,
) -> Result<usize, Error> {
  let n = if offset < 0 {
    syscall_eintr!(write(fd, buf as *const c_void, len))?
  } else {
    syscall_eintr!(pwrite(fd, buf as *const c_void, len, offset as libc::off_t))?
  };
  Ok(n as usize)
}

pub(crate) fn fsync(fd: RawFd) -> Result<(), Error> {
  syscall_eintr!(fsync(fd)).map(|_| ())
}

pub(crate) fn rename(
  from: *const libc::c_char,
  to: *const libc::c_char,
) -> Result<(), Error> {
  syscall!(rename(from, to)).map(|_| ())
}

pub(crate) fn unlink(path: *const libc::c_char) -> Result<(), Error> {
  syscall!(unlink(path)).map(|_| ())
}

/// Local address of a bound socket, with the OS-assigned port filled in.
pub fn getsockname(fd: RawFd) -> Result<SockAddr, Error> {
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  syscall!(getsockname(
    fd,
    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
    &mut len,
  ))?;
  Ok(SockAddr::from_raw(storage, len))
}

fn getaddrinfo_into(
  host: &std::ffi::CStr,
  service: &std::ffi::CStr,
  hints: &AddrInfoHints,
  out: *mut AddrInfo,
  cap: usize,
) -> Result<usize, Error> {
  let mut raw_hints: libc::addrinfo = unsafe { mem::zeroed() };
  raw_hints.ai_family = hints.family;
  raw_hints.ai_socktype = hints.socktype;
  raw_hints.ai_protocol = hints.protocol;
  raw_hints.ai_flags = hints.flags;

  let host_ptr =
    if host.is_empty() { ptr::null() } else { host.as_ptr() };
  let service_ptr =
    if service.is_empty() { ptr::null() } else { service.as_ptr() };

  let mut list: *mut libc::addrinfo = ptr::null_mut();
  let rc =
    unsafe { libc::getaddrinfo(host_ptr, service_ptr, &raw_hints, &mut list) };
  if rc != 0 {
    return Err(Error::from_eai(rc));
  }

  let mut count = 0usize;
  let mut cursor = list;
  let result = loop {
    if cursor.is_null() {
      break if count == 0 {
        Err(Error::NameHasNoUsableAddress)
      } else {
        Ok(count)
      };
    }
    let ai = unsafe { &*cursor };
    if count == cap {
      // Caller-sized buffer overflow.
      break Err(Error::SystemResources);
    }
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let addr_len = (ai.ai_addrlen as usize)
      .min(mem::size_of::<libc::sockaddr_storage>());
    unsafe {
      ptr::copy_nonoverlapping(
        ai.ai_addr as *const u8,
        &mut storage as *mut libc::sockaddr_storage as *mut u8,
        addr_len,
      );
      *out.add(count) = AddrInfo {
        family: ai.ai_family,
        socktype: ai.ai_socktype,
        protocol: ai.ai_protocol,
        addr: SockAddr::from_raw(storage, addr_len as libc::socklen_t),
      };
    }
    count += 1;
    cursor = ai.ai_next;
  };

  unsafe { libc::freeaddrinfo(list) };
  result
}

fn getnameinfo_into(
  addr: &SockAddr,
  flags: i32,
  host: *mut u8,
  host_cap: usize,
  service: *mut u8,
  service_cap: usize,
) -> Result<(usize, usize), Error> {
  let host_ptr = if host_cap == 0 {
    ptr::null_mut()
  } else {
    host as *mut libc::c_char
  };
  let service_ptr = if service_cap == 0 {
    ptr::null_mut()
  } else {
    service as *mut libc::c_char
  };

  let rc = unsafe {
    libc::getnameinfo(
      addr.as_ptr(),
      addr.len(),
      host_ptr,
      host_cap as libc::socklen_t,
      service_ptr,
      service_cap as libc::socklen_t,
      flags,
    )
  };
  if rc != 0 {
    return Err(Error::from_eai(rc));
  }

  let host_len = written_len(host, host_cap);
  let service_len = written_len(service, service_cap);
  Ok((host_len, service_len))
}

// Length of the NUL-terminated string the OS wrote into `buf`.
fn written_len(buf: *const u8, cap: usize) -> usize {
  if buf.is_null() || cap == 0 {
    return 0;
  }
  let mut n = 0;
  while n < cap {
    if unsafe { *buf.add(n) } == 0 {
      break;
    }
    n += 1;
  }
  n
}

/// Runs an operation to completion on the calling thread.
///
/// This is the pool worker's execution path; it covers every kind the
/// loop may route off the backend, plus the synchronous class for the
/// overlapped-port fallback.
pub(crate) fn perform_blocking(c: &mut Completion) -> OpResult {
  let Completion { op, scratch, userdata, .. } = c;
  match op {
    Op::Work { func } => {
      func(*userdata);
      OpResult::Unit(Ok(()))
    }
    Op::GetAddrInfo { host, service, hints, out, cap } => {
      OpResult::AddrInfo(getaddrinfo_into(host, service, hints, *out, *cap))
    }
    Op::GetNameInfo { addr, flags, host, host_cap, service, service_cap } => {
      OpResult::NameInfo(getnameinfo_into(
        addr,
        *flags,
        *host,
        *host_cap,
        *service,
        *service_cap,
      ))
    }
    Op::FileOpen { path, flags, mode } => {
      OpResult::Fd(open(path.as_ptr(), *flags, *mode))
    }
    Op::FileClose { fd } | Op::SocketClose { fd } => {
      OpResult::Unit(close(*fd))
    }
    Op::FileRead { fd, buf, len, offset } => {
      OpResult::Bytes(read(*fd, *buf, *len, *offset))
    }
    Op::FileWrite { fd, buf, len, offset } => {
      OpResult::Bytes(write(*fd, *buf, *len, *offset))
    }
    Op::FileSync { fd } => OpResult::Unit(fsync(*fd)),
    Op::FileRename { from, to } => {
      OpResult::Unit(rename(from.as_ptr(), to.as_ptr()))
    }
    Op::FileDelete { path } => OpResult::Unit(unlink(path.as_ptr())),
    Op::SocketOpen { domain, socktype, protocol } => {
      OpResult::Fd(socket(*domain, *socktype, *protocol))
    }
    Op::Bind { fd, addr } => OpResult::Unit(bind(*fd, addr)),
    Op::Listen { fd, backlog } => OpResult::Unit(listen(*fd, *backlog)),
    Op::Shutdown { fd, how } => OpResult::Unit(shutdown(*fd, *how)),
    Op::Accept { fd } => {
      scratch.reset_addr();
      OpResult::Fd(accept(
        *fd,
        &mut scratch.addr,
        &mut scratch.addr_len,
      ))
    }
    Op::Connect { fd, addr } => OpResult::Unit(connect(*fd, addr)),
    Op::Recv { fd, buf, len } => OpResult::Bytes(recv(*fd, *buf, *len, 0)),
    Op::Send { fd, buf, len } => OpResult::Bytes(send(*fd, *buf, *len, 0)),
    Op::RecvFrom { fd, buf, len } => {
      scratch.reset_addr();
      let res =
        recv_from(*fd, *buf, *len, 0, &mut scratch.addr, &mut scratch.addr_len)
          .map(|n| (n, scratch.take_addr()));
      OpResult::RecvFrom(res)
    }
    Op::SendTo { fd, buf, len, addr } => {
      OpResult::Bytes(send_to(*fd, *buf, *len, 0, addr))
    }
    Op::Timer { .. } | Op::Wake | Op::Cancel { .. } => {
      unreachable!("loop-internal op handed to a blocking shim")
    }
  }
}

/// Runs the readiness backend's inline syscall after a readiness event.
///
/// Returns `None` when the call reports `WouldBlock`, in which case the
/// caller re-arms interest and waits again.
pub(crate) fn perform_nonblocking(c: &mut Completion) -> Option<OpResult> {
  let Completion { op, scratch, .. } = c;
  let result = match op {
    Op::Accept { fd } => {
      scratch.reset_addr();
      OpResult::Fd(accept(*fd, &mut scratch.addr, &mut scratch.addr_len))
    }
    Op::Connect { fd, .. } => {
      // Writable after EINPROGRESS: the verdict lives in SO_ERROR.
      OpResult::Unit(take_socket_error(*fd))
    }
    Op::Recv { fd, buf, len } => {
      OpResult::Bytes(recv(*fd, *buf, *len, libc::MSG_DONTWAIT))
    }
    Op::Send { fd, buf, len } => {
      OpResult::Bytes(send(*fd, *buf, *len, libc::MSG_DONTWAIT))
    }
    Op::RecvFrom { fd, buf, len } => {
      scratch.reset_addr();
      let res = recv_from(
        *fd,
        *buf,
        *len,
        libc::MSG_DONTWAIT,
        &mut scratch.addr,
        &mut scratch.addr_len,
      )
      .map(|n| (n, scratch.take_addr()));
      OpResult::RecvFrom(res)
    }
    Op::SendTo { fd, buf, len, addr } => {
      OpResult::Bytes(send_to(*fd, *buf, *len, libc::MSG_DONTWAIT, addr))
    }
    other => unreachable!(
      "op {:?} is not a readiness-driven operation",
      other.kind()
    ),
  };

  match result {
    OpResult::Fd(Err(Error::WouldBlock))
    | OpResult::Bytes(Err(Error::WouldBlock))
    | OpResult::RecvFrom(Err(Error::WouldBlock)) => None,
    other => Some(other),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::ffi::CString;

  #[test]
  fn socket_bind_getsockname_round_trip() {
    let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
    let want: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    bind(fd, &SockAddr::from(want)).unwrap();

    let got = getsockname(fd).unwrap().to_std().unwrap();
    assert_eq!(got.ip(), want.ip());
    assert_ne!(got.port(), 0, "OS assigns a port for port 0");
    close(fd).unwrap();
  }

  #[test]
  fn getaddrinfo_numeric_localhost() {
    let mut records = [AddrInfo::default(); 4];
    let n = getaddrinfo_into(
      &CString::new("127.0.0.1").unwrap(),
      &CString::new("80").unwrap(),
      &AddrInfoHints {
        family: libc::AF_INET,
        socktype: libc::SOCK_STREAM,
        ..Default::default()
      },
      records.as_mut_ptr(),
      records.len(),
    )
    .unwrap();
    assert!(n >= 1);
    assert_eq!(records[0].family, libc::AF_INET);
    assert_eq!(records[0].addr.port(), Some(80));
  }

  #[test]
  fn getnameinfo_numeric() {
    let addr = SockAddr::from("127.0.0.1:8080".parse::<std::net::SocketAddr>().unwrap());
    let mut host = [0u8; 64];
    let mut service = [0u8; 16];
    let (h, s) = getnameinfo_into(
      &addr,
      libc::NI_NUMERICHOST | libc::NI_NUMERICSERV,
      host.as_mut_ptr(),
      host.len(),
      service.as_mut_ptr(),
      service.len(),
    )
    .unwrap();
    assert_eq!(&host[..h], b"127.0.0.1");
    assert_eq!(&service[..s], b"8080");
  }
}
