//! Windows shims for pool-executed operations.
//!
//! The overlapped-port backend covers the socket data path; everything the
//! loop routes to the pool on Windows (filesystem work, name resolution,
//! datagram addressing) lands here, translated to the shared taxonomy.

#![cfg(windows)]

use std::ffi::c_void;
use std::mem;
use std::ptr;

use windows_sys::Win32::Foundation::{
  CloseHandle, GetLastError, FALSE, GENERIC_READ, GENERIC_WRITE, HANDLE,
  INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Networking::WinSock as ws;
use windows_sys::Win32::Storage::FileSystem as fs;

use crate::addr::{raw, AddrInfo, AddrInfoHints, SockAddr};
use crate::completion::{Completion, Op, OpResult};
use crate::error::Error;
use crate::OsFd;

// CRT-style open(2) flag values; callers pass the platform's open flags.
const O_WRONLY: i32 = 0x0001;
const O_RDWR: i32 = 0x0002;
const O_APPEND: i32 = 0x0008;
const O_CREAT: i32 = 0x0100;
const O_TRUNC: i32 = 0x0200;
const O_EXCL: i32 = 0x0400;

fn last_error() -> Error {
  Error::from_win32(unsafe { GetLastError() } as i32)
}

fn last_wsa_error() -> Error {
  Error::from_win32(unsafe { ws::WSAGetLastError() })
}

fn open(path: *const i8, flags: i32, _mode: u32) -> Result<OsFd, Error> {
  let access = if flags & O_RDWR != 0 {
    GENERIC_READ | GENERIC_WRITE
  } else if flags & O_WRONLY != 0 {
    GENERIC_WRITE
  } else {
    GENERIC_READ
  };
  let disposition = match (flags & O_CREAT != 0, flags & O_EXCL != 0) {
    (true, true) => fs::CREATE_NEW,
    (true, false) if flags & O_TRUNC != 0 => fs::CREATE_ALWAYS,
    (true, false) => fs::OPEN_ALWAYS,
    (false, _) if flags & O_TRUNC != 0 => fs::TRUNCATE_EXISTING,
    (false, _) => fs::OPEN_EXISTING,
  };
  let handle = unsafe {
    fs::CreateFileA(
      path as *const u8,
      access,
      fs::FILE_SHARE_READ | fs::FILE_SHARE_WRITE,
      ptr::null(),
      disposition,
      fs::FILE_ATTRIBUTE_NORMAL,
      ptr::null_mut(),
    )
  };
  if handle == INVALID_HANDLE_VALUE {
    return Err(last_error());
  }
  if flags & O_APPEND != 0 {
    let mut ignored = 0i64;
    unsafe { fs::SetFilePointerEx(handle, 0, &mut ignored, fs::FILE_END) };
  }
  Ok(handle as OsFd)
}

fn seek(handle: HANDLE, offset: i64) -> Result<(), Error> {
  let mut ignored = 0i64;
  let ok =
    unsafe { fs::SetFilePointerEx(handle, offset, &mut ignored, fs::FILE_BEGIN) };
  if ok == FALSE {
    Err(last_error())
  } else {
    Ok(())
  }
}

fn read(fd: OsFd, buf: *mut u8, len: usize, offset: i64) -> Result<usize, Error> {
  let handle = fd as HANDLE;
  if offset >= 0 {
    seek(handle, offset)?;
  }
  let mut n = 0u32;
  let ok = unsafe {
    fs::ReadFile(
      handle,
      buf,
      len.min(u32::MAX as usize) as u32,
      &mut n,
      ptr::null_mut(),
    )
  };
  if ok == FALSE {
    Err(last_error())
  } else {
    Ok(n as usize)
  }
}

fn write(
  fd: OsFd,
  buf: *const u8,
  len: usize,
  offset: i64,
) -> Result<usize, Error> {
  let handle = fd as HANDLE;
  if offset >= 0 {
    seek(handle, offset)?;
  }
  let mut n = 0u32;
  let ok = unsafe {
    fs::WriteFile(
      handle,
      buf,
      len.min(u32::MAX as usize) as u32,
      &mut n,
      ptr::null_mut(),
    )
  };
  if ok == FALSE {
    Err(last_error())
  } else {
    Ok(n as usize)
  }
}

fn getaddrinfo_into(
  host: &std::ffi::CStr,
  service: &std::ffi::CStr,
  hints: &AddrInfoHints,
  out: *mut AddrInfo,
  cap: usize,
) -> Result<usize, Error> {
  let mut raw_hints: ws::ADDRINFOA = unsafe { mem::zeroed() };
  raw_hints.ai_family = hints.family;
  raw_hints.ai_socktype = hints.socktype;
  raw_hints.ai_protocol = hints.protocol;
  raw_hints.ai_flags = hints.flags;

  let host_ptr =
    if host.is_empty() { ptr::null() } else { host.as_ptr() as *const u8 };
  let service_ptr = if service.is_empty() {
    ptr::null()
  } else {
    service.as_ptr() as *const u8
  };

  let mut list: *mut ws::ADDRINFOA = ptr::null_mut();
  let rc =
    unsafe { ws::getaddrinfo(host_ptr, service_ptr, &raw_hints, &mut list) };
  if rc != 0 {
    return Err(Error::from_win32(rc));
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
      break Err(Error::SystemResources);
    }
    let mut storage: raw::sockaddr_storage = unsafe { mem::zeroed() };
    let addr_len =
      (ai.ai_addrlen as usize).min(mem::size_of::<raw::sockaddr_storage>());
    unsafe {
      ptr::copy_nonoverlapping(
        ai.ai_addr as *const u8,
        &mut storage as *mut raw::sockaddr_storage as *mut u8,
        addr_len,
      );
      *out.add(count) = AddrInfo {
        family: ai.ai_family,
        socktype: ai.ai_socktype,
        protocol: ai.ai_protocol,
        addr: SockAddr::from_raw(storage, addr_len as raw::socklen_t),
      };
    }
    count += 1;
    cursor = ai.ai_next;
  };

  unsafe { ws::freeaddrinfo(list) };
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
  let rc = unsafe {
    ws::getnameinfo(
      addr.as_ptr() as *const ws::SOCKADDR,
      addr.len(),
      host,
      host_cap as u32,
      service,
      service_cap as u32,
      flags,
    )
  };
  if rc != 0 {
    return Err(Error::from_win32(rc));
  }
  Ok((written_len(host, host_cap), written_len(service, service_cap)))
}

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

/// Local address of a bound socket, with the OS-assigned port filled in.
pub fn getsockname(fd: OsFd) -> Result<SockAddr, Error> {
  let mut storage: raw::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<raw::sockaddr_storage>() as i32;
  let rc = unsafe {
    ws::getsockname(
      fd as ws::SOCKET,
      &mut storage as *mut raw::sockaddr_storage as *mut ws::SOCKADDR,
      &mut len,
    )
  };
  if rc != 0 {
    return Err(last_wsa_error());
  }
  Ok(SockAddr::from_raw(storage, len))
}

/// Runs an operation to completion on the calling thread.
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
    Op::FileClose { fd } => {
      let ok = unsafe { CloseHandle(*fd as HANDLE) };
      OpResult::Unit(if ok == FALSE { Err(last_error()) } else { Ok(()) })
    }
    Op::FileRead { fd, buf, len, offset } => {
      OpResult::Bytes(read(*fd, *buf, *len, *offset))
    }
    Op::FileWrite { fd, buf, len, offset } => {
      OpResult::Bytes(write(*fd, *buf, *len, *offset))
    }
    Op::FileSync { fd } => {
      let ok = unsafe { fs::FlushFileBuffers(*fd as HANDLE) };
      OpResult::Unit(if ok == FALSE { Err(last_error()) } else { Ok(()) })
    }
    Op::FileRename { from, to } => {
      let ok = unsafe {
        fs::MoveFileExA(
          from.as_ptr() as *const u8,
          to.as_ptr() as *const u8,
          fs::MOVEFILE_REPLACE_EXISTING,
        )
      };
      OpResult::Unit(if ok == FALSE { Err(last_error()) } else { Ok(()) })
    }
    Op::FileDelete { path } => {
      let ok = unsafe { fs::DeleteFileA(path.as_ptr() as *const u8) };
      OpResult::Unit(if ok == FALSE { Err(last_error()) } else { Ok(()) })
    }
    Op::RecvFrom { fd, buf, len } => {
      scratch.reset_addr();
      let mut addr_len = scratch.addr_len;
      let n = unsafe {
        ws::recvfrom(
          *fd as ws::SOCKET,
          *buf,
          (*len).min(i32::MAX as usize) as i32,
          0,
          &mut scratch.addr as *mut raw::sockaddr_storage as *mut ws::SOCKADDR,
          &mut addr_len,
        )
      };
      if n < 0 {
        OpResult::RecvFrom(Err(last_wsa_error()))
      } else {
        scratch.addr_len = addr_len;
        OpResult::RecvFrom(Ok((n as usize, scratch.take_addr())))
      }
    }
    Op::SendTo { fd, buf, len, addr } => {
      let n = unsafe {
        ws::sendto(
          *fd as ws::SOCKET,
          *buf,
          (*len).min(i32::MAX as usize) as i32,
          0,
          addr.as_ptr() as *const ws::SOCKADDR,
          addr.len(),
        )
      };
      if n < 0 {
        OpResult::Bytes(Err(last_wsa_error()))
      } else {
        OpResult::Bytes(Ok(n as usize))
      }
    }
    other => {
      // The overlapped-port backend owns the remaining kinds.
      OpResult::err_for(other.kind(), Error::Unexpected)
    }
  }
}
