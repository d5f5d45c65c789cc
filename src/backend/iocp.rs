//! Overlapped-port backend.
//!
//! One process-wide, reference-counted completion port serves every loop.
//! Each operation embeds an `OVERLAPPED` block in the completion's scratch
//! area with the owning completion stored right beside it, so a dequeued
//! packet maps back to its record without pointer arithmetic. AcceptEx and
//! ConnectEx are loaded per address family into a shared cache; their
//! post-completion `SO_UPDATE_*_CONTEXT` fix-ups run before the result is
//! reported. Filesystem and resolver work is routed to the thread pool by
//! the loop; recvfrom/sendto take the same route today.

#![cfg(windows)]

use std::collections::BinaryHeap;
use std::ffi::c_void;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use windows_sys::Win32::Foundation::{
  CloseHandle, GetLastError, ERROR_IO_PENDING, FALSE, HANDLE,
  INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock as ws;
use windows_sys::Win32::System::IO::{
  CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus,
  PostQueuedCompletionStatus, OVERLAPPED,
};

use crate::addr::{raw, SockAddr};
use crate::backend::RemoteWaker;
use crate::completion::{Completion, Op, OpResult, State};
use crate::error::Error;
use crate::queue::Queue;
use crate::sync::Mutex;
use crate::OsFd;

/// Completion key reserved for wake packets.
const WAKE_KEY: usize = usize::MAX;

/// AcceptEx wants room for local + remote address, each padded by 16.
const ACCEPT_ADDR_SPACE: usize =
  mem::size_of::<raw::sockaddr_storage>() + 16;

fn last_error() -> Error {
  Error::from_win32(unsafe { GetLastError() } as i32)
}

fn last_wsa_error() -> Error {
  Error::from_win32(unsafe { ws::WSAGetLastError() })
}

/// The process-wide port, shared by every loop and dropped with the last
/// reference.
pub(crate) struct SharedPort {
  handle: HANDLE,
}

// SAFETY: a completion port handle is a kernel object designed for
// concurrent use from any thread.
unsafe impl Send for SharedPort {}
unsafe impl Sync for SharedPort {}

impl SharedPort {
  fn obtain() -> Result<Arc<SharedPort>, Error> {
    static REGISTRY: Mutex<Weak<SharedPort>> = Mutex::new(Weak::new());

    let mut slot = REGISTRY.lock();
    if let Some(port) = slot.upgrade() {
      return Ok(port);
    }
    let handle = unsafe {
      CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 0)
    };
    if handle.is_null() {
      return Err(last_error());
    }
    debug!("created process-wide completion port");
    let port = Arc::new(SharedPort { handle });
    *slot = Arc::downgrade(&port);
    Ok(port)
  }

  pub(crate) fn post_wake(&self) {
    let ok = unsafe {
      PostQueuedCompletionStatus(self.handle, 0, WAKE_KEY, ptr::null_mut())
    };
    if ok == FALSE {
      warn!("wake packet post failed: {}", unsafe { GetLastError() });
    }
  }

  /// Surfaces a synchronously-finished operation through the normal
  /// dequeue path.
  fn post_manual(&self, overlapped: *mut OVERLAPPED) -> Result<(), Error> {
    let ok =
      unsafe { PostQueuedCompletionStatus(self.handle, 0, 0, overlapped) };
    if ok == FALSE {
      Err(last_error())
    } else {
      Ok(())
    }
  }
}

impl Drop for SharedPort {
  fn drop(&mut self) {
    unsafe { CloseHandle(self.handle) };
  }
}

/// Extension functions loaded per address family.
#[derive(Clone, Copy)]
struct ExtFns {
  acceptex: ws::LPFN_ACCEPTEX,
  connectex: ws::LPFN_CONNECTEX,
}

fn extension_fns(family: i32) -> Result<ExtFns, Error> {
  static CACHE: Mutex<Vec<(i32, ExtFns)>> = Mutex::new(Vec::new());

  let mut cache = CACHE.lock();
  if let Some((_, fns)) = cache.iter().find(|(f, _)| *f == family) {
    return Ok(*fns);
  }

  // A throwaway socket of the right family carries the ioctl.
  let probe =
    unsafe { ws::socket(family, ws::SOCK_STREAM, ws::IPPROTO_TCP) };
  if probe == ws::INVALID_SOCKET {
    return Err(last_wsa_error());
  }

  let load = |guid: windows_sys::core::GUID| -> Result<*mut c_void, Error> {
    let mut func: *mut c_void = ptr::null_mut();
    let mut bytes = 0u32;
    let rc = unsafe {
      ws::WSAIoctl(
        probe,
        ws::SIO_GET_EXTENSION_FUNCTION_POINTER,
        &guid as *const _ as *const c_void,
        mem::size_of::<windows_sys::core::GUID>() as u32,
        &mut func as *mut *mut c_void as *mut c_void,
        mem::size_of::<*mut c_void>() as u32,
        &mut bytes,
        ptr::null_mut(),
        None,
      )
    };
    if rc != 0 {
      Err(last_wsa_error())
    } else {
      Ok(func)
    }
  };

  let result = (|| {
    let acceptex = load(ws::WSAID_ACCEPTEX)?;
    let connectex = load(ws::WSAID_CONNECTEX)?;
    Ok(ExtFns {
      acceptex: unsafe { mem::transmute(acceptex) },
      connectex: unsafe { mem::transmute(connectex) },
    })
  })();
  unsafe { ws::closesocket(probe) };

  let fns = result?;
  cache.push((family, fns));
  Ok(fns)
}

/// Per-completion scratch shared with the kernel.
///
/// The `OVERLAPPED` block comes first and the owning completion sits right
/// after it, so a packet's `OVERLAPPED *` recovers the record by reading
/// the adjacent field.
#[repr(C)]
pub(crate) struct IocpScratch {
  overlapped: OVERLAPPED,
  owner: *mut Completion,
  accept_socket: ws::SOCKET,
  accept_buf: [u8; ACCEPT_ADDR_SPACE * 2],
}

impl IocpScratch {
  pub(crate) fn new() -> IocpScratch {
    IocpScratch {
      overlapped: unsafe { mem::zeroed() },
      owner: ptr::null_mut(),
      accept_socket: ws::INVALID_SOCKET,
      accept_buf: [0; ACCEPT_ADDR_SPACE * 2],
    }
  }
}

struct TimerEntry {
  deadline: Instant,
  c: NonNull<Completion>,
}

impl Ord for TimerEntry {
  fn cmp(&self, other: &TimerEntry) -> std::cmp::Ordering {
    other.deadline.cmp(&self.deadline)
  }
}
impl PartialOrd for TimerEntry {
  fn partial_cmp(&self, other: &TimerEntry) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}
impl PartialEq for TimerEntry {
  fn eq(&self, other: &TimerEntry) -> bool {
    self.deadline == other.deadline && self.c == other.c
  }
}
impl Eq for TimerEntry {}

pub(crate) struct Iocp {
  port: Arc<SharedPort>,
  /// Handles already associated with the port.
  associated: Vec<usize>,
  timers: BinaryHeap<TimerEntry>,
}

impl Iocp {
  pub(crate) fn new(_entries: u32) -> Result<Iocp, Error> {
    let port = SharedPort::obtain()?;
    debug!("overlapped-port backend up");
    Ok(Iocp { port, associated: Vec::new(), timers: BinaryHeap::new() })
  }

  pub(crate) fn waker(&self) -> RemoteWaker {
    RemoteWaker::port(Arc::clone(&self.port))
  }

  pub(crate) fn next_deadline(&self) -> Option<Instant> {
    self.timers.peek().map(|t| t.deadline)
  }

  fn ensure_associated(&mut self, handle: usize) -> Result<(), Error> {
    if self.associated.contains(&handle) {
      return Ok(());
    }
    let result = unsafe {
      CreateIoCompletionPort(handle as HANDLE, self.port.handle, 0, 0)
    };
    if result.is_null() {
      return Err(last_error());
    }
    self.associated.push(handle);
    Ok(())
  }

  pub(crate) fn submit(&mut self, mut c: NonNull<Completion>, done: &mut Queue) {
    let comp = unsafe { c.as_mut() };
    comp.scratch.iocp.overlapped = unsafe { mem::zeroed() };
    comp.scratch.iocp.owner = c.as_ptr();
    trace!("iocp submit {:?}", comp.op_kind());

    let started = match &comp.op {
      Op::Timer { deadline } => {
        self.timers.push(TimerEntry { deadline: *deadline, c });
        return;
      }
      Op::SocketOpen { domain, socktype, protocol } => {
        let sock = unsafe { ws::socket(*domain, *socktype, *protocol) };
        let result = if sock == ws::INVALID_SOCKET {
          Err(last_wsa_error())
        } else {
          Ok(sock as OsFd)
        };
        complete(comp, OpResult::Fd(result));
        unsafe { done.push(c) };
        return;
      }
      Op::Bind { fd, addr } => {
        let rc = unsafe {
          ws::bind(*fd as ws::SOCKET, addr.as_ptr() as *const ws::SOCKADDR, addr.len())
        };
        let result = if rc != 0 { Err(last_wsa_error()) } else { Ok(()) };
        complete(comp, OpResult::Unit(result));
        unsafe { done.push(c) };
        return;
      }
      Op::Listen { fd, backlog } => {
        let rc = unsafe { ws::listen(*fd as ws::SOCKET, *backlog) };
        let result = if rc != 0 { Err(last_wsa_error()) } else { Ok(()) };
        complete(comp, OpResult::Unit(result));
        unsafe { done.push(c) };
        return;
      }
      Op::Shutdown { fd, how } => {
        let rc = unsafe { ws::shutdown(*fd as ws::SOCKET, how.as_raw()) };
        let result = if rc != 0 { Err(last_wsa_error()) } else { Ok(()) };
        complete(comp, OpResult::Unit(result));
        unsafe { done.push(c) };
        return;
      }
      Op::SocketClose { fd } => {
        let rc = unsafe { ws::closesocket(*fd as ws::SOCKET) };
        let result = if rc != 0 { Err(last_wsa_error()) } else { Ok(()) };
        complete(comp, OpResult::Unit(result));
        unsafe { done.push(c) };
        return;
      }
      Op::FileClose { fd } => {
        let ok = unsafe { CloseHandle(*fd as HANDLE) };
        let result = if ok == FALSE { Err(last_error()) } else { Ok(()) };
        complete(comp, OpResult::Unit(result));
        unsafe { done.push(c) };
        return;
      }
      Op::Accept { fd } => {
        let fd = *fd;
        self.start_accept(fd, comp)
      }
      Op::Connect { fd, addr } => {
        let (fd, addr) = (*fd, *addr);
        self.start_connect(fd, addr, comp)
      }
      Op::Recv { fd, buf, len } => {
        let (fd, buf, len) = (*fd, *buf, *len);
        start_recv(fd, buf, len, comp)
      }
      Op::Send { fd, buf, len } => {
        let (fd, buf, len) = (*fd, *buf, *len);
        start_send(fd, buf, len, comp)
      }
      other => {
        // Pool-routed kinds never reach the backend; anything else here
        // is a routing bug.
        warn!("unsupported op {:?} on overlapped-port backend", other.kind());
        Err(Error::Unexpected)
      }
    };

    match started {
      Ok(Started::Pending) => {}
      Ok(Started::Immediate) => {
        // The packet still arrives; surface it through the port so the
        // single dequeue path handles the fix-ups.
        if let Err(err) =
          self.port.post_manual(&mut comp.scratch.iocp.overlapped)
        {
          complete_error(comp, err);
          unsafe { done.push(c) };
        }
      }
      Err(err) => {
        complete_error(comp, err);
        unsafe { done.push(c) };
      }
    }
  }

  fn start_accept(
    &mut self,
    fd: OsFd,
    comp: &mut Completion,
  ) -> Result<Started, Error> {
    self.ensure_associated(fd as usize)?;

    let local = local_family(fd)?;
    let fns = extension_fns(local)?;
    let acceptex = fns.acceptex.ok_or(Error::Unexpected)?;

    let sock = unsafe { ws::socket(local, ws::SOCK_STREAM, 0) };
    if sock == ws::INVALID_SOCKET {
      return Err(last_wsa_error());
    }
    comp.scratch.iocp.accept_socket = sock;

    let mut received = 0u32;
    let ok = unsafe {
      acceptex(
        fd as ws::SOCKET,
        sock,
        comp.scratch.iocp.accept_buf.as_mut_ptr() as *mut c_void,
        0,
        ACCEPT_ADDR_SPACE as u32,
        ACCEPT_ADDR_SPACE as u32,
        &mut received,
        &mut comp.scratch.iocp.overlapped,
      )
    };
    started_from(ok != FALSE)
  }

  fn start_connect(
    &mut self,
    fd: OsFd,
    addr: SockAddr,
    comp: &mut Completion,
  ) -> Result<Started, Error> {
    self.ensure_associated(fd as usize)?;
    let fns = extension_fns(addr.family())?;
    let connectex = fns.connectex.ok_or(Error::Unexpected)?;

    let mut issue = || {
      let ok = unsafe {
        connectex(
          fd as ws::SOCKET,
          addr.as_ptr() as *const ws::SOCKADDR,
          addr.len(),
          ptr::null(),
          0,
          ptr::null_mut(),
          &mut comp.scratch.iocp.overlapped,
        )
      };
      if ok != FALSE {
        Ok(Started::Immediate)
      } else {
        match unsafe { ws::WSAGetLastError() } {
          e if e == ERROR_IO_PENDING as i32 || e == ws::WSA_IO_PENDING => {
            Ok(Started::Pending)
          }
          e => Err(Error::from_win32(e)),
        }
      }
    };

    match issue() {
      // ConnectEx demands a bound socket; bind the wildcard and retry.
      Err(Error::Unexpected) | Err(Error::SocketNotConnected) => {
        bind_wildcard(fd, addr.family())?;
        issue()
      }
      other => other,
    }
  }

  pub(crate) fn cancel(
    &mut self,
    target: NonNull<Completion>,
    done: &mut Queue,
  ) -> bool {
    let before = self.timers.len();
    self.timers.retain(|t| t.c != target);
    if self.timers.len() != before {
      let comp = unsafe { &mut *target.as_ptr() };
      complete_error(comp, Error::Canceled);
      unsafe { done.push(target) };
      return true;
    }

    let comp = unsafe { &mut *target.as_ptr() };
    let handle = match &comp.op {
      Op::Accept { fd }
      | Op::Connect { fd, .. }
      | Op::Recv { fd, .. }
      | Op::Send { fd, .. } => *fd as HANDLE,
      _ => return false,
    };
    let ok = unsafe {
      CancelIoEx(handle, &mut comp.scratch.iocp.overlapped)
    };
    ok != FALSE
  }

  pub(crate) fn poll(
    &mut self,
    timeout: Option<Duration>,
    done: &mut Queue,
  ) -> Result<bool, Error> {
    let now = Instant::now();
    let effective = match (timeout, self.next_deadline()) {
      (user, Some(deadline)) => {
        let until = deadline.saturating_duration_since(now);
        Some(user.map_or(until, |u| u.min(until)))
      }
      (user, None) => user,
    };
    let millis = match effective {
      None => u32::MAX,
      Some(d) => d.as_millis().min((u32::MAX - 1) as u128) as u32,
    };

    let mut budget = millis;
    let mut dequeued = 0usize;
    loop {
      let mut bytes = 0u32;
      let mut key = 0usize;
      let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
      let ok = unsafe {
        GetQueuedCompletionStatus(
          self.port.handle,
          &mut bytes,
          &mut key,
          &mut overlapped,
          budget,
        )
      };

      if overlapped.is_null() {
        if ok == FALSE {
          let code = unsafe { GetLastError() };
          if code == WAIT_TIMEOUT {
            break;
          }
          return Err(Error::from_win32(code as i32));
        }
        if key == WAKE_KEY {
          // Drain the rest without blocking, then let the loop run.
          budget = 0;
          continue;
        }
        break;
      }

      if key == WAKE_KEY {
        budget = 0;
        continue;
      }

      // Recover the completion stored beside the OVERLAPPED block.
      let scratch = overlapped as *mut IocpScratch;
      let c = unsafe { (*scratch).owner };
      debug_assert!(!c.is_null());
      finish_packet(unsafe { &mut *c }, ok != FALSE, bytes);
      unsafe { done.push(NonNull::new_unchecked(c)) };
      dequeued += 1;

      // One packet in hand: drain the rest without blocking.
      budget = 0;
    }

    let fired = self.expire_timers(done);
    Ok(dequeued == 0 && fired == 0 && done.is_empty())
  }

  fn expire_timers(&mut self, done: &mut Queue) -> usize {
    let now = Instant::now();
    let mut fired = 0;
    loop {
      match self.timers.peek() {
        Some(entry) if entry.deadline <= now => {}
        _ => break,
      }
      let Some(entry) = self.timers.pop() else { break };
      let comp = unsafe { &mut *entry.c.as_ptr() };
      complete(comp, OpResult::Unit(Ok(())));
      unsafe { done.push(entry.c) };
      fired += 1;
    }
    fired
  }
}

enum Started {
  Pending,
  Immediate,
}

fn started_from(immediate: bool) -> Result<Started, Error> {
  if immediate {
    return Ok(Started::Immediate);
  }
  match unsafe { ws::WSAGetLastError() } {
    e if e == ERROR_IO_PENDING as i32 || e == ws::WSA_IO_PENDING => {
      Ok(Started::Pending)
    }
    e => Err(Error::from_win32(e)),
  }
}

fn start_recv(
  fd: OsFd,
  buf: *mut u8,
  len: usize,
  comp: &mut Completion,
) -> Result<Started, Error> {
  let mut wsabuf = ws::WSABUF { len: len.min(u32::MAX as usize) as u32, buf };
  let mut flags = 0u32;
  let rc = unsafe {
    ws::WSARecv(
      fd as ws::SOCKET,
      &mut wsabuf,
      1,
      ptr::null_mut(),
      &mut flags,
      &mut comp.scratch.iocp.overlapped,
      None,
    )
  };
  started_from(rc == 0)
}

fn start_send(
  fd: OsFd,
  buf: *const u8,
  len: usize,
  comp: &mut Completion,
) -> Result<Started, Error> {
  let mut wsabuf = ws::WSABUF {
    len: len.min(u32::MAX as usize) as u32,
    buf: buf as *mut u8,
  };
  let rc = unsafe {
    ws::WSASend(
      fd as ws::SOCKET,
      &mut wsabuf,
      1,
      ptr::null_mut(),
      0,
      &mut comp.scratch.iocp.overlapped,
      None,
    )
  };
  started_from(rc == 0)
}

/// Operation-specific fix-ups and result mapping for one dequeued packet.
fn finish_packet(comp: &mut Completion, success: bool, bytes: u32) {
  if !success {
    // The packet itself carries the failure; re-query per handle.
    complete_error(comp, last_error());
    if let Op::Accept { .. } = comp.op {
      let sock = comp.scratch.iocp.accept_socket;
      if sock != ws::INVALID_SOCKET {
        unsafe { ws::closesocket(sock) };
        comp.scratch.iocp.accept_socket = ws::INVALID_SOCKET;
      }
    }
    return;
  }

  let result = match &comp.op {
    Op::Accept { fd } => {
      let listener = *fd as ws::SOCKET;
      let sock = comp.scratch.iocp.accept_socket;
      let rc = unsafe {
        ws::setsockopt(
          sock,
          ws::SOL_SOCKET,
          ws::SO_UPDATE_ACCEPT_CONTEXT,
          &listener as *const ws::SOCKET as *const u8,
          mem::size_of::<ws::SOCKET>() as i32,
        )
      };
      if rc != 0 {
        unsafe { ws::closesocket(sock) };
        OpResult::Fd(Err(last_wsa_error()))
      } else {
        OpResult::Fd(Ok(sock as OsFd))
      }
    }
    Op::Connect { fd, .. } => {
      let rc = unsafe {
        ws::setsockopt(
          *fd as ws::SOCKET,
          ws::SOL_SOCKET,
          ws::SO_UPDATE_CONNECT_CONTEXT,
          ptr::null(),
          0,
        )
      };
      if rc != 0 {
        OpResult::Unit(Err(last_wsa_error()))
      } else {
        OpResult::Unit(Ok(()))
      }
    }
    Op::Recv { .. } | Op::Send { .. } => OpResult::Bytes(Ok(bytes as usize)),
    other => {
      warn!("stray packet for {:?}", other.kind());
      OpResult::Unit(Err(Error::Unexpected))
    }
  };
  complete(comp, result);
}

fn local_family(fd: OsFd) -> Result<i32, Error> {
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
  Ok(storage.ss_family as i32)
}

fn bind_wildcard(fd: OsFd, family: i32) -> Result<(), Error> {
  let local: std::net::SocketAddr = if family == raw::AF_INET6 {
    "[::]:0".parse().expect("literal wildcard address")
  } else {
    "0.0.0.0:0".parse().expect("literal wildcard address")
  };
  let addr = SockAddr::from(local);
  let rc = unsafe {
    ws::bind(fd as ws::SOCKET, addr.as_ptr() as *const ws::SOCKADDR, addr.len())
  };
  if rc != 0 {
    Err(last_wsa_error())
  } else {
    Ok(())
  }
}

fn complete(c: &mut Completion, result: OpResult) {
  c.set_result(result);
  c.set_state(State::Completed);
}

fn complete_error(c: &mut Completion, err: Error) {
  c.set_error(err);
  c.set_state(State::Completed);
}
