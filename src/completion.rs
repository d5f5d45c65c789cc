//! The completion record: one caller-owned descriptor per operation.
//!
//! A completion carries the operation parameters, a result slot, an atomic
//! state, the user callback, the intrusive queue link and a per-backend
//! scratch area. The loop and its backend borrow the record from
//! [`Loop::add`](crate::Loop::add) until the callback fires; the caller
//! guarantees the storage stays valid and immovable for that whole period.

use std::ffi::{c_void, CString};
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::addr::{raw, AddrInfo, AddrInfoHints, SockAddr};
use crate::error::Error;
use crate::event_loop::{Loop, LoopShared};
use crate::OsFd;

/// Invoked exactly once when the operation terminates (unless the
/// completion is canceled before a backend or worker picks it up).
pub type Callback = fn(&mut Loop, &mut Completion);

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const CANCELED: u8 = 3;

/// Lifecycle state of a completion.
///
/// Transitions are monotonic: `Pending -> Running -> Completed`, or
/// `Pending -> Canceled`. A completion that has started running is never
/// moved to `Canceled`; a cancellation request surfaces as a
/// [`Error::Canceled`] result instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
  Pending,
  Running,
  Completed,
  Canceled,
}

impl State {
  fn from_u8(raw: u8) -> State {
    match raw {
      PENDING => State::Pending,
      RUNNING => State::Running,
      COMPLETED => State::Completed,
      _ => State::Canceled,
    }
  }

  fn as_u8(self) -> u8 {
    match self {
      State::Pending => PENDING,
      State::Running => RUNNING,
      State::Completed => COMPLETED,
      State::Canceled => CANCELED,
    }
  }
}

/// How to shut down a connected socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
  Read,
  Write,
  Both,
}

impl ShutdownHow {
  #[cfg(unix)]
  pub(crate) fn as_raw(self) -> i32 {
    match self {
      ShutdownHow::Read => libc::SHUT_RD,
      ShutdownHow::Write => libc::SHUT_WR,
      ShutdownHow::Both => libc::SHUT_RDWR,
    }
  }

  // WinSock SD_RECEIVE / SD_SEND / SD_BOTH.
  #[cfg(windows)]
  pub(crate) fn as_raw(self) -> i32 {
    match self {
      ShutdownHow::Read => 0,
      ShutdownHow::Write => 1,
      ShutdownHow::Both => 2,
    }
  }
}

/// Operation kind, used for dispatch-table decisions and result tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
  Timer,
  Wake,
  Work,
  Cancel,
  SocketOpen,
  Bind,
  Listen,
  Accept,
  Connect,
  Recv,
  Send,
  RecvFrom,
  SendTo,
  SocketClose,
  Shutdown,
  GetAddrInfo,
  GetNameInfo,
  FileOpen,
  FileClose,
  FileRead,
  FileWrite,
  FileSync,
  FileRename,
  FileDelete,
}

/// Operation descriptor and parameters, one variant per kind.
///
/// Buffers are captured as raw parts from caller borrows; paths and host
/// names are duplicated into NUL-terminated storage for the duration of
/// the syscall.
pub(crate) enum Op {
  Timer { deadline: Instant },
  Wake,
  Work { func: fn(*mut c_void) },
  Cancel { target: *mut Completion },
  SocketOpen { domain: i32, socktype: i32, protocol: i32 },
  Bind { fd: OsFd, addr: SockAddr },
  Listen { fd: OsFd, backlog: i32 },
  Accept { fd: OsFd },
  Connect { fd: OsFd, addr: SockAddr },
  Recv { fd: OsFd, buf: *mut u8, len: usize },
  Send { fd: OsFd, buf: *const u8, len: usize },
  RecvFrom { fd: OsFd, buf: *mut u8, len: usize },
  SendTo { fd: OsFd, buf: *const u8, len: usize, addr: SockAddr },
  SocketClose { fd: OsFd },
  Shutdown { fd: OsFd, how: ShutdownHow },
  GetAddrInfo {
    host: CString,
    service: CString,
    hints: AddrInfoHints,
    out: *mut AddrInfo,
    cap: usize,
  },
  GetNameInfo {
    addr: SockAddr,
    flags: i32,
    host: *mut u8,
    host_cap: usize,
    service: *mut u8,
    service_cap: usize,
  },
  FileOpen { path: CString, flags: i32, mode: u32 },
  FileClose { fd: OsFd },
  FileRead { fd: OsFd, buf: *mut u8, len: usize, offset: i64 },
  FileWrite { fd: OsFd, buf: *const u8, len: usize, offset: i64 },
  FileSync { fd: OsFd },
  FileRename { from: CString, to: CString },
  FileDelete { path: CString },
}

impl Op {
  pub(crate) fn kind(&self) -> OpKind {
    match self {
      Op::Timer { .. } => OpKind::Timer,
      Op::Wake => OpKind::Wake,
      Op::Work { .. } => OpKind::Work,
      Op::Cancel { .. } => OpKind::Cancel,
      Op::SocketOpen { .. } => OpKind::SocketOpen,
      Op::Bind { .. } => OpKind::Bind,
      Op::Listen { .. } => OpKind::Listen,
      Op::Accept { .. } => OpKind::Accept,
      Op::Connect { .. } => OpKind::Connect,
      Op::Recv { .. } => OpKind::Recv,
      Op::Send { .. } => OpKind::Send,
      Op::RecvFrom { .. } => OpKind::RecvFrom,
      Op::SendTo { .. } => OpKind::SendTo,
      Op::SocketClose { .. } => OpKind::SocketClose,
      Op::Shutdown { .. } => OpKind::Shutdown,
      Op::GetAddrInfo { .. } => OpKind::GetAddrInfo,
      Op::GetNameInfo { .. } => OpKind::GetNameInfo,
      Op::FileOpen { .. } => OpKind::FileOpen,
      Op::FileClose { .. } => OpKind::FileClose,
      Op::FileRead { .. } => OpKind::FileRead,
      Op::FileWrite { .. } => OpKind::FileWrite,
      Op::FileSync { .. } => OpKind::FileSync,
      Op::FileRename { .. } => OpKind::FileRename,
      Op::FileDelete { .. } => OpKind::FileDelete,
    }
  }
}

/// Tagged result union, keyed by the operation kind.
///
/// Each variant wraps either the success payload or the normalized error.
#[derive(Debug, Clone, Copy)]
pub enum OpResult {
  /// timer, wake, work, cancel, bind, listen, close, shutdown, sync,
  /// rename, delete
  Unit(Result<(), Error>),
  /// socket open, file open, accept
  Fd(Result<OsFd, Error>),
  /// recv, send, send-to, file read, file write
  Bytes(Result<usize, Error>),
  /// recv-from: byte count plus peer address
  RecvFrom(Result<(usize, SockAddr), Error>),
  /// getaddrinfo: number of records copied into the caller buffer
  AddrInfo(Result<usize, Error>),
  /// getnameinfo: written lengths of (host, service)
  NameInfo(Result<(usize, usize), Error>),
}

impl OpResult {
  /// The error-carrying variant matching `kind`.
  pub(crate) fn err_for(kind: OpKind, err: Error) -> OpResult {
    match kind {
      OpKind::SocketOpen | OpKind::Accept | OpKind::FileOpen => {
        OpResult::Fd(Err(err))
      }
      OpKind::Recv
      | OpKind::Send
      | OpKind::SendTo
      | OpKind::FileRead
      | OpKind::FileWrite => OpResult::Bytes(Err(err)),
      OpKind::RecvFrom => OpResult::RecvFrom(Err(err)),
      OpKind::GetAddrInfo => OpResult::AddrInfo(Err(err)),
      OpKind::GetNameInfo => OpResult::NameInfo(Err(err)),
      _ => OpResult::Unit(Err(err)),
    }
  }
}

/// Per-backend scratch area, alive exactly as long as the completion.
///
/// The kernel holds pointers into this while an operation is in flight,
/// which is why completions must not move (see [`Loop::add`]).
pub(crate) struct Scratch {
  /// Peer address out-parameter for accept/recvfrom.
  pub(crate) addr: raw::sockaddr_storage,
  pub(crate) addr_len: raw::socklen_t,
  /// Relative timeout handed to a timer SQE.
  #[cfg(linux)]
  pub(crate) ts: io_uring::types::Timespec,
  /// Message header and vector for ring sendmsg/recvmsg.
  #[cfg(linux)]
  pub(crate) msg: libc::msghdr,
  #[cfg(linux)]
  pub(crate) iov: libc::iovec,
  #[cfg(windows)]
  pub(crate) iocp: crate::backend::iocp::IocpScratch,
}

impl Scratch {
  fn new() -> Scratch {
    Scratch {
      addr: unsafe { mem::zeroed() },
      addr_len: mem::size_of::<raw::sockaddr_storage>() as raw::socklen_t,
      #[cfg(linux)]
      ts: io_uring::types::Timespec::new(),
      #[cfg(linux)]
      msg: unsafe { mem::zeroed() },
      #[cfg(linux)]
      iov: libc::iovec { iov_base: std::ptr::null_mut(), iov_len: 0 },
      #[cfg(windows)]
      iocp: crate::backend::iocp::IocpScratch::new(),
    }
  }

  pub(crate) fn reset_addr(&mut self) {
    self.addr = unsafe { mem::zeroed() };
    self.addr_len = mem::size_of::<raw::sockaddr_storage>() as raw::socklen_t;
  }

  pub(crate) fn take_addr(&self) -> SockAddr {
    SockAddr::from_raw(self.addr, self.addr_len)
  }
}

/// Where the loop parked an in-flight completion, so cancellation knows
/// whom to ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Home {
  None,
  Backend,
  Pool,
  WakeList,
}

/// Caller-owned descriptor of one asynchronous operation.
///
/// Constructed by the per-operation initializers, handed to
/// [`Loop::add`], and returned through the callback once a result is
/// stored. The record is reusable: once the callback has fired (or the
/// completion was canceled before pickup) it may be re-added.
pub struct Completion {
  pub(crate) op: Op,
  state: AtomicU8,
  pub(crate) result: Option<OpResult>,
  /// Opaque pointer handed back to the callback verbatim.
  pub userdata: *mut c_void,
  pub(crate) callback: Callback,
  pub(crate) next: Option<NonNull<Completion>>,
  pub(crate) home: Home,
  pub(crate) scratch: Scratch,
  /// Installed when the completion is handed to the thread pool so a
  /// worker can return it to the owning loop.
  pub(crate) shared: Option<Arc<LoopShared>>,
}

impl Completion {
  fn new(op: Op, userdata: *mut c_void, callback: Callback) -> Completion {
    Completion {
      op,
      state: AtomicU8::new(PENDING),
      result: None,
      userdata,
      callback,
      next: None,
      home: Home::None,
      scratch: Scratch::new(),
      shared: None,
    }
  }

  /// Arms a one-shot timer that fires `after` from now.
  pub fn timer(
    after: Duration,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(
      Op::Timer { deadline: Instant::now() + after },
      userdata,
      callback,
    )
  }

  /// A completion that fires when the loop is woken via
  /// [`Loop::wake`](crate::Loop::wake) or
  /// [`Loop::wake_from_anywhere`](crate::Loop::wake_from_anywhere).
  pub fn async_wake(userdata: *mut c_void, callback: Callback) -> Completion {
    Completion::new(Op::Wake, userdata, callback)
  }

  /// Runs `func(userdata)` on the loop's thread pool.
  pub fn work(
    func: fn(*mut c_void),
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::Work { func }, userdata, callback)
  }

  /// Requests best-effort cancellation of `target`.
  ///
  /// # Safety
  ///
  /// `target` must point to a completion previously added to the same
  /// loop this cancel is added to, still alive when the cancel is
  /// submitted.
  pub unsafe fn cancel(
    target: *mut Completion,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::Cancel { target }, userdata, callback)
  }

  /// Creates a socket (`net-open`).
  pub fn socket(
    domain: i32,
    socktype: i32,
    protocol: i32,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(
      Op::SocketOpen { domain, socktype, protocol },
      userdata,
      callback,
    )
  }

  pub fn bind(
    fd: OsFd,
    addr: SockAddr,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::Bind { fd, addr }, userdata, callback)
  }

  pub fn listen(
    fd: OsFd,
    backlog: i32,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::Listen { fd, backlog }, userdata, callback)
  }

  pub fn accept(
    fd: OsFd,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::Accept { fd }, userdata, callback)
  }

  pub fn connect(
    fd: OsFd,
    addr: SockAddr,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::Connect { fd, addr }, userdata, callback)
  }

  /// Receives into `buf`.
  ///
  /// # Safety
  ///
  /// `buf` must stay valid and unaliased until the callback fires.
  pub unsafe fn recv(
    fd: OsFd,
    buf: &mut [u8],
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(
      Op::Recv { fd, buf: buf.as_mut_ptr(), len: buf.len() },
      userdata,
      callback,
    )
  }

  /// Sends from `buf`.
  ///
  /// # Safety
  ///
  /// `buf` must stay valid until the callback fires.
  pub unsafe fn send(
    fd: OsFd,
    buf: &[u8],
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(
      Op::Send { fd, buf: buf.as_ptr(), len: buf.len() },
      userdata,
      callback,
    )
  }

  /// Receives a datagram and the peer address.
  ///
  /// # Safety
  ///
  /// `buf` must stay valid and unaliased until the callback fires.
  pub unsafe fn recv_from(
    fd: OsFd,
    buf: &mut [u8],
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(
      Op::RecvFrom { fd, buf: buf.as_mut_ptr(), len: buf.len() },
      userdata,
      callback,
    )
  }

  /// Sends a datagram to `addr`.
  ///
  /// # Safety
  ///
  /// `buf` must stay valid until the callback fires.
  pub unsafe fn send_to(
    fd: OsFd,
    buf: &[u8],
    addr: SockAddr,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(
      Op::SendTo { fd, buf: buf.as_ptr(), len: buf.len(), addr },
      userdata,
      callback,
    )
  }

  pub fn socket_close(
    fd: OsFd,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::SocketClose { fd }, userdata, callback)
  }

  pub fn shutdown(
    fd: OsFd,
    how: ShutdownHow,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::Shutdown { fd, how }, userdata, callback)
  }

  /// Resolves `host`/`service` into the caller-supplied record buffer.
  ///
  /// Empty strings pass NULL for the respective argument. Requires a
  /// thread pool on the loop.
  ///
  /// # Safety
  ///
  /// `out` must stay valid and unaliased until the callback fires.
  pub unsafe fn getaddrinfo(
    host: CString,
    service: CString,
    hints: AddrInfoHints,
    out: &mut [AddrInfo],
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(
      Op::GetAddrInfo {
        host,
        service,
        hints,
        out: out.as_mut_ptr(),
        cap: out.len(),
      },
      userdata,
      callback,
    )
  }

  /// Reverse-resolves `addr` into the caller-supplied byte buffers.
  ///
  /// Requires a thread pool on the loop.
  ///
  /// # Safety
  ///
  /// `host` and `service` must stay valid and unaliased until the
  /// callback fires.
  pub unsafe fn getnameinfo(
    addr: SockAddr,
    flags: i32,
    host: &mut [u8],
    service: &mut [u8],
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(
      Op::GetNameInfo {
        addr,
        flags,
        host: host.as_mut_ptr(),
        host_cap: host.len(),
        service: service.as_mut_ptr(),
        service_cap: service.len(),
      },
      userdata,
      callback,
    )
  }

  /// Opens a file (`file-open`). `flags`/`mode` follow `open(2)`.
  pub fn open(
    path: CString,
    flags: i32,
    mode: u32,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::FileOpen { path, flags, mode }, userdata, callback)
  }

  pub fn file_close(
    fd: OsFd,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::FileClose { fd }, userdata, callback)
  }

  /// Reads at `offset` (`-1` reads at the current position).
  ///
  /// # Safety
  ///
  /// `buf` must stay valid and unaliased until the callback fires.
  pub unsafe fn read(
    fd: OsFd,
    buf: &mut [u8],
    offset: i64,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(
      Op::FileRead { fd, buf: buf.as_mut_ptr(), len: buf.len(), offset },
      userdata,
      callback,
    )
  }

  /// Writes at `offset` (`-1` writes at the current position).
  ///
  /// # Safety
  ///
  /// `buf` must stay valid until the callback fires.
  pub unsafe fn write(
    fd: OsFd,
    buf: &[u8],
    offset: i64,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(
      Op::FileWrite { fd, buf: buf.as_ptr(), len: buf.len(), offset },
      userdata,
      callback,
    )
  }

  /// Flushes file data to storage (`file-sync`).
  pub fn fsync(
    fd: OsFd,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::FileSync { fd }, userdata, callback)
  }

  pub fn rename(
    from: CString,
    to: CString,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::FileRename { from, to }, userdata, callback)
  }

  pub fn delete(
    path: CString,
    userdata: *mut c_void,
    callback: Callback,
  ) -> Completion {
    Completion::new(Op::FileDelete { path }, userdata, callback)
  }

  /// The operation kind this completion describes.
  pub fn op_kind(&self) -> OpKind {
    self.op.kind()
  }

  pub fn state(&self) -> State {
    State::from_u8(self.state.load(Ordering::Acquire))
  }

  pub(crate) fn set_state(&self, state: State) {
    self.state.store(state.as_u8(), Ordering::Release);
  }

  /// Compare-exchange transition; settles the cancel/claim race.
  pub(crate) fn try_transition(&self, from: State, to: State) -> bool {
    self
      .state
      .compare_exchange(
        from.as_u8(),
        to.as_u8(),
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok()
  }

  /// Whether a result has been stored.
  pub fn has_result(&self) -> bool {
    self.result.is_some()
  }

  pub(crate) fn set_result(&mut self, result: OpResult) {
    self.result = Some(result);
  }

  pub(crate) fn set_error(&mut self, err: Error) {
    self.result = Some(OpResult::err_for(self.op.kind(), err));
  }

  /// Clears the previous run so the record can be re-added.
  pub(crate) fn reset_for_add(&mut self) {
    debug_assert!(self.next.is_none(), "completion still queued");
    self.result = None;
    self.home = Home::None;
    self.shared = None;
    self.state.store(PENDING, Ordering::Release);
  }

  fn expect_result(&self, expected: OpKind) -> OpResult {
    assert_eq!(
      self.op.kind(),
      expected,
      "result requested for the wrong operation kind"
    );
    match self.result {
      Some(r) => r,
      None => panic!("completion has no result (state {:?})", self.state()),
    }
  }

  fn any_result(&self) -> OpResult {
    match self.result {
      Some(r) => r,
      None => panic!("completion has no result (state {:?})", self.state()),
    }
  }

  /// Result of a unit-valued operation (timer, wake, work, cancel, bind,
  /// listen, close, shutdown, sync, rename, delete).
  pub fn result_unit(&self) -> Result<(), Error> {
    match self.any_result() {
      OpResult::Unit(r) => r,
      other => panic!("expected unit result, found {other:?}"),
    }
  }

  /// Result of socket open, file open or accept.
  pub fn result_fd(&self) -> Result<OsFd, Error> {
    match self.any_result() {
      OpResult::Fd(r) => r,
      other => panic!("expected fd result, found {other:?}"),
    }
  }

  /// Result of recv, send, send-to, file read or file write.
  pub fn result_bytes(&self) -> Result<usize, Error> {
    match self.any_result() {
      OpResult::Bytes(r) => r,
      other => panic!("expected byte-count result, found {other:?}"),
    }
  }

  /// Result of recv-from.
  pub fn result_recv_from(&self) -> Result<(usize, SockAddr), Error> {
    match self.expect_result(OpKind::RecvFrom) {
      OpResult::RecvFrom(r) => r,
      other => panic!("expected recv-from result, found {other:?}"),
    }
  }

  /// Result of getaddrinfo: records copied into the caller buffer.
  pub fn result_addr_info(&self) -> Result<usize, Error> {
    match self.expect_result(OpKind::GetAddrInfo) {
      OpResult::AddrInfo(r) => r,
      other => panic!("expected addr-info result, found {other:?}"),
    }
  }

  /// Result of getnameinfo: written lengths of (host, service).
  pub fn result_name_info(&self) -> Result<(usize, usize), Error> {
    match self.expect_result(OpKind::GetNameInfo) {
      OpResult::NameInfo(r) => r,
      other => panic!("expected name-info result, found {other:?}"),
    }
  }
}

impl fmt::Debug for Completion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Completion")
      .field("op", &self.op.kind())
      .field("state", &self.state())
      .field("has_result", &self.result.is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn nop(_: &mut Loop, _: &mut Completion) {}

  #[test]
  fn fresh_completion_is_pending() {
    let c = Completion::timer(Duration::from_millis(1), std::ptr::null_mut(), nop);
    assert_eq!(c.state(), State::Pending);
    assert_eq!(c.op_kind(), OpKind::Timer);
    assert!(!c.has_result());
  }

  #[test]
  fn transition_settles_races() {
    let c = Completion::async_wake(std::ptr::null_mut(), nop);
    assert!(c.try_transition(State::Pending, State::Running));
    // Cancel loses once running started.
    assert!(!c.try_transition(State::Pending, State::Canceled));
    assert!(c.try_transition(State::Running, State::Completed));
  }

  #[test]
  fn error_picks_matching_variant() {
    let mut c = Completion::accept(3, std::ptr::null_mut(), nop);
    c.set_error(Error::Canceled);
    assert_eq!(c.result_fd(), Err(Error::Canceled));
  }

  #[test]
  #[should_panic(expected = "wrong operation kind")]
  fn result_tag_mismatch_panics() {
    let mut c = Completion::accept(3, std::ptr::null_mut(), nop);
    c.set_result(OpResult::Fd(Ok(7)));
    let _ = c.result_addr_info();
  }
}
