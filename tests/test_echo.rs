#![cfg(unix)]

mod common;

use std::ffi::{c_void, CString};
use std::time::Duration;

use evio::{
  Completion, Loop, OsFd, RunMode, ShutdownHow, SockAddr,
};

const MSG: &[u8] = b"Hello, Echo Server!";

/// One echo exchange driven entirely through loop callbacks: the server
/// accepts, reads and echoes; the client connects, sends and verifies.
struct EchoCtx {
  listener: OsFd,
  client_fd: OsFd,
  conn: OsFd,
  srv_buf: [u8; 64],
  cli_buf: [u8; 64],
  srv_n: usize,
  cli_got: usize,
  server_done: bool,
  client_done: bool,
  closed: usize,
  unlink_path: Option<CString>,

  accept: Option<Completion>,
  connect: Option<Completion>,
  srv_recv: Option<Completion>,
  srv_send: Option<Completion>,
  cli_send: Option<Completion>,
  cli_recv: Option<Completion>,
  close_conn: Option<Completion>,
  close_client: Option<Completion>,
  close_listener: Option<Completion>,
  unlink: Option<Completion>,
  watchdog: Option<Completion>,
}

impl EchoCtx {
  fn new(listener: OsFd, client_fd: OsFd) -> Box<EchoCtx> {
    Box::new(EchoCtx {
      listener,
      client_fd,
      conn: -1,
      srv_buf: [0; 64],
      cli_buf: [0; 64],
      srv_n: 0,
      cli_got: 0,
      server_done: false,
      client_done: false,
      closed: 0,
      unlink_path: None,
      accept: None,
      connect: None,
      srv_recv: None,
      srv_send: None,
      cli_send: None,
      cli_recv: None,
      close_conn: None,
      close_client: None,
      close_listener: None,
      unlink: None,
      watchdog: None,
    })
  }
}

fn ctx_of<'a>(c: &Completion) -> &'a mut EchoCtx {
  unsafe { &mut *(c.userdata as *mut EchoCtx) }
}

fn on_watchdog(l: &mut Loop, _c: &mut Completion) {
  l.stop();
}

fn on_accept(l: &mut Loop, c: &mut Completion) {
  let ctx = ctx_of(c);
  ctx.conn = c.result_fd().expect("accept failed");
  let comp = unsafe {
    Completion::recv(ctx.conn, &mut ctx.srv_buf, c.userdata, on_srv_recv)
  };
  unsafe { l.add(ctx.srv_recv.insert(comp)) };
}

fn on_srv_recv(l: &mut Loop, c: &mut Completion) {
  let ctx = ctx_of(c);
  ctx.srv_n = c.result_bytes().expect("server recv failed");
  assert!(ctx.srv_n > 0, "client closed before sending");
  let comp = unsafe {
    Completion::send(
      ctx.conn,
      &ctx.srv_buf[..ctx.srv_n],
      c.userdata,
      on_srv_send,
    )
  };
  unsafe { l.add(ctx.srv_send.insert(comp)) };
}

fn on_srv_send(l: &mut Loop, c: &mut Completion) {
  let ctx = ctx_of(c);
  let n = c.result_bytes().expect("server send failed");
  assert_eq!(n, ctx.srv_n, "short echo write");
  ctx.server_done = true;
  let comp = Completion::socket_close(ctx.conn, c.userdata, on_closed);
  unsafe { l.add(ctx.close_conn.insert(comp)) };
}

fn on_connect(l: &mut Loop, c: &mut Completion) {
  let ctx = ctx_of(c);
  c.result_unit().expect("connect failed");
  let comp = unsafe {
    Completion::send(ctx.client_fd, MSG, c.userdata, on_cli_send)
  };
  unsafe { l.add(ctx.cli_send.insert(comp)) };
}

fn on_cli_send(l: &mut Loop, c: &mut Completion) {
  let ctx = ctx_of(c);
  let n = c.result_bytes().expect("client send failed");
  assert_eq!(n, MSG.len());
  let comp = unsafe {
    Completion::recv(ctx.client_fd, &mut ctx.cli_buf, c.userdata, on_cli_recv)
  };
  unsafe { l.add(ctx.cli_recv.insert(comp)) };
}

fn on_cli_recv(l: &mut Loop, c: &mut Completion) {
  let ctx = ctx_of(c);
  let n = c.result_bytes().expect("client recv failed");
  assert!(n > 0, "server closed before echoing everything");
  ctx.cli_got += n;
  if ctx.cli_got < MSG.len() {
    let comp = unsafe {
      Completion::recv(
        ctx.client_fd,
        &mut ctx.cli_buf[ctx.cli_got..],
        c.userdata,
        on_cli_recv,
      )
    };
    unsafe { l.add(ctx.cli_recv.insert(comp)) };
    return;
  }
  assert_eq!(ctx.cli_got, MSG.len(), "expected {} bytes", MSG.len());
  assert_eq!(&ctx.cli_buf[..ctx.cli_got], MSG, "echo must match byte-for-byte");
  ctx.client_done = true;

  let close = Completion::socket_close(ctx.client_fd, c.userdata, on_closed);
  unsafe { l.add(ctx.close_client.insert(close)) };
  let close = Completion::socket_close(ctx.listener, c.userdata, on_closed);
  unsafe { l.add(ctx.close_listener.insert(close)) };
}

fn on_closed(l: &mut Loop, c: &mut Completion) {
  let ctx = ctx_of(c);
  c.result_unit().expect("close failed");
  ctx.closed += 1;
  if ctx.closed < 3 {
    return;
  }
  match ctx.unlink_path.take() {
    Some(path) => {
      let comp = Completion::delete(path, c.userdata, on_unlinked);
      unsafe { l.add(ctx.unlink.insert(comp)) };
    }
    None => l.stop(),
  }
}

fn on_unlinked(l: &mut Loop, c: &mut Completion) {
  c.result_unit().expect("unlink failed");
  l.stop();
}

fn noop(_: &mut Loop, _: &mut Completion) {}

/// Runs bind + listen through the loop, then the full echo exchange.
fn run_echo(lp: &mut Loop, mut ctx: Box<EchoCtx>, server_addr: SockAddr) {
  let ud = &mut *ctx as *mut EchoCtx as *mut c_void;

  // Server setup: synchronous operations, finished inside one iteration.
  let mut bind =
    Completion::bind(ctx.listener, server_addr, std::ptr::null_mut(), noop);
  let mut listen =
    Completion::listen(ctx.listener, 1, std::ptr::null_mut(), noop);
  unsafe {
    lp.add(&mut bind);
    lp.add(&mut listen);
  }
  lp.run(RunMode::UntilDone).expect("setup run failed");
  bind.result_unit().expect("bind failed");
  listen.result_unit().expect("listen failed");

  // The OS picked the port for port-0 binds; connect to what it reports.
  let target = match server_addr.family() {
    libc::AF_UNIX => server_addr,
    _ => {
      let local =
        evio::getsockname(ctx.listener).expect("getsockname failed");
      assert_ne!(local.port(), Some(0), "bound port must be filled in");
      local
    }
  };

  let accept =
    Completion::accept(ctx.listener, ud, on_accept);
  let connect =
    Completion::connect(ctx.client_fd, target, ud, on_connect);
  let watchdog =
    Completion::timer(Duration::from_secs(10), ud, on_watchdog);
  unsafe {
    lp.add(ctx.accept.insert(accept));
    lp.add(ctx.connect.insert(connect));
    lp.add(ctx.watchdog.insert(watchdog));
  }
  lp.run(RunMode::UntilDone).expect("echo run failed");

  assert!(ctx.server_done, "server side never finished");
  assert!(ctx.client_done, "client side never finished");
  assert_eq!(ctx.closed, 3, "all three descriptors must close");
}

fn tcp_socket() -> OsFd {
  let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
  assert!(fd >= 0, "socket() failed");
  fd
}

fn unix_socket() -> OsFd {
  let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
  assert!(fd >= 0, "socket() failed");
  fd
}

#[test]
fn echo_ipv4() {
  let mut lp = common::test_loop();
  let ctx = EchoCtx::new(tcp_socket(), tcp_socket());
  let addr =
    SockAddr::from("127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap());
  run_echo(&mut lp, ctx, addr);
}

#[test]
fn echo_ipv4_on_readiness_backend() {
  common::init_logging();
  let mut lp = common::readiness_loop();
  let ctx = EchoCtx::new(tcp_socket(), tcp_socket());
  let addr =
    SockAddr::from("127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap());
  run_echo(&mut lp, ctx, addr);
}

#[test]
fn echo_unix() {
  let mut lp = common::test_loop();
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("echo.sock");

  let mut ctx = EchoCtx::new(unix_socket(), unix_socket());
  ctx.unlink_path =
    Some(CString::new(path.to_str().expect("utf-8 path")).expect("no NUL"));
  let addr = SockAddr::unix(&path).expect("unix address");
  run_echo(&mut lp, ctx, addr);
  assert!(!path.exists(), "socket path must be unlinked on teardown");
}

#[test]
fn socket_open_through_the_loop() {
  let mut lp = common::readiness_loop();

  let mut open = Completion::socket(
    libc::AF_INET,
    libc::SOCK_STREAM,
    0,
    std::ptr::null_mut(),
    noop,
  );
  unsafe { lp.add(&mut open) };
  lp.run(RunMode::UntilDone).expect("run failed");
  let fd = open.result_fd().expect("socket open failed");
  assert!(fd >= 0);

  let mut close = Completion::socket_close(fd, std::ptr::null_mut(), noop);
  unsafe { lp.add(&mut close) };
  lp.run(RunMode::UntilDone).expect("run failed");
  assert_eq!(close.result_unit(), Ok(()));
}

#[test]
fn shutdown_write_half() {
  let mut lp = common::test_loop();
  let a = tcp_socket();

  // Shutdown on an unconnected socket surfaces the normalized error.
  let mut shut = Completion::shutdown(
    a,
    ShutdownHow::Write,
    std::ptr::null_mut(),
    noop,
  );
  unsafe { lp.add(&mut shut) };
  lp.run(RunMode::UntilDone).expect("run failed");
  assert_eq!(shut.result_unit(), Err(evio::Error::SocketNotConnected));

  unsafe { libc::close(a) };
}
