#![cfg(unix)]

mod common;

use std::ffi::CString;

use evio::{AddrInfo, AddrInfoHints, Completion, Error, Loop, RunMode};

fn noop(_: &mut Loop, _: &mut Completion) {}

fn cstr(s: &str) -> CString {
  CString::new(s).expect("no NUL")
}

fn tcp_v4_hints() -> AddrInfoHints {
  AddrInfoHints {
    family: libc::AF_INET,
    socktype: libc::SOCK_STREAM,
    ..Default::default()
  }
}

#[test]
fn resolves_localhost_http() {
  let mut lp = common::test_loop();

  let mut records = [AddrInfo::default(); 8];
  let mut lookup = unsafe {
    Completion::getaddrinfo(
      cstr("localhost"),
      cstr("80"),
      tcp_v4_hints(),
      &mut records,
      std::ptr::null_mut(),
      noop,
    )
  };
  unsafe { lp.add(&mut lookup) };
  lp.run(RunMode::UntilDone).expect("run failed");

  let n = lookup.result_addr_info().expect("lookup failed");
  assert!(n >= 1, "expected at least one record");
  assert_eq!(records[0].family, libc::AF_INET);
  assert_eq!(
    records[0].addr.port(),
    Some(80),
    "port 80 must come back in the record"
  );
}

#[test]
fn reverse_lookup_numeric() {
  let mut lp = common::test_loop();

  let addr = evio::SockAddr::from(
    "127.0.0.1:8080".parse::<std::net::SocketAddr>().unwrap(),
  );
  let mut host = [0u8; 64];
  let mut service = [0u8; 16];
  let mut lookup = unsafe {
    Completion::getnameinfo(
      addr,
      libc::NI_NUMERICHOST | libc::NI_NUMERICSERV,
      &mut host,
      &mut service,
      std::ptr::null_mut(),
      noop,
    )
  };
  unsafe { lp.add(&mut lookup) };
  lp.run(RunMode::UntilDone).expect("run failed");

  let (h, s) = lookup.result_name_info().expect("reverse lookup failed");
  assert_eq!(&host[..h], b"127.0.0.1");
  assert_eq!(&service[..s], b"8080");
}

#[test]
fn missing_pool_fails_resolution_submissions() {
  let mut lp = common::poolless_loop();

  let mut records = [AddrInfo::default(); 4];
  let mut lookup = unsafe {
    Completion::getaddrinfo(
      cstr("localhost"),
      cstr("80"),
      tcp_v4_hints(),
      &mut records,
      std::ptr::null_mut(),
      noop,
    )
  };
  unsafe { lp.add(&mut lookup) };
  lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(lookup.result_addr_info(), Err(Error::NoThreadPool));
}

#[test]
fn unknown_host_reports_resolution_failure() {
  let mut lp = common::test_loop();

  let mut records = [AddrInfo::default(); 4];
  let mut lookup = unsafe {
    Completion::getaddrinfo(
      cstr("this-hostname-does-not-exist-12345.invalid"),
      cstr("80"),
      AddrInfoHints::default(),
      &mut records,
      std::ptr::null_mut(),
      noop,
    )
  };
  unsafe { lp.add(&mut lookup) };
  lp.run(RunMode::UntilDone).expect("run failed");

  let err = lookup.result_addr_info().expect_err("lookup must fail");
  // Resolvers without upstream connectivity report the transient variant.
  assert!(
    matches!(
      err,
      Error::UnknownHostName | Error::TemporaryNameServerFailure
    ),
    "unexpected resolution error: {err:?}"
  );
}

#[test]
fn undersized_record_buffer_reports_system_resources() {
  let mut lp = common::test_loop();

  let mut records: [AddrInfo; 0] = [];
  let mut lookup = unsafe {
    Completion::getaddrinfo(
      cstr("localhost"),
      cstr("80"),
      tcp_v4_hints(),
      &mut records,
      std::ptr::null_mut(),
      noop,
    )
  };
  unsafe { lp.add(&mut lookup) };
  lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(lookup.result_addr_info(), Err(Error::SystemResources));
}
