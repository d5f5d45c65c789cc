mod common;

use std::ffi::c_void;
use std::thread;
use std::time::{Duration, Instant};

use evio::{Completion, Error, Loop, RunMode, State};

#[derive(Default)]
struct Fired {
  count: usize,
  result: Option<Result<(), Error>>,
}

fn on_fired(_l: &mut Loop, c: &mut Completion) {
  let fired = unsafe { &mut *(c.userdata as *mut Fired) };
  fired.count += 1;
  fired.result = Some(c.result_unit());
}

#[test]
fn timer_fires_exactly_once() {
  let mut lp = common::test_loop();

  let mut fired = Fired::default();
  let mut timer = Completion::timer(
    Duration::from_millis(20),
    &mut fired as *mut Fired as *mut c_void,
    on_fired,
  );

  let started = Instant::now();
  unsafe { lp.add(&mut timer) };
  let dispatched = lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(dispatched, 1);
  assert_eq!(fired.count, 1, "timer callback must fire exactly once");
  assert_eq!(fired.result, Some(Ok(())));
  assert_eq!(timer.state(), State::Completed);
  assert!(started.elapsed() >= Duration::from_millis(20));
  assert_eq!(lp.active(), 0);
}

#[test]
fn two_timers_both_fire() {
  let mut lp = common::test_loop();

  let mut first = Fired::default();
  let mut second = Fired::default();
  let mut short = Completion::timer(
    Duration::from_millis(10),
    &mut first as *mut Fired as *mut c_void,
    on_fired,
  );
  let mut long = Completion::timer(
    Duration::from_millis(40),
    &mut second as *mut Fired as *mut c_void,
    on_fired,
  );

  unsafe {
    lp.add(&mut short);
    lp.add(&mut long);
  }
  lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(first.count, 1);
  assert_eq!(second.count, 1);
}

#[test]
fn no_wait_returns_without_blocking() {
  let mut lp = common::test_loop();

  let mut fired = Fired::default();
  let mut timer = Completion::timer(
    Duration::from_secs(30),
    &mut fired as *mut Fired as *mut c_void,
    on_fired,
  );
  unsafe { lp.add(&mut timer) };

  let started = Instant::now();
  let dispatched = lp.run(RunMode::NoWait).expect("run failed");
  assert_eq!(dispatched, 0);
  assert_eq!(fired.count, 0);
  assert!(
    started.elapsed() < Duration::from_secs(5),
    "NoWait must not block on the armed timer"
  );
  assert_eq!(lp.active(), 1);
}

fn on_fired_then_stop(l: &mut Loop, c: &mut Completion) {
  on_fired(l, c);
  l.stop();
}

#[test]
fn stop_from_callback_exits_with_work_left() {
  let mut lp = common::test_loop();

  let mut quick = Fired::default();
  let mut never = Fired::default();
  let mut stopper = Completion::timer(
    Duration::from_millis(10),
    &mut quick as *mut Fired as *mut c_void,
    on_fired_then_stop,
  );
  let mut pending = Completion::timer(
    Duration::from_secs(60),
    &mut never as *mut Fired as *mut c_void,
    on_fired,
  );

  unsafe {
    lp.add(&mut stopper);
    lp.add(&mut pending);
  }
  lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(quick.count, 1);
  assert_eq!(never.count, 0);
  assert_eq!(lp.active(), 1, "the long timer is still in flight");

  // Stop is sticky and repeatable.
  lp.stop();
  lp.stop();
  let dispatched = lp.run(RunMode::UntilDone).expect("run failed");
  assert_eq!(dispatched, 0);
}

#[test]
fn waker_unblocks_and_completes_wake_listener() {
  let mut lp = common::test_loop();

  let mut fired = Fired::default();
  let mut listener = Completion::async_wake(
    &mut fired as *mut Fired as *mut c_void,
    on_fired,
  );
  unsafe { lp.add(&mut listener) };

  let waker = lp.waker();
  let poker = thread::spawn(move || {
    thread::sleep(Duration::from_millis(30));
    waker.wake();
  });

  lp.run(RunMode::UntilDone).expect("run failed");
  poker.join().expect("waker thread panicked");

  assert_eq!(fired.count, 1);
  assert_eq!(fired.result, Some(Ok(())));
}

fn on_fired_readd(l: &mut Loop, c: &mut Completion) {
  let fired = unsafe { &mut *(c.userdata as *mut Fired) };
  fired.count += 1;
  fired.result = Some(c.result_unit());
  if fired.count == 1 {
    // Submissions from a callback wait for the next iteration.
    unsafe { l.add(c) };
  }
}

#[test]
fn completion_is_reusable_from_its_callback() {
  let mut lp = common::test_loop();

  let mut fired = Fired::default();
  let mut timer = Completion::timer(
    Duration::from_millis(10),
    &mut fired as *mut Fired as *mut c_void,
    on_fired_readd,
  );
  unsafe { lp.add(&mut timer) };
  lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(fired.count, 2, "the re-added completion fires a second time");
  assert_eq!(fired.result, Some(Ok(())));
  assert_eq!(lp.active(), 0);
}

#[test]
fn timer_fires_on_readiness_backend() {
  let mut lp = common::readiness_loop();

  let mut fired = Fired::default();
  let mut timer = Completion::timer(
    Duration::from_millis(15),
    &mut fired as *mut Fired as *mut c_void,
    on_fired,
  );
  unsafe { lp.add(&mut timer) };
  lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(fired.count, 1);
  assert_eq!(fired.result, Some(Ok(())));
}

#[test]
fn wake_before_run_completes_listener_immediately() {
  let mut lp = common::test_loop();

  let mut fired = Fired::default();
  let mut listener = Completion::async_wake(
    &mut fired as *mut Fired as *mut c_void,
    on_fired,
  );
  unsafe { lp.add(&mut listener) };
  lp.wake();

  let started = Instant::now();
  lp.run(RunMode::UntilDone).expect("run failed");
  assert_eq!(fired.count, 1);
  assert!(started.elapsed() < Duration::from_secs(5));
}
