mod common;

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use evio::{
  Completion, Error, Loop, Options, PoolOptions, RunMode, State, ThreadPool,
};

#[derive(Default)]
struct Outcome {
  fired: usize,
  unit: Option<Result<(), Error>>,
}

fn record_unit(_l: &mut Loop, c: &mut Completion) {
  let out = unsafe { &mut *(c.userdata as *mut Outcome) };
  out.fired += 1;
  out.unit = Some(c.result_unit());
}

#[test]
fn cancel_in_flight_timer_delivers_canceled() {
  let mut lp = common::test_loop();

  let mut timer_out = Outcome::default();
  let mut cancel_out = Outcome::default();
  let mut timer = Completion::timer(
    Duration::from_secs(60),
    &mut timer_out as *mut Outcome as *mut c_void,
    record_unit,
  );
  let mut cancel = unsafe {
    Completion::cancel(
      &mut timer,
      &mut cancel_out as *mut Outcome as *mut c_void,
      record_unit,
    )
  };

  unsafe {
    lp.add(&mut timer);
    lp.add(&mut cancel);
  }
  lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(cancel_out.fired, 1);
  assert_eq!(cancel_out.unit, Some(Ok(())));
  assert_eq!(timer_out.fired, 1, "a running target still gets its callback");
  assert_eq!(timer_out.unit, Some(Err(Error::Canceled)));
  assert_eq!(lp.active(), 0);
}

#[test]
fn cancel_before_pickup_suppresses_callback() {
  let mut lp = common::test_loop();

  let mut timer_out = Outcome::default();
  let mut cancel_out = Outcome::default();
  let mut timer = Completion::timer(
    Duration::from_secs(60),
    &mut timer_out as *mut Outcome as *mut c_void,
    record_unit,
  );
  let mut cancel = unsafe {
    Completion::cancel(
      &mut timer,
      &mut cancel_out as *mut Outcome as *mut c_void,
      record_unit,
    )
  };

  // The cancel is drained first, while the timer still sits in the
  // submission queue.
  unsafe {
    lp.add(&mut cancel);
    lp.add(&mut timer);
  }
  lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(cancel_out.unit, Some(Ok(())));
  assert_eq!(timer_out.fired, 0, "withdrawn before pickup: no callback");
  assert_eq!(timer.state(), State::Canceled);
  assert_eq!(lp.active(), 0);
}

#[test]
fn cancel_of_finished_target_reports_error() {
  let mut lp = common::test_loop();

  let mut timer_out = Outcome::default();
  let mut timer = Completion::timer(
    Duration::from_millis(5),
    &mut timer_out as *mut Outcome as *mut c_void,
    record_unit,
  );
  unsafe { lp.add(&mut timer) };
  lp.run(RunMode::UntilDone).expect("run failed");
  assert_eq!(timer_out.unit, Some(Ok(())));

  let mut cancel_out = Outcome::default();
  let mut cancel = unsafe {
    Completion::cancel(
      &mut timer,
      &mut cancel_out as *mut Outcome as *mut c_void,
      record_unit,
    )
  };
  unsafe { lp.add(&mut cancel) };
  lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(cancel_out.unit, Some(Err(Error::Unexpected)));
}

struct PoolCtx {
  gate: AtomicUsize,
  victim_ran: AtomicUsize,
  blocker_cbs: AtomicUsize,
  victim_cbs: AtomicUsize,
}

fn hold_until_gate(data: *mut c_void) {
  let ctx = unsafe { &*(data as *const PoolCtx) };
  while ctx.gate.load(Ordering::SeqCst) == 0 {
    thread::sleep(Duration::from_millis(1));
  }
}

fn bump_victim(data: *mut c_void) {
  let ctx = unsafe { &*(data as *const PoolCtx) };
  ctx.victim_ran.fetch_add(1, Ordering::SeqCst);
}

fn on_blocker_done(_l: &mut Loop, c: &mut Completion) {
  let ctx = unsafe { &*(c.userdata as *const PoolCtx) };
  ctx.blocker_cbs.fetch_add(1, Ordering::SeqCst);
}

fn on_victim_done(_l: &mut Loop, c: &mut Completion) {
  let ctx = unsafe { &*(c.userdata as *const PoolCtx) };
  ctx.victim_cbs.fetch_add(1, Ordering::SeqCst);
}

fn open_gate(_l: &mut Loop, c: &mut Completion) {
  let ctx = unsafe { &*(c.userdata as *const PoolCtx) };
  ctx.gate.store(1, Ordering::SeqCst);
}

#[test]
fn cancel_queued_pool_work_never_runs() {
  common::init_logging();
  let pool = Arc::new(
    ThreadPool::new(PoolOptions { min_threads: 1, max_threads: 1 })
      .expect("pool"),
  );
  let mut lp = Loop::new(Options {
    thread_pool: Some(pool),
    ..Options::default()
  })
  .expect("loop");

  let ctx = Box::new(PoolCtx {
    gate: AtomicUsize::new(0),
    victim_ran: AtomicUsize::new(0),
    blocker_cbs: AtomicUsize::new(0),
    victim_cbs: AtomicUsize::new(0),
  });
  let ctx_ptr = &*ctx as *const PoolCtx as *mut c_void;

  // The single worker parks in the blocker, so the victim stays queued
  // and cancelable; the timer opens the gate afterwards.
  let mut blocker = Completion::work(hold_until_gate, ctx_ptr, on_blocker_done);
  let mut victim = Completion::work(bump_victim, ctx_ptr, on_victim_done);
  let mut cancel_out = Outcome::default();
  let mut cancel = unsafe {
    Completion::cancel(
      &mut victim,
      &mut cancel_out as *mut Outcome as *mut c_void,
      record_unit,
    )
  };
  let mut gate_timer =
    Completion::timer(Duration::from_millis(50), ctx_ptr, open_gate);

  unsafe {
    lp.add(&mut blocker);
    lp.add(&mut victim);
    lp.add(&mut cancel);
    lp.add(&mut gate_timer);
  }
  lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(cancel_out.unit, Some(Ok(())));
  assert_eq!(ctx.victim_ran.load(Ordering::SeqCst), 0);
  assert_eq!(victim.state(), State::Canceled);
  assert_eq!(
    ctx.victim_cbs.load(Ordering::SeqCst),
    0,
    "canceled before pickup: no callback"
  );
  assert_eq!(ctx.blocker_cbs.load(Ordering::SeqCst), 1);
  assert_eq!(lp.active(), 0);
}

struct LoadCtx {
  current: AtomicUsize,
  peak: AtomicUsize,
  done: usize,
}

fn load_work(data: *mut c_void) {
  let ctx = unsafe { &*(data as *const LoadCtx) };
  let now = ctx.current.fetch_add(1, Ordering::SeqCst) + 1;
  ctx.peak.fetch_max(now, Ordering::SeqCst);
  thread::sleep(Duration::from_millis(40));
  ctx.current.fetch_sub(1, Ordering::SeqCst);
}

fn count_cb(_l: &mut Loop, c: &mut Completion) {
  let ctx = unsafe { &mut *(c.userdata as *mut LoadCtx) };
  c.result_unit().expect("work failed");
  ctx.done += 1;
}

#[test]
fn pool_bound_is_respected() {
  common::init_logging();
  let pool = Arc::new(
    ThreadPool::new(PoolOptions { min_threads: 2, max_threads: 2 })
      .expect("pool"),
  );
  let mut lp = Loop::new(Options {
    thread_pool: Some(pool),
    ..Options::default()
  })
  .expect("loop");

  let mut ctx = LoadCtx {
    current: AtomicUsize::new(0),
    peak: AtomicUsize::new(0),
    done: 0,
  };
  let ctx_ptr = &mut ctx as *mut LoadCtx as *mut c_void;

  let mut works: Vec<Completion> = (0..4)
    .map(|_| Completion::work(load_work, ctx_ptr, count_cb))
    .collect();
  for w in works.iter_mut() {
    unsafe { lp.add(w) };
  }
  lp.run(RunMode::UntilDone).expect("run failed");

  assert_eq!(ctx.done, 4, "every work callback fires exactly once");
  let peak = ctx.peak.load(Ordering::SeqCst);
  assert!(peak <= 2, "worker bound exceeded: peak {peak}");
  assert!(peak >= 1);
}
