#![allow(dead_code)]

use std::sync::{Arc, Once};

use evio::{Loop, Options, PoolOptions, ThreadPool};

pub fn init_logging() {
  static INIT: Once = Once::new();
  INIT.call_once(|| {
    let _ = env_logger::builder().is_test(true).try_init();
  });
}

/// A loop with a small pool attached, the usual test configuration.
pub fn test_loop() -> Loop {
  init_logging();
  let pool = ThreadPool::new(PoolOptions { min_threads: 1, max_threads: 4 })
    .expect("spawning the test pool");
  Loop::new(Options { thread_pool: Some(Arc::new(pool)), ..Options::default() })
    .expect("creating the test loop")
}

/// A loop with no pool, for the NoThreadPool paths.
pub fn poolless_loop() -> Loop {
  init_logging();
  Loop::new(Options::default()).expect("creating the test loop")
}

/// A pool-backed loop forced onto the readiness backend, so the polling
/// paths get coverage on hosts whose default is the completion ring.
pub fn readiness_loop() -> Loop {
  init_logging();
  let pool = ThreadPool::new(PoolOptions { min_threads: 1, max_threads: 4 })
    .expect("spawning the test pool");
  Loop::new(Options {
    backend: Some(evio::BackendKind::ReadinessPoll),
    thread_pool: Some(Arc::new(pool)),
    ..Options::default()
  })
  .expect("creating the readiness-backend loop")
}
