//! # evio — completion-based async I/O event loop
//!
//! A single-threaded event loop over the platform's best I/O mechanism:
//! callers describe operations as [`Completion`] records, submit them with
//! [`Loop::add`], and get a callback when the kernel (or a pool worker)
//! finishes each one.
//!
//! | Platform   | Backend                        |
//! |------------|--------------------------------|
//! | Linux      | io_uring completion ring       |
//! | Windows    | I/O completion port            |
//! | Other Unix | epoll/kqueue readiness polling |
//!
//! Intrinsically blocking operations (name resolution everywhere,
//! filesystem syscalls on backends without kernel async) run on an
//! attached [`ThreadPool`] and are handed back to the loop, so `run`
//! itself never stalls on them.
//!
//! ## Model
//!
//! A [`Completion`] is caller-owned storage describing one operation: its
//! parameters, a result slot, a state machine and the callback. From
//! `add` until the callback fires, the loop and its backend borrow the
//! record — it must stay alive and must not move. Buffers and addresses
//! referenced by an operation are borrowed the same way. In exchange, the
//! runtime allocates nothing per operation: every queue is intrusive.
//!
//! ```no_run
//! use std::time::Duration;
//! use evio::{Completion, Loop, Options, RunMode};
//!
//! fn fired(_l: &mut Loop, c: &mut evio::Completion) {
//!   c.result_unit().expect("timer failed");
//! }
//!
//! let mut lp = Loop::new(Options::default()).expect("loop");
//! let mut timer =
//!   Completion::timer(Duration::from_millis(50), std::ptr::null_mut(), fired);
//! unsafe { lp.add(&mut timer) };
//! lp.run(RunMode::UntilDone).expect("run");
//! ```
//!
//! ## Threading
//!
//! All callbacks run on the thread calling [`Loop::run`]; they must not
//! block, and may freely submit more work (picked up on the next
//! iteration). The only cross-thread entry points are [`Loop::waker`]
//! (or [`Loop::wake_from_anywhere`]) and the pool handoff, both of which
//! unblock a sleeping poll promptly.

#[macro_use]
mod macros;

pub mod addr;
mod backend;
mod completion;
mod error;
mod event_loop;
mod pool;
mod queue;
mod sync;

#[cfg(unix)]
pub mod sys;
#[cfg(windows)]
#[path = "sys_windows.rs"]
pub mod sys;

/// Platform I/O handle carried by completions: a file descriptor on Unix,
/// a `SOCKET`/`HANDLE` value on Windows.
#[cfg(unix)]
pub type OsFd = std::os::fd::RawFd;
#[cfg(windows)]
pub type OsFd = usize;

pub use addr::{AddrInfo, AddrInfoHints, SockAddr};
pub use backend::BackendKind;
pub use completion::{
  Callback, Completion, OpKind, OpResult, ShutdownHow, State,
};
pub use error::Error;
pub use event_loop::{Loop, LoopWaker, Options, RunMode};
pub use pool::{PoolOptions, ThreadPool};
pub use sys::getsockname;
