//! Readiness-poll backend.
//!
//! Interest is registered per descriptor; when the OS reports readiness
//! the backend performs the non-blocking syscall inline and completes the
//! operation, re-arming on a spurious wakeup. Timers live in a userspace
//! heap feeding the poll timeout. Connect follows the
//! `EINPROGRESS`-then-writable protocol with an `SO_ERROR` readback.

#![cfg(unix)]

mod notifier;
mod os;

#[cfg(linux)]
use self::os::epoll as sys;
#[cfg(kqueue)]
use self::os::kqueue as sys;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::mem;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use self::notifier::{Notifier, WAKE_KEY};

use crate::backend::{submit_sync, RemoteWaker};
use crate::completion::{Completion, Op, OpResult, State};
use crate::error::Error;
use crate::queue::Queue;
use crate::sys as shim;

/// One readiness event, normalized across epoll and kqueue.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
  pub(crate) key: u64,
  pub(crate) readable: bool,
  pub(crate) writable: bool,
}

/// At most one reader and one writer may wait per descriptor.
#[derive(Default)]
struct FdWaiters {
  read: Option<NonNull<Completion>>,
  write: Option<NonNull<Completion>>,
}

struct TimerEntry {
  deadline: Instant,
  c: NonNull<Completion>,
}

// Min-heap on deadline.
impl Ord for TimerEntry {
  fn cmp(&self, other: &TimerEntry) -> CmpOrdering {
    other.deadline.cmp(&self.deadline)
  }
}
impl PartialOrd for TimerEntry {
  fn partial_cmp(&self, other: &TimerEntry) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}
impl PartialEq for TimerEntry {
  fn eq(&self, other: &TimerEntry) -> bool {
    self.deadline == other.deadline && self.c == other.c
  }
}
impl Eq for TimerEntry {}

pub(crate) struct Poll {
  os: sys::OsPoller,
  notifier: Notifier,
  fds: HashMap<RawFd, FdWaiters>,
  timers: BinaryHeap<TimerEntry>,
  events: Vec<Event>,
}

impl Poll {
  pub(crate) fn new(entries: u32) -> Result<Poll, Error> {
    let os = sys::OsPoller::new(entries as usize)?;
    let notifier = Notifier::new()?;
    os.add(notifier.read_fd(), WAKE_KEY, true, false)?;
    debug!("readiness backend up ({} event slots)", entries.max(8));
    Ok(Poll {
      os,
      notifier,
      fds: HashMap::new(),
      timers: BinaryHeap::new(),
      events: Vec::new(),
    })
  }

  pub(crate) fn waker(&self) -> RemoteWaker {
    RemoteWaker::pipe(self.notifier.write_end())
  }

  pub(crate) fn next_deadline(&self) -> Option<Instant> {
    self.timers.peek().map(|t| t.deadline)
  }

  pub(crate) fn submit(&mut self, mut c: NonNull<Completion>, done: &mut Queue) {
    let comp = unsafe { c.as_mut() };
    if submit_sync(comp) {
      unsafe { done.push(c) };
      return;
    }
    trace!("poll-backend submit {:?}", comp.op_kind());

    match &comp.op {
      Op::Timer { deadline } => {
        self.timers.push(TimerEntry { deadline: *deadline, c });
      }
      Op::SocketOpen { domain, socktype, protocol } => {
        let result = shim::socket(*domain, *socktype, *protocol);
        complete(comp, OpResult::Fd(result));
        unsafe { done.push(c) };
      }
      Op::Connect { fd, addr } => match shim::connect_raw_errno(*fd, addr) {
        Ok(()) => {
          complete(comp, OpResult::Unit(Ok(())));
          unsafe { done.push(c) };
        }
        Err(errno)
          if errno == libc::EINPROGRESS || errno == libc::EINTR =>
        {
          self.register(*fd, c, false, done);
        }
        Err(errno) => {
          complete(comp, OpResult::Unit(Err(Error::from_errno(errno))));
          unsafe { done.push(c) };
        }
      },
      Op::Accept { fd } | Op::Recv { fd, .. } | Op::RecvFrom { fd, .. } => {
        let fd = *fd;
        self.register(fd, c, true, done);
      }
      Op::Send { fd, .. } | Op::SendTo { fd, .. } => {
        let fd = *fd;
        self.register(fd, c, false, done);
      }
      other => {
        // Pool-routed kinds never reach the backend; anything else here
        // is a routing bug.
        warn!("unsupported op {:?} on readiness backend", other.kind());
        comp.set_error(Error::Unexpected);
        comp.set_state(State::Completed);
        unsafe { done.push(c) };
      }
    }
  }

  fn register(
    &mut self,
    fd: RawFd,
    c: NonNull<Completion>,
    read: bool,
    done: &mut Queue,
  ) {
    let waiters = self.fds.entry(fd).or_default();
    let slot = if read { &mut waiters.read } else { &mut waiters.write };
    if slot.is_some() {
      warn!("descriptor {fd} already has a pending {} waiter", direction(read));
      let comp = unsafe { &mut *c.as_ptr() };
      comp.set_error(Error::DeviceBusy);
      comp.set_state(State::Completed);
      unsafe { done.push(c) };
      return;
    }
    *slot = Some(c);

    let (r, w) = (waiters.read.is_some(), waiters.write.is_some());
    let known = r as usize + w as usize > 1;
    let result = if known {
      self.os.modify(fd, fd as u64, r, w)
    } else {
      self.os.add(fd, fd as u64, r, w)
    };
    if let Err(err) = result {
      if let Some(waiters) = self.fds.get_mut(&fd) {
        let slot = if read { &mut waiters.read } else { &mut waiters.write };
        *slot = None;
        if waiters.read.is_none() && waiters.write.is_none() {
          self.fds.remove(&fd);
        }
      }
      let comp = unsafe { &mut *c.as_ptr() };
      comp.set_error(err);
      comp.set_state(State::Completed);
      unsafe { done.push(c) };
    }
  }

  pub(crate) fn cancel(
    &mut self,
    target: NonNull<Completion>,
    done: &mut Queue,
  ) -> bool {
    // Timers first.
    let before = self.timers.len();
    self.timers.retain(|t| t.c != target);
    if self.timers.len() != before {
      let comp = unsafe { &mut *target.as_ptr() };
      comp.set_error(Error::Canceled);
      comp.set_state(State::Completed);
      unsafe { done.push(target) };
      return true;
    }

    // Then descriptor waiters.
    let mut found: Option<(RawFd, bool)> = None;
    for (fd, waiters) in self.fds.iter() {
      if waiters.read == Some(target) {
        found = Some((*fd, true));
        break;
      }
      if waiters.write == Some(target) {
        found = Some((*fd, false));
        break;
      }
    }
    let Some((fd, read)) = found else { return false };

    self.clear_slot(fd, read);
    let comp = unsafe { &mut *target.as_ptr() };
    comp.set_error(Error::Canceled);
    comp.set_state(State::Completed);
    unsafe { done.push(target) };
    true
  }

  /// Drops a waiter slot and shrinks or removes the OS registration.
  fn clear_slot(&mut self, fd: RawFd, read: bool) {
    let Some(waiters) = self.fds.get_mut(&fd) else { return };
    if read {
      waiters.read = None;
    } else {
      waiters.write = None;
    }
    let (r, w) = (waiters.read.is_some(), waiters.write.is_some());
    if r || w {
      if let Err(err) = self.os.modify(fd, fd as u64, r, w) {
        warn!("interest update for fd {fd} failed: {err}");
      }
    } else {
      self.fds.remove(&fd);
      if let Err(err) = self.os.delete(fd) {
        warn!("interest removal for fd {fd} failed: {err}");
      }
    }
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

    let mut events = mem::take(&mut self.events);
    events.clear();
    let n = self.os.wait(effective, &mut events)?;

    for ev in &events {
      if ev.key == WAKE_KEY {
        self.notifier.drain();
        continue;
      }
      let fd = ev.key as RawFd;
      if ev.readable {
        self.handle_ready(fd, true, done);
      }
      if ev.writable {
        self.handle_ready(fd, false, done);
      }
    }
    self.events = events;

    let fired = self.expire_timers(done);

    Ok(n == 0 && fired == 0 && done.is_empty())
  }

  fn handle_ready(&mut self, fd: RawFd, read: bool, done: &mut Queue) {
    let waiter = match self.fds.get(&fd) {
      Some(w) => {
        if read {
          w.read
        } else {
          w.write
        }
      }
      None => None,
    };
    let Some(c) = waiter else { return };

    let comp = unsafe { &mut *c.as_ptr() };
    match shim::perform_nonblocking(comp) {
      Some(result) => {
        complete(comp, result);
        self.clear_slot(fd, read);
        unsafe { done.push(c) };
      }
      None => {
        // Spurious readiness; the registration stays armed.
        trace!("fd {fd} not actually {} ready", direction(read));
      }
    }
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

fn complete(c: &mut Completion, result: OpResult) {
  c.set_result(result);
  c.set_state(State::Completed);
}

fn direction(read: bool) -> &'static str {
  if read {
    "read"
  } else {
    "write"
  }
}
