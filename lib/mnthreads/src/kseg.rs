// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Scheduling groups.
//!
//! A KSEG owns the scheduling state of its member threads, one run queue and
//! one wait queue. Everything in [`KsegState`] is protected by the group's
//! scheduling lock.
//!
//! # Lock order
//! Allocator lock, thread-list lock, then KSEG locks. Signal, condvar, mutex
//! and join locks are all taken before a KSEG lock. At most one KSEG lock is
//! held at any time.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use log::trace;
#[cfg(feature = "latency")]
use log::warn;

use crate::kse::Kse;
use crate::runq::RunQueue;
use crate::threads::{
    Membership, Thread, ThreadFlags, ThreadId, ThreadSched, ThreadState, WaitOn, Wakeup,
};
use crate::waitq::{EntryKind, WaitEntry, WaitQueue};

/// A synchronization wait whose deadline passed; it is backed out by the
/// caller once the KSEG lock is released.
pub(crate) struct Expired {
    pub(crate) thread: Arc<Thread>,
    pub(crate) gen: u64,
    pub(crate) on: WaitOn,
}

pub(crate) struct KsegState {
    pub(crate) threads: HashMap<ThreadId, ThreadSched>,
    pub(crate) runq: RunQueue,
    pub(crate) waitq: WaitQueue,
    /// Threads back from a blocking system call.
    pub(crate) completed: Vec<ThreadId>,
    pub(crate) kses: Vec<Arc<Kse>>,
    pub(crate) idle: Vec<Arc<Kse>>,
    /// Highest queued level + 1 (0: run queue empty).
    top: Arc<AtomicUsize>,
}

pub(crate) struct Kseg {
    pub(crate) id: usize,
    /// The primary (process-scope) group.
    pub(crate) primary: bool,
    state: spin::Mutex<KsegState>,
    top: Arc<AtomicUsize>,
}

impl fmt::Debug for Kseg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Kseg#{}", self.id)
    }
}

#[cfg(feature = "latency")]
const LOCK_LATENCY_WARN: core::time::Duration = core::time::Duration::from_micros(100);

impl Kseg {
    pub(crate) fn new(id: usize, primary: bool) -> Kseg {
        let top = Arc::new(AtomicUsize::new(0));
        Kseg {
            id,
            primary,
            state: spin::Mutex::new(KsegState {
                threads: HashMap::with_capacity(if primary { 64 } else { 1 }),
                runq: RunQueue::new(),
                waitq: WaitQueue::new(),
                completed: Vec::new(),
                kses: Vec::new(),
                idle: Vec::new(),
                top: top.clone(),
            }),
            top,
        }
    }

    /// Acquires the scheduling lock.
    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, KsegState> {
        #[cfg(feature = "latency")]
        let start = Instant::now();

        let guard = self.state.lock();

        #[cfg(feature = "latency")]
        if start.elapsed() > LOCK_LATENCY_WARN {
            warn!("{:?} lock took {:?}", self, start.elapsed());
        }
        guard
    }

    /// Releases a lock held by a thread that no longer exists (fork child).
    ///
    /// # Safety
    /// No other thread may use the group at the same time.
    pub(crate) unsafe fn force_unlock(&self) {
        if self.state.is_locked() {
            self.state.force_unlock();
        }
    }

    pub(crate) fn try_lock(&self) -> Option<spin::MutexGuard<'_, KsegState>> {
        self.state.try_lock()
    }

    /// Highest level in the run queue (lock-free, may be stale).
    pub(crate) fn top_level(&self) -> Option<usize> {
        match self.top.load(Ordering::Acquire) {
            0 => None,
            l => Some(l - 1),
        }
    }
}

impl KsegState {
    pub(crate) fn sched(&mut self, tid: ThreadId) -> &mut ThreadSched {
        match self.threads.get_mut(&tid) {
            Some(s) => s,
            None => fatal!("{} is not a member of this KSEG", tid),
        }
    }

    pub(crate) fn try_sched(&mut self, tid: ThreadId) -> Option<&mut ThreadSched> {
        self.threads.get_mut(&tid)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    fn publish(&self) {
        let top = self.runq.highest_level().map(|l| l + 1).unwrap_or(0);
        self.top.store(top, Ordering::Release);
    }

    /// Wakes up an idle KSE of this group.
    pub(crate) fn kick(&mut self) {
        if let Some(kse) = self.idle.pop() {
            trace!("kick {:?}", kse);
            kse.kick();
        }
    }

    /// Puts a runnable thread into the run queue.
    pub(crate) fn make_runnable(&mut self, tid: ThreadId, at_head: bool) {
        let KsegState { threads, runq, .. } = self;
        let s = match threads.get_mut(&tid) {
            Some(s) => s,
            None => fatal!("{} is not a member of this KSEG", tid),
        };
        if s.state == ThreadState::Dead {
            fatal!("Resuming dead thread {}", tid);
        }
        if at_head {
            runq.insert_head(s);
        } else {
            runq.insert_tail(s);
        }
        self.publish();
        self.kick();
    }

    /// Takes a thread out of the run queue if it is in there.
    pub(crate) fn dequeue(&mut self, tid: ThreadId) -> bool {
        let KsegState { threads, runq, .. } = self;
        match threads.get_mut(&tid) {
            Some(s) if s.membership == Membership::RunQueue => {
                runq.remove(s);
                self.publish();
                true
            }
            _ => false,
        }
    }

    /// Moves a queued thread to its (new) level after a priority change.
    pub(crate) fn requeue(&mut self, tid: ThreadId) {
        if self.dequeue(tid) {
            self.make_runnable(tid, false);
        }
    }

    /// Picks the next thread to run.
    pub(crate) fn first(&mut self) -> Option<ThreadId> {
        let KsegState { threads, runq, .. } = self;
        let next = runq.first(threads);
        self.publish();
        next
    }

    /// Registers the deadline of a blocked thread.
    pub(crate) fn add_timeout(&mut self, tid: ThreadId) {
        let s = self.sched(tid);
        let kind = if s.membership == Membership::WaitQueue {
            EntryKind::Sleeper
        } else {
            EntryKind::Timer
        };
        let entry = WaitEntry {
            deadline: s.deadline,
            tid,
            gen: s.wait_gen,
            kind,
        };
        if kind == EntryKind::Timer && entry.deadline.is_none() {
            return;
        }
        self.waitq.insert(entry);
    }

    /// Blocks a thread in the wait queue (sleep, join, sigwait, ...).
    pub(crate) fn sleep_on(
        &mut self,
        tid: ThreadId,
        state: ThreadState,
        on: WaitOn,
        deadline: Option<Instant>,
    ) -> u64 {
        let s = self.sched(tid);
        let gen = s.begin_wait(state, on, deadline);
        s.membership = Membership::WaitQueue;
        self.add_timeout(tid);
        gen
    }

    /// Makes a blocked thread runnable again.
    ///
    /// The caller already removed the thread from any synchronization queue.
    /// Threads with a suspend request become `Suspended` instead.
    pub(crate) fn finish_wait(&mut self, tid: ThreadId, wakeup: Wakeup) {
        self.waitq.remove(tid);
        let s = self.sched(tid);
        match s.membership {
            Membership::WaitQueue => s.membership = Membership::None,
            Membership::None => {}
            m => fatal!("{} woken while still queued in {:?}", tid, m),
        }
        trace!("{} {:?} -> Running ({:?})", tid, s.state, wakeup);
        s.wait_on = None;
        s.deadline = None;
        s.wakeup = wakeup;
        s.state = ThreadState::Running;
        if wakeup == Wakeup::Signaled {
            s.flags.insert(ThreadFlags::SIG_BOOST);
        }
        self.make_runnable(tid, false);
    }

    /// Wakes sleepers whose deadline passed and returns the synchronization
    /// waits that expired.
    pub(crate) fn check_waitq(&mut self, now: Instant) -> Vec<Expired> {
        let mut sync = Vec::new();
        for e in self.waitq.expire(now) {
            let s = match self.threads.get(&e.tid) {
                Some(s) => s,
                None => continue,
            };
            if s.wait_gen != e.gen || !s.state.is_blocked() {
                trace!("stale wait entry {:?}", e);
                continue;
            }
            match e.kind {
                EntryKind::Sleeper => self.finish_wait(e.tid, Wakeup::TimedOut),
                EntryKind::Timer => {
                    if let Some(on) = s.wait_on.clone() {
                        sync.push(Expired {
                            thread: s.thread.clone(),
                            gen: e.gen,
                            on,
                        });
                    }
                }
            }
        }
        sync
    }

    /// Moves threads back from the kernel into the run queue.
    pub(crate) fn drain_completed(&mut self) {
        let completed = core::mem::take(&mut self.completed);
        for tid in completed {
            let s = match self.threads.get_mut(&tid) {
                Some(s) => s,
                None => continue,
            };
            s.flags.remove(ThreadFlags::IN_KERNEL);
            if !s.sig.pending.difference(s.sig.mask).is_empty() {
                s.thread.sigcheck.store(true, Ordering::Release);
                s.flags.insert(ThreadFlags::SIG_BOOST);
            }
            self.make_runnable(tid, false);
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.waitq.next_deadline()
    }
}
