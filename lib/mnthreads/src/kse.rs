// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel schedulable entities.
//!
//! A KSE is an OS thread that runs the scheduler loop for the KSEG it is
//! assigned to. User threads hand control back to it through its inbox.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::sync::{Parker, Unparker};
use log::{error, trace};

use crate::error::{ThrError, ThrResult};
use crate::kseg::Kseg;
use crate::runtime::Runtime;
use crate::scheduler::{self, Outcome};
use crate::signal::SigSet;
use crate::threads::{ThreadId, YieldRequest};
use crate::tls::Environment;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) struct KseId(pub usize);

/// What a KSE does next.
enum Assignment {
    /// On the free list (or not started yet).
    Unassigned,
    Run(Arc<Kseg>),
    Destroy,
}

pub(crate) struct Kse {
    pub(crate) id: KseId,
    pub(crate) rt: Arc<Runtime>,
    inbox: ArrayQueue<(ThreadId, YieldRequest)>,
    unparker: Unparker,
    assignment: spin::Mutex<Assignment>,
    /// Someone wants this KSE to re-evaluate its run queue.
    resched: AtomicBool,
    /// OS signals picked up by this KSE but not yet delivered.
    sigstatus: AtomicU64,
    /// Id of the thread this KSE runs (0: none).
    current: AtomicUsize,
    /// When the current thread was dispatched, in ns since the runtime epoch.
    dispatched_at: AtomicU64,
}

impl fmt::Debug for Kse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Kse#{}", self.id.0)
    }
}

impl Kse {
    /// Creates a KSE and its OS thread; the KSE waits for an assignment.
    pub(crate) fn spawn(rt: Arc<Runtime>, id: KseId) -> ThrResult<Arc<Kse>> {
        let parker = Parker::new();
        let kse = Arc::new(Kse {
            id,
            rt,
            inbox: ArrayQueue::new(8),
            unparker: parker.unparker().clone(),
            assignment: spin::Mutex::new(Assignment::Unassigned),
            resched: AtomicBool::new(false),
            sigstatus: AtomicU64::new(0),
            current: AtomicUsize::new(0),
            dispatched_at: AtomicU64::new(0),
        });

        let k = kse.clone();
        thread::Builder::new()
            .name(format!("kse-{}", id.0))
            .spawn(move || kse_main(k, parker))
            .map_err(|e| {
                error!("Can't spawn KSE {}: {}", id.0, e);
                ThrError::ResourceExhausted
            })?;
        Ok(kse)
    }

    /// Hands the KSE to `kseg`.
    pub(crate) fn assign(&self, kseg: Arc<Kseg>) {
        *self.assignment.lock() = Assignment::Run(kseg);
        self.unparker.unpark();
    }

    /// Lets the OS thread exit once it is unassigned.
    pub(crate) fn destroy(&self) {
        *self.assignment.lock() = Assignment::Destroy;
        self.unparker.unpark();
    }

    fn wait_assignment(&self) -> Option<Arc<Kseg>> {
        loop {
            let next = core::mem::replace(&mut *self.assignment.lock(), Assignment::Unassigned);
            match next {
                Assignment::Run(kseg) => return Some(kseg),
                Assignment::Destroy => return None,
                Assignment::Unassigned => Environment::park(),
            }
        }
    }

    /// Posts a yield request of the running thread.
    pub(crate) fn post(&self, tid: ThreadId, request: YieldRequest) {
        if self.inbox.push((tid, request)).is_err() {
            fatal!("{:?} inbox overflow ({} {:?})", self, tid, request);
        }
        self.unparker.unpark();
    }

    /// Waits for the dispatched thread to give the KSE back.
    pub(crate) fn wait_request(&self) -> (ThreadId, YieldRequest) {
        loop {
            if let Some(r) = self.inbox.pop() {
                return r;
            }
            Environment::park();
        }
    }

    /// Wakes the KSE up if it is idle.
    pub(crate) fn kick(&self) {
        self.resched.store(true, Ordering::Release);
        self.unparker.unpark();
    }

    pub(crate) fn take_resched(&self) -> bool {
        self.resched.swap(false, Ordering::AcqRel)
    }

    /// Parks an idle KSE for at most `timeout`.
    pub(crate) fn idle(&self, timeout: Duration) {
        if !self.take_resched() {
            Environment::park_timeout(timeout);
        }
        self.resched.store(false, Ordering::Release);
    }

    pub(crate) fn note_signals(&self, set: SigSet) {
        self.sigstatus.fetch_or(set.bits(), Ordering::AcqRel);
    }

    pub(crate) fn take_signals(&self) -> SigSet {
        SigSet::from_bits(self.sigstatus.swap(0, Ordering::AcqRel))
    }

    pub(crate) fn set_current(&self, tid: Option<ThreadId>, now: Instant) {
        self.current
            .store(tid.map(|t| t.0).unwrap_or(0), Ordering::Release);
        let ns = now.saturating_duration_since(self.rt.epoch).as_nanos() as u64;
        self.dispatched_at.store(ns, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> Option<ThreadId> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            t => Some(ThreadId(t)),
        }
    }

    /// How long the current thread has been running.
    pub(crate) fn running_for(&self, now: Instant) -> Duration {
        let since = Duration::from_nanos(self.dispatched_at.load(Ordering::Acquire));
        now.saturating_duration_since(self.rt.epoch)
            .saturating_sub(since)
    }
}

fn kse_main(kse: Arc<Kse>, parker: Parker) {
    Environment::install_parker(parker);
    Environment::set_kse(kse.clone());
    while let Some(kseg) = kse.wait_assignment() {
        trace!("{:?} runs {:?}", kse, kseg);
        if scheduler::run(&kse, &kseg) == Outcome::Shutdown {
            break;
        }
    }
    kse.rt.forget_kse(kse.id);
    trace!("{:?} exits", kse);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn inbox_is_fifo() {
        let rt = Runtime::new(Config::default());
        let kse = Kse::spawn(rt, KseId(99)).expect("Can't spawn KSE");
        // Not assigned: the inbox is only ever consumed by us here.
        kse.post(ThreadId(1), YieldRequest::Relinquish);
        kse.post(ThreadId(1), YieldRequest::Exit);
        assert_eq!(kse.inbox.pop(), Some((ThreadId(1), YieldRequest::Relinquish)));
        assert_eq!(kse.inbox.pop(), Some((ThreadId(1), YieldRequest::Exit)));
        assert!(kse.current().is_none());
        kse.note_signals(SigSet::from_bits(0b101));
        assert_eq!(kse.take_signals().bits(), 0b101);
        assert!(kse.take_signals().is_empty());
        kse.destroy();
    }
}
