// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The core logic of the scheduler.
//!
//! Has the following properties:
//! * Every KSE runs the loop in [`run`] for the KSEG it is assigned to.
//! * Strict priority scheduling, round robin within a priority level.
//! * A running thread is only taken off its KSE at a safepoint (any call into
//!   the runtime): there it notices pending signals, suspend requests, higher
//!   priority threads and the end of its time slice.
//! * Expired timeouts are handled on every activation and at safepoints.

use std::sync::Arc;
use std::time::Instant;

use log::trace;

use crate::kse::Kse;
use crate::kseg::{Expired, Kseg, KsegState};
use crate::threads::{Thread, ThreadId, ThreadState, Wakeup, YieldRequest};
use crate::tls::Environment;

/// Why a KSE left its group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Outcome {
    /// The group has no threads left.
    Retired,
    /// The runtime session ended.
    Shutdown,
}

/// Backs out synchronization waits whose deadline passed.
///
/// Must be called without holding any KSEG lock.
pub(crate) fn backout_expired(expired: Vec<Expired>) {
    for e in expired {
        crate::wait::backout(&e.thread, e.gen, &e.on, Wakeup::TimedOut);
    }
}

/// Handles a yield request of the thread given by `tid`.
///
/// Updates the run queue accordingly.
fn handle_yield_request(st: &mut KsegState, kse: &Kse, tid: ThreadId, request: YieldRequest) {
    match request {
        YieldRequest::Relinquish | YieldRequest::Preempted => {
            let s = st.sched(tid);
            s.kse = None;
            if s.state == ThreadState::Running {
                trace!("Thread {} gave up its KSE ({:?}).", tid, request);
                st.make_runnable(tid, request == YieldRequest::Preempted);
            }
        }
        YieldRequest::Block | YieldRequest::BlockInKernel => {
            // The thread may already run on another KSE.
            if let Some(s) = st.try_sched(tid) {
                if s.kse == Some(kse.id) {
                    s.kse = None;
                }
            }
        }
        YieldRequest::Exit => {
            trace!("Thread {} has terminated.", tid);
            match st.threads.remove(&tid) {
                Some(s) => {
                    if s.state != ThreadState::Dead {
                        fatal!("{} exits in state {:?}", tid, s.state);
                    }
                    s.thread.kse_done.store(true, core::sync::atomic::Ordering::Release);
                }
                None => fatal!("Exiting thread {} is unknown", tid),
            }
        }
    }
}

/// The scheduler loop of `kse` for `kseg`.
pub(crate) fn run(kse: &Arc<Kse>, kseg: &Arc<Kseg>) -> Outcome {
    let rt = kse.rt.clone();
    let session = rt.session();
    kseg.lock().kses.push(kse.clone());

    let mut prev: Option<(ThreadId, YieldRequest)> = None;
    loop {
        crate::signal::os::poll(kse);

        let now = Instant::now();
        let mut st = kseg.lock();
        st.drain_completed();
        let expired = st.check_waitq(now);
        if !expired.is_empty() {
            drop(st);
            backout_expired(expired);
            st = kseg.lock();
        }

        if let Some((tid, request)) = prev.take() {
            handle_yield_request(&mut st, kse, tid, request);
        }

        if kseg.primary && rt.session() != session {
            st.kses.retain(|k| k.id != kse.id);
            st.idle.retain(|k| k.id != kse.id);
            trace!("{:?} leaves {:?}, session ended", kse, kseg);
            return Outcome::Shutdown;
        }

        match st.first() {
            Some(tid) => {
                let s = st.sched(tid);
                if s.state != ThreadState::Running {
                    fatal!("Dispatching {} in state {:?}", tid, s.state);
                }
                s.kse = Some(kse.id);
                let thread = s.thread.clone();
                kse.set_current(Some(tid), now);
                drop(st);

                trace!("{:?} dispatches {}", kse, tid);
                thread.carrier.resume(kse.clone());
                let (rtid, request) = kse.wait_request();
                if rtid != tid {
                    fatal!("{:?} ran {} but got a request from {}", kse, tid, rtid);
                }
                kse.set_current(None, Instant::now());
                prev = Some((rtid, request));
            }
            None => {
                if st.is_empty() && !kseg.primary {
                    st.kses.retain(|k| k.id != kse.id);
                    let group_done = st.kses.is_empty();
                    drop(st);
                    trace!("{:?} retires from {:?}", kse, kseg);
                    crate::freelist::kse_retire(&rt, kse, kseg, group_done);
                    return Outcome::Retired;
                }

                let idle_cap = rt.config.idle_timeout;
                let timeout = st
                    .next_deadline()
                    .map(|d| d.saturating_duration_since(now).min(idle_cap))
                    .unwrap_or(idle_cap);
                st.idle.push(kse.clone());
                drop(st);

                kse.idle(timeout);
                kseg.lock().idle.retain(|k| k.id != kse.id);
            }
        }
    }
}

/// Serves expired timeouts of the caller's group without waiting for a KSE.
fn expire_timers(kseg: &Kseg) {
    let expired = match kseg.try_lock() {
        Some(mut st) => match st.next_deadline() {
            Some(d) if d <= Instant::now() => st.check_waitq(Instant::now()),
            _ => return,
        },
        None => return,
    };
    backout_expired(expired);
}

/// Runs signal handlers and acts on asynchronous cancellation if someone
/// flagged the thread.
pub(crate) fn poll_async(me: &Arc<Thread>) {
    if me.sigcheck.swap(false, core::sync::atomic::Ordering::AcqRel) {
        crate::signal::process_pending(me);
        crate::cancel::async_point(me);
    }
}

/// Where a running thread notices that it should give up its KSE.
pub(crate) fn safepoint(me: &Arc<Thread>) {
    poll_async(me);

    expire_timers(&me.kseg);

    let rt = &me.rt;
    let (level, timesliced, suspend) = {
        let mut st = me.kseg.lock();
        let s = st.sched(me.id);
        let suspend = crate::runq::Schedulable::suspend_requested(&*s);
        (
            crate::runq::Schedulable::queue_level(&*s),
            s.policy.is_timesliced(),
            suspend,
        )
    };

    if suspend {
        trace!("{} suspends itself", me.id);
        me.switch(YieldRequest::Relinquish);
        return;
    }

    match me.kseg.top_level() {
        Some(top) if top > level => me.switch(YieldRequest::Preempted),
        Some(top) if top == level && timesliced => {
            let kse = Environment::kse();
            if kse.running_for(Instant::now()) >= rt.config.quantum {
                me.switch(YieldRequest::Relinquish);
            }
        }
        _ => {}
    }
}
