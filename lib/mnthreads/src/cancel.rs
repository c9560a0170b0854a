// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thread cancellation and cleanup handlers.
//!
//! A cancellation request is recorded in the target and acted on at the next
//! cancellation point (`join`, `sleep`, condition variable waits, `sigwait`,
//! `sigsuspend`, [`test_cancel`]) or, for asynchronous cancelability, at the
//! next safepoint. Acting on it unwinds the thread through its cleanup
//! handlers to the exit path with [`ExitStatus::Canceled`].

use std::panic;
use std::sync::Arc;

use log::{debug, trace};

use crate::error::{ThrError, ThrResult};
use crate::lifecycle::ThreadExit;
use crate::runtime::Runtime;
use crate::threads::{ExitStatus, Thread, ThreadFlags, ThreadId, ThreadState, Wakeup};
use crate::tls::Environment;
use crate::wait;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelState {
    Enable,
    Disable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelType {
    /// Only at cancellation points.
    Deferred,
    /// At any safepoint, and while waiting for a mutex.
    Asynchronous,
}

/// Requests cancellation of `tid`.
pub fn cancel(tid: ThreadId) -> ThrResult<()> {
    let rt = Runtime::current();
    let t = rt.lookup(tid)?;

    let interrupt = {
        let mut st = t.kseg.lock();
        let s = st.try_sched(tid).ok_or(ThrError::NoSuchThread)?;
        if s.state == ThreadState::Dead || s.flags.contains(ThreadFlags::EXITING) {
            return Ok(());
        }
        s.cancel.pending = true;
        t.sigcheck.store(true, core::sync::atomic::Ordering::Release);
        let actionable = s.cancel.enabled
            && (s.state.is_cancellation_point()
                || (s.cancel.asynchronous && s.state == ThreadState::MutexWait));
        if actionable {
            s.wait_on.clone().map(|on| (s.wait_gen, on))
        } else {
            None
        }
    };
    debug!("cancel {} (interrupt: {:?})", tid, interrupt.as_ref().map(|i| &i.1));

    if let Some((gen, on)) = interrupt {
        wait::backout(&t, gen, &on, Wakeup::Canceled);
    }
    drop(t);

    if let Some(me) = Environment::try_thread() {
        if me.id == tid {
            async_point(&me);
        }
    }
    Ok(())
}

/// Enables or disables cancelability of the caller; returns the old state.
pub fn set_cancel_state(state: CancelState) -> ThrResult<CancelState> {
    let me = Environment::current()?;
    let old = {
        let mut st = me.kseg.lock();
        let c = &mut st.sched(me.id).cancel;
        let old = c.enabled;
        c.enabled = state == CancelState::Enable;
        old
    };
    async_point(&me);
    Ok(if old {
        CancelState::Enable
    } else {
        CancelState::Disable
    })
}

/// Sets the cancelability type of the caller; returns the old type.
pub fn set_cancel_type(ty: CancelType) -> ThrResult<CancelType> {
    let me = Environment::current()?;
    let old = {
        let mut st = me.kseg.lock();
        let c = &mut st.sched(me.id).cancel;
        let old = c.asynchronous;
        c.asynchronous = ty == CancelType::Asynchronous;
        old
    };
    async_point(&me);
    Ok(if old {
        CancelType::Asynchronous
    } else {
        CancelType::Deferred
    })
}

/// A cancellation point without any other effect.
pub fn test_cancel() {
    if let Some(me) = Environment::try_thread() {
        test_point(&me);
    }
}

/// Pushes a handler that runs if the thread exits or is canceled before
/// the matching [`cleanup_pop`].
pub fn cleanup_push<F>(handler: F) -> ThrResult<()>
where
    F: FnOnce() + Send + 'static,
{
    let me = Environment::current()?;
    me.cleanup.lock().push(Box::new(handler));
    Ok(())
}

/// Removes the most recently pushed handler and runs it if `execute`.
pub fn cleanup_pop(execute: bool) -> ThrResult<()> {
    let me = Environment::current()?;
    let handler = me.cleanup.lock().pop().ok_or(ThrError::InvalidArgument)?;
    if execute {
        handler();
    }
    Ok(())
}

fn should_act(me: &Arc<Thread>, only_async: bool) -> bool {
    let mut st = me.kseg.lock();
    let c = &st.sched(me.id).cancel;
    c.enabled && c.pending && (!only_async || c.asynchronous)
}

/// Acts on a pending cancellation at a cancellation point.
pub(crate) fn test_point(me: &Arc<Thread>) {
    if should_act(me, false) {
        act(me)
    }
}

/// Acts on a pending cancellation if the caller is asynchronously
/// cancelable.
pub(crate) fn async_point(me: &Arc<Thread>) {
    if should_act(me, true) {
        act(me)
    }
}

/// Unwinds the calling thread to its exit path.
///
/// Must be called without any lock held.
pub(crate) fn act(me: &Arc<Thread>) -> ! {
    {
        let mut st = me.kseg.lock();
        let s = st.sched(me.id);
        s.cancel.enabled = false;
        s.cancel.pending = false;
        // No suspension between here and the exit path.
        s.critical += 1;
    }
    trace!("{} acts on cancellation", me.id);
    panic::resume_unwind(Box::new(ThreadExit(ExitStatus::Canceled)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lifecycle::{join, sleep, spawn};
    use core::time::Duration;
    use crossbeam_queue::ArrayQueue;

    #[test]
    fn cancel_sleeping_thread() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config::default());
        let ran: Arc<ArrayQueue<&'static str>> = Arc::new(ArrayQueue::new(4));
        let r = ran.clone();
        rt.block_on(move || {
            let t = spawn(move || {
                let r2 = r.clone();
                cleanup_push(move || {
                    assert!(r2.push("cleanup").is_ok());
                })
                .expect("Can't push handler");
                let _ = sleep(Duration::from_secs(30));
                assert!(r.push("woke").is_ok());
                0
            })
            .expect("Can't spawn");
            while crate::lifecycle::state(t) != Ok(ThreadState::SleepWait) {
                crate::lifecycle::yield_now();
            }
            cancel(t).expect("Can't cancel");
            assert_eq!(join(t), Ok(ExitStatus::Canceled));
        });
        assert_eq!(ran.pop(), Some("cleanup"));
        assert_eq!(ran.pop(), None);
    }

    #[test]
    fn disabled_cancel_is_deferred() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config::default());
        rt.block_on(|| {
            let t = spawn(|| {
                let old = set_cancel_state(CancelState::Disable).expect("Can't disable");
                assert_eq!(old, CancelState::Enable);
                let me = crate::lifecycle::current();
                cancel(me).expect("Can't cancel myself");
                test_cancel();
                set_cancel_state(CancelState::Enable).expect("Can't enable");
                test_cancel();
                1
            })
            .expect("Can't spawn");
            assert_eq!(join(t), Ok(ExitStatus::Canceled));
        });
    }

    #[test]
    fn cleanup_pop_runs_handler() {
        let rt = Runtime::new(Config::default());
        rt.block_on(|| {
            let hits: Arc<ArrayQueue<usize>> = Arc::new(ArrayQueue::new(2));
            let h = hits.clone();
            cleanup_push(move || {
                assert!(h.push(1).is_ok());
            })
            .expect("Can't push");
            cleanup_push(|| {}).expect("Can't push");
            cleanup_pop(false).expect("Can't pop");
            cleanup_pop(true).expect("Can't pop");
            assert_eq!(cleanup_pop(true), Err(ThrError::InvalidArgument));
            assert_eq!(hits.pop(), Some(1));
        });
    }
}
