// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Condition variables.
//!
//! A sequence number advances on every `signal`/`broadcast`; a waiter only
//! returns successfully once it observed an advance, so neither spurious
//! wakeups nor signal handlers running in the middle of a wait leak out.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::trace;
use once_cell::sync::OnceCell;

use crate::cancel;
use crate::error::{ThrError, ThrResult};
use crate::mutex::{Mutex, MutexInner};
use crate::scheduler;
use crate::signal;
use crate::threads::{Membership, Thread, ThreadId, ThreadState, WaitOn, Wakeup};
use crate::tls::Environment;
use crate::wait::{self, SyncQueue};

static NEXT_COND_ID: AtomicUsize = AtomicUsize::new(1);

struct CondState {
    /// The mutex all current waiters use.
    mutex: Option<Arc<MutexInner>>,
    seq: u64,
    waiters: SyncQueue,
    destroyed: bool,
}

pub(crate) struct CondInner {
    id: usize,
    state: spin::Mutex<CondState>,
}

impl CondInner {
    fn new() -> CondInner {
        CondInner {
            id: NEXT_COND_ID.fetch_add(1, Ordering::Relaxed),
            state: spin::Mutex::new(CondState {
                mutex: None,
                seq: 0,
                waiters: SyncQueue::new(),
                destroyed: false,
            }),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }
}

impl fmt::Debug for CondInner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CondInner#{}", self.id)
    }
}

/// Wakes one waiter; returns false if `t` isn't waiting here anymore.
fn wake(c: &CondInner, t: &Arc<Thread>, reason: Wakeup) -> bool {
    let mut st = t.kseg.lock();
    match st.try_sched(t.id) {
        Some(s) if s.state == ThreadState::CondWait && s.membership == Membership::Cond(c.id) => {
            s.membership = Membership::None;
        }
        _ => return false,
    }
    st.finish_wait(t.id, reason);
    true
}

/// Takes a waiter out of the queue and makes it runnable.
pub(crate) fn backout_waiter(c: &Arc<CondInner>, t: &Arc<Thread>, gen: u64, reason: Wakeup) {
    let mut cs = c.state.lock();
    {
        let mut st = t.kseg.lock();
        match st.try_sched(t.id) {
            Some(s)
                if s.wait_gen == gen
                    && s.state == ThreadState::CondWait
                    && s.membership == Membership::Cond(c.id) =>
            {
                s.membership = Membership::None;
            }
            _ => return,
        }
        cs.waiters.remove(t.id);
        st.finish_wait(t.id, reason);
    }
    if cs.waiters.is_empty() {
        cs.mutex = None;
    }
}

/// Moves a waiter after its priority changed.
pub(crate) fn reposition_waiter(c: &Arc<CondInner>, tid: ThreadId) {
    c.state.lock().waiters.reposition(tid);
}

/// How a wait ended.
enum Outcome {
    Done(ThrResult<()>),
    Canceled,
}

/// A condition variable.
pub struct CondVar {
    inner: OnceCell<Arc<CondInner>>,
}

impl fmt::Debug for CondVar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.get() {
            Some(c) => write!(f, "CondVar#{}", c.id),
            None => write!(f, "CondVar(uninit)"),
        }
    }
}

impl Default for CondVar {
    fn default() -> Self {
        CondVar::new()
    }
}

impl CondVar {
    /// Usable in statics; set up on first use.
    pub const fn new() -> CondVar {
        CondVar {
            inner: OnceCell::new(),
        }
    }

    fn inner(&self) -> &Arc<CondInner> {
        self.inner.get_or_init(|| Arc::new(CondInner::new()))
    }

    /// Releases `mutex`, waits for a signal and reacquires `mutex`.
    pub fn wait(&self, mutex: &Mutex) -> ThrResult<()> {
        self.wait_until(mutex, None)
    }

    /// Like [`CondVar::wait`] but returns `TimedOut` once `deadline` passed
    /// without a signal.
    pub fn timed_wait(&self, mutex: &Mutex, deadline: Instant) -> ThrResult<()> {
        self.wait_until(mutex, Some(deadline))
    }

    fn wait_until(&self, mutex: &Mutex, deadline: Option<Instant>) -> ThrResult<()> {
        let me = Environment::current()?;
        let c = self.inner();
        let mi = mutex.inner()?;
        cancel::test_point(&me);

        let (seq, count) = {
            let mut cs = c.state.lock();
            if cs.destroyed {
                return Err(ThrError::InvalidArgument);
            }
            match &cs.mutex {
                Some(m) if m.id() != mi.id() && !cs.waiters.is_empty() => {
                    return Err(ThrError::InvalidArgument)
                }
                _ => {}
            }
            if !mi.is_owner(me.id) {
                return Err(ThrError::NotOwner);
            }

            let count = mutex.release_for_wait(&me)?;
            let seq = cs.seq;
            cs.mutex = Some(mi.clone());
            enqueue(c, &mut cs, &me, deadline);
            (seq, count)
        };
        trace!("{} waits on cond {} (seq {})", me.id, c.id, seq);

        let outcome = loop {
            let w = wait::block(&me);
            match w {
                Wakeup::Canceled => break Outcome::Canceled,
                Wakeup::Signaled => signal::process_pending(&me),
                _ => {}
            }

            let mut cs = c.state.lock();
            if cs.seq != seq {
                break Outcome::Done(Ok(()));
            }
            if w == Wakeup::TimedOut || matches!(deadline, Some(d) if d <= Instant::now()) {
                break Outcome::Done(Err(ThrError::TimedOut));
            }
            cs.mutex = Some(mi.clone());
            enqueue(c, &mut cs, &me, deadline);
        };

        let relocked = mutex.relock(count);
        match outcome {
            Outcome::Canceled => cancel::act(&me),
            Outcome::Done(r) => relocked.and(r),
        }
    }

    /// Wakes the highest-priority waiter.
    pub fn signal(&self) -> ThrResult<()> {
        let c = self.inner();
        {
            let mut cs = c.state.lock();
            cs.seq += 1;
            while let Some(t) = cs.waiters.pop() {
                if wake(c, &t, Wakeup::Event) {
                    break;
                }
            }
            if cs.waiters.is_empty() {
                cs.mutex = None;
            }
        }
        if let Some(me) = Environment::try_thread() {
            scheduler::safepoint(&me);
        }
        Ok(())
    }

    /// Wakes all waiters.
    pub fn broadcast(&self) -> ThrResult<()> {
        let c = self.inner();
        {
            let mut cs = c.state.lock();
            cs.seq += 1;
            while let Some(t) = cs.waiters.pop() {
                wake(c, &t, Wakeup::Event);
            }
            cs.mutex = None;
        }
        if let Some(me) = Environment::try_thread() {
            scheduler::safepoint(&me);
        }
        Ok(())
    }

    /// Fails with `Busy` while threads wait.
    pub fn destroy(&self) -> ThrResult<()> {
        let c = match self.inner.get() {
            Some(c) => c,
            None => return Ok(()),
        };
        let mut cs = c.state.lock();
        if !cs.waiters.is_empty() {
            return Err(ThrError::Busy);
        }
        cs.destroyed = true;
        Ok(())
    }

    /// Number of blocked waiters.
    pub fn waiters(&self) -> usize {
        self.inner.get().map(|c| c.state.lock().waiters.len()).unwrap_or(0)
    }
}

/// Queues the caller and puts it into COND_WAIT.
fn enqueue(c: &Arc<CondInner>, cs: &mut CondState, me: &Arc<Thread>, deadline: Option<Instant>) {
    cs.waiters.insert(me.clone());
    let mut st = me.kseg.lock();
    let s = st.sched(me.id);
    s.begin_wait(ThreadState::CondWait, WaitOn::Cond(c.clone()), deadline);
    s.membership = Membership::Cond(c.id);
    st.add_timeout(me.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lifecycle::{self, join, spawn};
    use crate::mutex::{MutexAttr, MutexType};
    use crate::runtime::Runtime;
    use crate::threads::ExitStatus;
    use core::time::Duration;

    fn runtime() -> Arc<Runtime> {
        let _r = env_logger::try_init();
        Runtime::new(Config {
            concurrency: 2,
            ..Default::default()
        })
    }

    #[test]
    fn signal_wakes_waiter() {
        let rt = runtime();
        rt.block_on(|| {
            let pair = Arc::new((Mutex::default(), CondVar::new(), AtomicUsize::new(0)));
            let p = pair.clone();
            let t = spawn(move || {
                let (m, cv, ready) = &*p;
                m.lock().unwrap();
                while ready.load(Ordering::SeqCst) == 0 {
                    cv.wait(m).unwrap();
                }
                m.unlock().unwrap();
                ready.load(Ordering::SeqCst)
            })
            .unwrap();

            let (m, cv, ready) = &*pair;
            lifecycle::sleep(Duration::from_millis(10)).unwrap();
            m.lock().unwrap();
            ready.store(42, Ordering::SeqCst);
            cv.signal().unwrap();
            m.unlock().unwrap();
            assert_eq!(join(t), Ok(ExitStatus::Exited(42)));
            assert_eq!(cv.waiters(), 0);
            cv.destroy().unwrap();
        });
    }

    #[test]
    fn timed_wait_times_out_with_mutex_held() {
        let rt = runtime();
        rt.block_on(|| {
            let m = Mutex::new(MutexAttr::new().kind(MutexType::Recursive)).unwrap();
            let cv = CondVar::new();
            m.lock().unwrap();
            m.lock().unwrap();
            let start = Instant::now();
            let r = cv.timed_wait(&m, start + Duration::from_millis(25));
            assert_eq!(r, Err(ThrError::TimedOut));
            assert!(start.elapsed() >= Duration::from_millis(25));
            // The recursive count survived the wait.
            assert_eq!(m.owner(), Some(lifecycle::current()));
            m.unlock().unwrap();
            m.unlock().unwrap();
            assert_eq!(m.owner(), None);
        });
    }

    #[test]
    fn wait_errors() {
        let rt = runtime();
        rt.block_on(|| {
            let m1 = Arc::new(Mutex::default());
            let m2 = Mutex::default();
            let cv = Arc::new(CondVar::new());
            assert_eq!(cv.wait(&m2), Err(ThrError::NotOwner));

            let (m, c) = (m1.clone(), cv.clone());
            let t = spawn(move || {
                m.lock().unwrap();
                c.wait(&m).unwrap();
                m.unlock().unwrap();
                0
            })
            .unwrap();
            while cv.waiters() == 0 {
                lifecycle::yield_now();
            }
            m2.lock().unwrap();
            assert_eq!(
                cv.timed_wait(&m2, Instant::now() + Duration::from_millis(1)),
                Err(ThrError::InvalidArgument)
            );
            assert_eq!(cv.destroy(), Err(ThrError::Busy));
            m2.unlock().unwrap();
            cv.broadcast().unwrap();
            join(t).unwrap();
        });
    }

    #[test]
    fn cancel_reacquires_mutex() {
        let rt = runtime();
        rt.block_on(|| {
            let m = Arc::new(Mutex::default());
            let cv = Arc::new(CondVar::new());
            let (mt, ct) = (m.clone(), cv.clone());
            let t = spawn(move || {
                mt.lock().unwrap();
                let m3 = mt.clone();
                let me = lifecycle::current();
                crate::cancel::cleanup_push(move || {
                    assert_eq!(m3.owner(), Some(me));
                    m3.unlock().unwrap();
                })
                .unwrap();
                loop {
                    ct.wait(&mt).unwrap();
                }
            })
            .unwrap();
            while cv.waiters() == 0 {
                lifecycle::yield_now();
            }
            crate::cancel::cancel(t).unwrap();
            assert_eq!(join(t), Ok(ExitStatus::Canceled));
            assert_eq!(m.owner(), None);
        });
    }
}
