// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Blocking, waking and backing threads out of their waits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use log::trace;

use crate::priority::Priority;
use crate::threads::{Thread, ThreadId, ThreadState, WaitOn, Wakeup, YieldRequest};

/// Wait queue of a mutex or condition variable.
///
/// Ordered by descending active priority, FIFO among equal priorities.
#[derive(Default)]
pub(crate) struct SyncQueue {
    q: VecDeque<(Priority, Arc<Thread>)>,
}

impl SyncQueue {
    pub(crate) fn new() -> Self {
        SyncQueue { q: VecDeque::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.q.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub(crate) fn insert(&mut self, t: Arc<Thread>) {
        let prio = t.active_priority();
        let pos = self.q.partition_point(|(p, _)| *p >= prio);
        self.q.insert(pos, (prio, t));
    }

    pub(crate) fn pop(&mut self) -> Option<Arc<Thread>> {
        self.q.pop_front().map(|(_, t)| t)
    }

    pub(crate) fn remove(&mut self, tid: ThreadId) -> Option<Arc<Thread>> {
        let pos = self.q.iter().position(|(_, t)| t.id == tid)?;
        self.q.remove(pos).map(|(_, t)| t)
    }

    /// Re-sorts a member after its priority changed.
    pub(crate) fn reposition(&mut self, tid: ThreadId) -> bool {
        match self.remove(tid) {
            Some(t) => {
                self.insert(t);
                true
            }
            None => false,
        }
    }

    pub(crate) fn top_priority(&self) -> Option<Priority> {
        self.q.front().map(|(_, t)| t.active_priority())
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, tid: ThreadId) -> bool {
        self.q.iter().any(|(_, t)| t.id == tid)
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<ThreadId> {
        self.q.iter().map(|(_, t)| t.id).collect()
    }
}

/// Gives up the KSE after the caller put itself into a wait and returns the
/// reason it was woken.
pub(crate) fn block(me: &Arc<Thread>) -> Wakeup {
    me.switch(YieldRequest::Block);
    let mut st = me.kseg.lock();
    let s = st.sched(me.id);
    let w = s.wakeup;
    s.wakeup = Wakeup::None;
    w
}

/// Blocks the caller in the wait queue until woken or `deadline`.
pub(crate) fn sleep_until(
    me: &Arc<Thread>,
    state: ThreadState,
    on: WaitOn,
    deadline: Option<Instant>,
) -> Wakeup {
    {
        let mut st = me.kseg.lock();
        st.sleep_on(me.id, state, on, deadline);
    }
    block(me)
}

/// Backs a thread out of the wait it was in at generation `gen`.
///
/// Does nothing if the thread has moved on to another wait (or none) in the
/// meantime. Takes the lock of the object the thread waits on before its
/// KSEG lock, so no KSEG lock may be held by the caller.
pub(crate) fn backout(t: &Arc<Thread>, gen: u64, on: &WaitOn, reason: Wakeup) {
    trace!("backout {} from {:?} ({:?})", t.id, on, reason);
    match on {
        WaitOn::Mutex(m) => crate::mutex::backout_waiter(m, t, gen, reason),
        WaitOn::Cond(c) => crate::condvar::backout_waiter(c, t, gen, reason),
        WaitOn::Join(_)
        | WaitOn::Sleep
        | WaitOn::SigWait
        | WaitOn::SigSuspend
        | WaitOn::Deadlock => {
            let mut st = t.kseg.lock();
            match st.try_sched(t.id) {
                Some(s) if s.wait_gen == gen && (s.state.is_blocked() || s.state == ThreadState::Deadlock) => {
                    st.finish_wait(t.id, reason)
                }
                _ => {}
            }
        }
    }
}
