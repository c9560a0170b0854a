// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Mutexes with priority inheritance and priority ceiling protocols.
//!
//! Contended lockers queue up in priority order and block. `unlock` hands
//! ownership directly to the first waiter, so a woken waiter never has to
//! compete for the mutex again.
//!
//! With the inherit protocol the mutex lends the priority of its highest
//! waiter to the owner, transitively through chains of owners that wait on
//! other mutexes. With the ceiling protocol the owner runs at least at the
//! mutex's ceiling.

use core::cmp;
use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{trace, warn};
use once_cell::sync::OnceCell;

use crate::cancel;
use crate::config::DeadlockPolicy;
use crate::error::{ThrError, ThrResult};
use crate::priority::{self, Priority, MAX_PRIORITY};
use crate::scheduler;
use crate::signal;
use crate::threads::{Membership, Thread, ThreadId, ThreadSched, ThreadState, WaitOn, Wakeup};
use crate::tls::Environment;
use crate::wait::{self, SyncQueue};

static NEXT_MUTEX_ID: AtomicUsize = AtomicUsize::new(1);

/// Upper bound for the length of an owner chain during propagation.
const PROPAGATION_LIMIT: usize = 128;

/// How a mutex reacts to relocking by its owner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MutexType {
    /// Relocking deadlocks (reported as [`ThrError::Deadlock`] or parked,
    /// depending on the runtime configuration).
    Normal,
    /// Relocking fails with [`ThrError::Deadlock`].
    ErrorCheck,
    /// Relocking increments a count; the mutex is released once `unlock`
    /// was called as often as `lock`.
    Recursive,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MutexProtocol {
    None,
    /// The owner inherits the priority of its highest waiter.
    Inherit,
    /// The owner runs at least at the ceiling priority.
    Protect,
}

/// Attributes of a [`Mutex`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MutexAttr {
    kind: MutexType,
    protocol: MutexProtocol,
    ceiling: Priority,
}

impl Default for MutexAttr {
    fn default() -> Self {
        MutexAttr::new()
    }
}

impl MutexAttr {
    pub const fn new() -> Self {
        MutexAttr {
            kind: MutexType::Normal,
            protocol: MutexProtocol::None,
            ceiling: MAX_PRIORITY,
        }
    }

    pub const fn kind(self, kind: MutexType) -> Self {
        MutexAttr { kind, ..self }
    }

    pub const fn protocol(self, protocol: MutexProtocol) -> Self {
        MutexAttr { protocol, ..self }
    }

    pub const fn ceiling(self, ceiling: Priority) -> Self {
        MutexAttr { ceiling, ..self }
    }

    pub fn get_kind(&self) -> MutexType {
        self.kind
    }

    pub fn get_protocol(&self) -> MutexProtocol {
        self.protocol
    }

    pub fn get_ceiling(&self) -> Priority {
        self.ceiling
    }

    fn validate(&self) -> ThrResult<()> {
        priority::check_priority(self.ceiling).map(|_| ())
    }
}

struct MutexState {
    owner: Option<Arc<Thread>>,
    /// Recursive lock count beyond the first acquisition.
    count: usize,
    /// Inherited priority of the owner when it got the mutex.
    saved_prio: Priority,
    waiters: SyncQueue,
    /// Condition variables waiting with this mutex released.
    refcount: usize,
    destroyed: bool,
}

pub(crate) struct MutexInner {
    id: usize,
    kind: MutexType,
    protocol: MutexProtocol,
    ceiling: AtomicI32,
    /// Priority lent to the owner (inherit protocol).
    prio: AtomicI32,
    state: spin::Mutex<MutexState>,
}

impl fmt::Debug for MutexInner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexInner")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl MutexInner {
    fn new(attr: MutexAttr) -> MutexInner {
        MutexInner {
            id: NEXT_MUTEX_ID.fetch_add(1, Ordering::Relaxed),
            kind: attr.kind,
            protocol: attr.protocol,
            ceiling: AtomicI32::new(attr.ceiling),
            prio: AtomicI32::new(0),
            state: spin::Mutex::new(MutexState {
                owner: None,
                count: 0,
                saved_prio: 0,
                waiters: SyncQueue::new(),
                refcount: 0,
                destroyed: false,
            }),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Does ownership affect the owner's priority?
    pub(crate) fn uses_priority(&self) -> bool {
        self.protocol != MutexProtocol::None
    }

    fn ceiling(&self) -> Priority {
        self.ceiling.load(Ordering::Acquire)
    }

    /// Priority this mutex lends to its owner.
    fn lent_priority(&self) -> Priority {
        match self.protocol {
            MutexProtocol::Inherit => self.prio.load(Ordering::Acquire),
            MutexProtocol::Protect => self.ceiling(),
            MutexProtocol::None => 0,
        }
    }

    pub(crate) fn is_owner(&self, tid: ThreadId) -> bool {
        matches!(&self.state.lock().owner, Some(o) if o.id == tid)
    }
}

/// The inherited priority of a thread given the mutexes it owns.
fn recompute_inherited(s: &ThreadSched) -> Priority {
    s.owned
        .iter()
        .map(|m| m.lent_priority())
        .max()
        .unwrap_or(0)
}

/// Updates the priority of an owner after its set of owned mutexes (or what
/// they lend) changed.
fn reprioritize(s: &mut ThreadSched) -> bool {
    s.inherited_priority = recompute_inherited(s);
    let old = s.update_active_priority();
    old != s.active_priority()
}

/// Takes an unowned mutex.
fn acquire(m: &Arc<MutexInner>, ms: &mut MutexState, me: &Arc<Thread>) -> ThrResult<()> {
    if m.protocol == MutexProtocol::Protect && me.active_priority() > m.ceiling() {
        return Err(ThrError::InvalidArgument);
    }
    ms.owner = Some(me.clone());
    ms.count = 0;

    let mut st = me.kseg.lock();
    let s = st.sched(me.id);
    s.owned.push(m.clone());
    match m.protocol {
        MutexProtocol::Inherit => {
            ms.saved_prio = s.inherited_priority;
            let top = ms.waiters.top_priority().unwrap_or(0);
            m.prio.store(cmp::max(top, ms.saved_prio), Ordering::Release);
        }
        MutexProtocol::Protect => {
            reprioritize(s);
        }
        MutexProtocol::None => {}
    }
    trace!("{} acquired mutex {:#x}", me.id, m.id);
    Ok(())
}

/// Gives the mutex to the first live waiter, or leaves it unowned.
///
/// The current owner already dropped it from its owned list.
fn hand_off(m: &Arc<MutexInner>, ms: &mut MutexState) {
    ms.owner = None;
    ms.count = 0;
    while let Some(next) = ms.waiters.pop() {
        let mut st = next.kseg.lock();
        let violates = match st.try_sched(next.id) {
            Some(s) if s.state == ThreadState::MutexWait && s.membership == Membership::Mutex(m.id) => {
                s.membership = Membership::None;
                m.protocol == MutexProtocol::Protect && s.active_priority() > m.ceiling()
            }
            _ => continue,
        };
        if violates {
            warn!(
                "{} exceeds the ceiling of mutex {:#x}, skipped by the hand-off",
                next.id, m.id
            );
            st.finish_wait(next.id, Wakeup::Failed(ThrError::InvalidArgument));
            continue;
        }

        let s = st.sched(next.id);
        s.owned.push(m.clone());
        if m.protocol == MutexProtocol::Inherit {
            ms.saved_prio = s.inherited_priority;
            let top = ms.waiters.top_priority().unwrap_or(0);
            m.prio.store(cmp::max(top, ms.saved_prio), Ordering::Release);
        }
        if m.uses_priority() {
            reprioritize(s);
        }
        trace!("mutex {:#x} handed to {}", m.id, next.id);
        st.finish_wait(next.id, Wakeup::Granted);
        drop(st);
        ms.owner = Some(next);
        return;
    }

    if m.protocol == MutexProtocol::Inherit {
        m.prio.store(0, Ordering::Release);
    }
}

/// Recomputes what an inherit mutex lends to its owner and follows the
/// chain of owners that wait on other mutexes.
fn propagate(start: &Arc<MutexInner>) {
    let mut m = start.clone();
    let mut moved: Option<ThreadId> = None;

    for _hop in 0..PROPAGATION_LIMIT {
        let mut ms = m.state.lock();
        if let Some(tid) = moved.take() {
            ms.waiters.reposition(tid);
        }
        if m.protocol != MutexProtocol::Inherit {
            return;
        }
        let owner = match &ms.owner {
            Some(o) => o.clone(),
            None => return,
        };
        let new = cmp::max(ms.waiters.top_priority().unwrap_or(0), ms.saved_prio);
        if new == m.prio.swap(new, Ordering::AcqRel) {
            return;
        }

        let next = {
            let mut st = owner.kseg.lock();
            let s = match st.try_sched(owner.id) {
                Some(s) => s,
                None => return,
            };
            if !reprioritize(s) {
                return;
            }
            trace!("{} now runs at {}", owner.id, s.active_priority());
            let on = match s.state {
                ThreadState::MutexWait | ThreadState::CondWait => s.wait_on.clone(),
                _ => None,
            };
            st.requeue(owner.id);
            on
        };
        drop(ms);

        match next {
            Some(WaitOn::Mutex(next)) => {
                moved = Some(owner.id);
                m = next;
            }
            Some(WaitOn::Cond(c)) => {
                crate::condvar::reposition_waiter(&c, owner.id);
                return;
            }
            _ => return,
        }
    }
    fatal!(
        "Priority propagation from mutex {:#x} exceeded {} hops",
        start.id,
        PROPAGATION_LIMIT
    );
}

/// Takes a waiter out of the mutex's queue and makes it runnable.
pub(crate) fn backout_waiter(m: &Arc<MutexInner>, t: &Arc<Thread>, gen: u64, reason: Wakeup) {
    let mut ms = m.state.lock();
    {
        let mut st = t.kseg.lock();
        match st.try_sched(t.id) {
            Some(s)
                if s.wait_gen == gen
                    && s.state == ThreadState::MutexWait
                    && s.membership == Membership::Mutex(m.id) =>
            {
                s.membership = Membership::None;
            }
            _ => return,
        }
        ms.waiters.remove(t.id);
        st.finish_wait(t.id, reason);
    }
    drop(ms);
    if m.protocol == MutexProtocol::Inherit {
        propagate(m);
    }
}

/// Moves a waiter after its priority changed.
pub(crate) fn reposition_waiter(m: &Arc<MutexInner>, t: &Arc<Thread>) {
    let moved = m.state.lock().waiters.reposition(t.id);
    if moved && m.protocol == MutexProtocol::Inherit {
        propagate(m);
    }
}

/// A mutex.
///
/// Created either with [`Mutex::new`] or, for statics, with
/// [`Mutex::lazy`], which defers allocation to the first use.
pub struct Mutex {
    attr: MutexAttr,
    inner: OnceCell<Arc<MutexInner>>,
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex").field("attr", &self.attr).finish()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Mutex::lazy(MutexAttr::new())
    }
}

impl Mutex {
    pub fn new(attr: MutexAttr) -> ThrResult<Mutex> {
        attr.validate()?;
        let inner = OnceCell::new();
        let _ = inner.set(Arc::new(MutexInner::new(attr)));
        Ok(Mutex { attr, inner })
    }

    /// A mutex that is set up on first use; attributes are checked then.
    pub const fn lazy(attr: MutexAttr) -> Mutex {
        Mutex {
            attr,
            inner: OnceCell::new(),
        }
    }

    pub(crate) fn inner(&self) -> ThrResult<&Arc<MutexInner>> {
        self.inner.get_or_try_init(|| {
            self.attr.validate()?;
            Ok(Arc::new(MutexInner::new(self.attr)))
        })
    }

    pub fn attr(&self) -> MutexAttr {
        self.attr
    }

    /// Blocks until the caller owns the mutex.
    pub fn lock(&self) -> ThrResult<()> {
        self.lock_until(None, true)
    }

    /// Like [`Mutex::lock`] but gives up with `TimedOut` at `deadline`.
    pub fn timed_lock(&self, deadline: Instant) -> ThrResult<()> {
        self.lock_until(Some(deadline), true)
    }

    pub(crate) fn lock_until(&self, deadline: Option<Instant>, cancelable: bool) -> ThrResult<()> {
        let m = self.inner()?;
        let me = Environment::current()?;

        loop {
            let mut ms = m.state.lock();
            if ms.destroyed {
                return Err(ThrError::InvalidArgument);
            }
            let owner = match ms.owner.clone() {
                None => return acquire(m, &mut ms, &me),
                Some(o) => o,
            };

            if owner.id == me.id {
                match m.kind {
                    MutexType::Recursive => {
                        ms.count += 1;
                        return Ok(());
                    }
                    MutexType::ErrorCheck => return Err(ThrError::Deadlock),
                    MutexType::Normal => {
                        if me.rt.config.deadlock == DeadlockPolicy::Park {
                            drop(ms);
                            park_deadlocked(&me);
                        }
                        return Err(ThrError::Deadlock);
                    }
                }
            }

            if m.protocol == MutexProtocol::Protect && me.active_priority() > m.ceiling() {
                return Err(ThrError::InvalidArgument);
            }
            if let Some(d) = deadline {
                if d <= Instant::now() {
                    return Err(ThrError::TimedOut);
                }
            }

            ms.waiters.insert(me.clone());
            {
                let mut st = me.kseg.lock();
                let s = st.sched(me.id);
                s.begin_wait(ThreadState::MutexWait, WaitOn::Mutex(m.clone()), deadline);
                s.membership = Membership::Mutex(m.id);
                st.add_timeout(me.id);
            }
            let boost = m.protocol == MutexProtocol::Inherit
                && me.active_priority() > m.prio.load(Ordering::Acquire);
            drop(ms);
            trace!("{} waits for mutex {:#x} owned by {}", me.id, m.id, owner.id);
            if boost {
                propagate(m);
            }

            match wait::block(&me) {
                Wakeup::Granted => return Ok(()),
                Wakeup::TimedOut => return Err(ThrError::TimedOut),
                Wakeup::Failed(e) => return Err(e),
                Wakeup::Signaled => signal::process_pending(&me),
                Wakeup::Canceled if cancelable => cancel::act(&me),
                _ => {}
            }
        }
    }

    /// Takes the mutex if that's possible without blocking.
    pub fn try_lock(&self) -> ThrResult<()> {
        let m = self.inner()?;
        let me = Environment::current()?;
        let mut ms = m.state.lock();
        if ms.destroyed {
            return Err(ThrError::InvalidArgument);
        }
        match ms.owner.as_ref().map(|o| o.id) {
            None => acquire(m, &mut ms, &me),
            Some(tid) if tid == me.id => {
                if m.kind == MutexType::Recursive {
                    ms.count += 1;
                    Ok(())
                } else {
                    Err(ThrError::AlreadyLocked)
                }
            }
            Some(_) => Err(ThrError::WouldBlock),
        }
    }

    pub fn unlock(&self) -> ThrResult<()> {
        let m = self.inner()?;
        let me = Environment::current()?;
        {
            let mut ms = m.state.lock();
            match &ms.owner {
                Some(o) if o.id == me.id => {}
                _ => return Err(ThrError::NotOwner),
            }
            if ms.count > 0 {
                ms.count -= 1;
                return Ok(());
            }

            {
                let mut st = me.kseg.lock();
                let s = st.sched(me.id);
                s.owned.retain(|o| o.id != m.id);
                if m.uses_priority() {
                    reprioritize(s);
                }
            }
            hand_off(m, &mut ms);
        }
        scheduler::safepoint(&me);
        Ok(())
    }

    /// Releases the mutex completely on behalf of a condition variable.
    ///
    /// Returns the recursive count to be restored by [`Mutex::relock`].
    pub(crate) fn release_for_wait(&self, me: &Arc<Thread>) -> ThrResult<usize> {
        let m = self.inner()?;
        let mut ms = m.state.lock();
        match &ms.owner {
            Some(o) if o.id == me.id => {}
            _ => return Err(ThrError::NotOwner),
        }
        let count = ms.count;
        ms.refcount += 1;
        {
            let mut st = me.kseg.lock();
            let s = st.sched(me.id);
            s.owned.retain(|o| o.id != m.id);
            if m.uses_priority() {
                reprioritize(s);
            }
        }
        hand_off(m, &mut ms);
        Ok(count)
    }

    /// Reacquires the mutex after a condition variable wait.
    ///
    /// Doesn't act on cancellation so the caller can unwind with the mutex
    /// held.
    pub(crate) fn relock(&self, count: usize) -> ThrResult<()> {
        let r = self.lock_until(None, false);
        let m = self.inner()?;
        let mut ms = m.state.lock();
        ms.refcount -= 1;
        if r.is_ok() {
            ms.count = count;
        }
        r
    }

    /// Marks the mutex unusable.
    ///
    /// Fails with `Busy` while it is owned, has waiters or a condition
    /// variable waits with it.
    pub fn destroy(&self) -> ThrResult<()> {
        let m = match self.inner.get() {
            Some(m) => m,
            None => return Ok(()),
        };
        let mut ms = m.state.lock();
        if ms.owner.is_some() || !ms.waiters.is_empty() || ms.refcount > 0 {
            return Err(ThrError::Busy);
        }
        ms.destroyed = true;
        Ok(())
    }

    /// Priority the mutex currently lends to its owner.
    pub fn priority(&self) -> ThrResult<Priority> {
        let m = self.inner()?;
        match m.protocol {
            MutexProtocol::None => Err(ThrError::InvalidArgument),
            _ => Ok(m.lent_priority()),
        }
    }

    pub fn ceiling(&self) -> ThrResult<Priority> {
        let m = self.inner()?;
        match m.protocol {
            MutexProtocol::Protect => Ok(m.ceiling()),
            _ => Err(ThrError::InvalidArgument),
        }
    }

    /// Changes the ceiling; returns the old one.
    pub fn set_ceiling(&self, ceiling: Priority) -> ThrResult<Priority> {
        priority::check_priority(ceiling)?;
        let m = self.inner()?;
        if m.protocol != MutexProtocol::Protect {
            return Err(ThrError::InvalidArgument);
        }
        let ms = m.state.lock();
        let old = m.ceiling.swap(ceiling, Ordering::AcqRel);
        if let Some(owner) = &ms.owner {
            let mut st = owner.kseg.lock();
            if let Some(s) = st.try_sched(owner.id) {
                if reprioritize(s) {
                    st.requeue(owner.id);
                }
            }
        }
        Ok(old)
    }

    /// Id of the owning thread.
    pub fn owner(&self) -> Option<ThreadId> {
        self.inner
            .get()
            .and_then(|m| m.state.lock().owner.as_ref().map(|o| o.id))
    }

    /// Locks the mutex and returns a guard that unlocks it when dropped.
    pub fn guard(&self) -> ThrResult<MutexGuard<'_>> {
        self.lock()?;
        Ok(MutexGuard { mutex: self })
    }
}

/// Ownership of a [`Mutex`]; released on drop, including while the thread
/// unwinds after acting on a cancellation.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl<'a> MutexGuard<'a> {
    pub fn mutex(&self) -> &'a Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            warn!("Can't unlock {:?} from its guard: {}", self.mutex, e);
        }
    }
}

/// Parks the caller forever after it relocked a normal mutex it owns.
///
/// Signal handlers still run.
fn park_deadlocked(me: &Arc<Thread>) -> ! {
    warn!("{} relocked a normal mutex it owns, parking it", me.id);
    loop {
        if let Wakeup::Signaled =
            wait::sleep_until(me, ThreadState::Deadlock, WaitOn::Deadlock, None)
        {
            signal::process_pending(me);
        }
    }
}
