// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thread control blocks.
//!
//! A thread has two halves:
//!
//! * [`Thread`]: the shared, mostly immutable part (id, carrier, KSEG,
//!   join state). Anyone holding an `Arc<Thread>` may look at it.
//! * [`ThreadSched`]: the scheduling state (state machine, priorities, queue
//!   membership, signal mask). It lives inside the thread's KSEG and is only
//!   touched with that KSEG's scheduling lock held.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use log::trace;

use crate::carrier::Carrier;
use crate::condvar::CondInner;
use crate::error::{ThrError, ThrResult};
use crate::kse::KseId;
use crate::kseg::Kseg;
use crate::mutex::MutexInner;
use crate::priority::{self, Priority, SchedParam, SchedPolicy, DEFAULT_PRIORITY};
use crate::runq::Schedulable;
use crate::runtime::Runtime;
use crate::signal::{SigInfo, SigSet, NSIG};
use crate::specific::SpecificSlot;
use crate::stack::StackSpec;
use crate::tls::Environment;

/// The id of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ThreadId(pub usize);

impl Hash for ThreadId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ThreadId {{ id={} }}", self.0)
    }
}

/// States of the thread state machine.
///
/// A thread that is runnable but not running is `Running` with its
/// membership set to the run queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
    Running,
    /// Waiting on a runtime-internal low-level lock.
    LockWait,
    MutexWait,
    CondWait,
    SleepWait,
    SigSuspend,
    SigWait,
    Join,
    Suspended,
    Dead,
    /// Parked forever after relocking a normal mutex it owns.
    Deadlock,
}

impl ThreadState {
    /// Blocked in a wait that some event (or a deadline) ends.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            ThreadState::LockWait
                | ThreadState::MutexWait
                | ThreadState::CondWait
                | ThreadState::SleepWait
                | ThreadState::SigSuspend
                | ThreadState::SigWait
                | ThreadState::Join
        )
    }

    /// Blocking states that act on deferred cancellation.
    pub(crate) fn is_cancellation_point(&self) -> bool {
        matches!(
            self,
            ThreadState::CondWait
                | ThreadState::SleepWait
                | ThreadState::SigSuspend
                | ThreadState::SigWait
                | ThreadState::Join
        )
    }
}

/// The one scheduling queue a thread may be a member of.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Membership {
    None,
    RunQueue,
    WaitQueue,
    /// Wait queue of the mutex with this id.
    Mutex(usize),
    /// Wait queue of the condition variable with this id.
    Cond(usize),
}

/// Contention scope of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    /// Shares the primary group's KSEs with other threads.
    Process,
    /// Bound to a KSE (and KSEG) of its own.
    System,
}

/// How a thread ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    /// Returned from its start routine or called [`crate::exit`].
    Exited(usize),
    /// Acted on a cancellation request.
    Canceled,
    /// The start routine panicked.
    Panicked,
}

/// Why a blocked thread was made runnable again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Wakeup {
    None,
    /// Mutex ownership was handed to the thread.
    Granted,
    /// The event it waited for happened (signal/broadcast, join, sigwait).
    Event,
    TimedOut,
    /// Backed out to run a signal handler.
    Signaled,
    /// Backed out because of a cancellation request.
    Canceled,
    /// Woken with an error (e.g., a late priority-ceiling violation).
    Failed(ThrError),
}

/// The object a blocked thread waits on; used to back it out.
#[derive(Clone)]
pub(crate) enum WaitOn {
    Mutex(Arc<MutexInner>),
    Cond(Arc<CondInner>),
    Join(ThreadId),
    Sleep,
    SigWait,
    SigSuspend,
    Deadlock,
}

impl fmt::Debug for WaitOn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaitOn::Mutex(m) => write!(f, "Mutex({:#x})", m.id()),
            WaitOn::Cond(c) => write!(f, "Cond({:#x})", c.id()),
            WaitOn::Join(t) => write!(f, "Join({})", t.0),
            WaitOn::Sleep => write!(f, "Sleep"),
            WaitOn::SigWait => write!(f, "SigWait"),
            WaitOn::SigSuspend => write!(f, "SigSuspend"),
            WaitOn::Deadlock => write!(f, "Deadlock"),
        }
    }
}

bitflags! {
    pub(crate) struct ThreadFlags: u32 {
        /// Someone asked for this thread to be suspended.
        const SUSPEND_REQ = 0b0001;
        /// Blocked in a system call without a KSE (see `blocking`).
        const IN_KERNEL = 0b0010;
        /// Running its exit path; can't be suspended or canceled anymore.
        const EXITING = 0b0100;
        /// Queued with the signal-delivery boost.
        const SIG_BOOST = 0b1000;
    }
}

/// Cancelability of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CancelFlags {
    pub(crate) enabled: bool,
    pub(crate) asynchronous: bool,
    pub(crate) pending: bool,
}

impl Default for CancelFlags {
    fn default() -> Self {
        CancelFlags {
            enabled: true,
            asynchronous: false,
            pending: false,
        }
    }
}

/// Per-thread signal state.
pub(crate) struct ThreadSignals {
    pub(crate) mask: SigSet,
    pub(crate) pending: SigSet,
    /// siginfo of each pending signal, indexed by signal number.
    pub(crate) info: Vec<Option<SigInfo>>,
    /// Set while in SIGWAIT.
    pub(crate) waitset: SigSet,
    /// The signal that ended a SIGWAIT.
    pub(crate) caught: Option<SigInfo>,
}

impl ThreadSignals {
    fn new(mask: SigSet) -> Self {
        ThreadSignals {
            mask,
            pending: SigSet::empty(),
            info: vec![None; NSIG],
            waitset: SigSet::empty(),
            caught: None,
        }
    }
}

/// Scheduling state of a thread, protected by its KSEG's lock.
pub(crate) struct ThreadSched {
    pub(crate) thread: Arc<Thread>,
    pub(crate) state: ThreadState,
    pub(crate) membership: Membership,
    pub(crate) flags: ThreadFlags,
    pub(crate) policy: SchedPolicy,
    pub(crate) base_priority: Priority,
    pub(crate) inherited_priority: Priority,
    active_priority: Priority,
    /// Mutexes owned by this thread, in acquisition order.
    pub(crate) owned: Vec<Arc<MutexInner>>,
    /// What the thread currently waits on.
    pub(crate) wait_on: Option<WaitOn>,
    /// Incremented on every block; ties timers and backouts to one wait.
    pub(crate) wait_gen: u64,
    pub(crate) deadline: Option<Instant>,
    pub(crate) wakeup: Wakeup,
    /// The KSE currently running this thread.
    pub(crate) kse: Option<KseId>,
    /// Nesting depth of sections that must not be suspended.
    pub(crate) critical: u32,
    pub(crate) sig: ThreadSignals,
    pub(crate) cancel: CancelFlags,
}

impl ThreadSched {
    pub(crate) fn new(thread: Arc<Thread>, param: SchedParam, mask: SigSet) -> Self {
        thread
            .active_priority
            .store(param.priority, Ordering::Release);
        ThreadSched {
            thread,
            state: ThreadState::Running,
            membership: Membership::None,
            flags: ThreadFlags::empty(),
            policy: param.policy,
            base_priority: param.priority,
            inherited_priority: 0,
            active_priority: param.priority,
            owned: Vec::new(),
            wait_on: None,
            wait_gen: 0,
            deadline: None,
            wakeup: Wakeup::None,
            kse: None,
            critical: 0,
            sig: ThreadSignals::new(mask),
            cancel: Default::default(),
        }
    }

    pub(crate) fn tid(&self) -> ThreadId {
        self.thread.id
    }

    pub(crate) fn active_priority(&self) -> Priority {
        self.active_priority
    }

    /// Recomputes the active priority as `max(base, inherited)`.
    ///
    /// Returns the previous value. Callers are responsible for moving the
    /// thread inside whatever queue it is in.
    pub(crate) fn update_active_priority(&mut self) -> Priority {
        let old = self.active_priority;
        self.active_priority = core::cmp::max(self.base_priority, self.inherited_priority);
        self.thread
            .active_priority
            .store(self.active_priority, Ordering::Release);
        old
    }

    /// Moves a running thread into a blocking state.
    ///
    /// Returns the wait generation to be passed to the backout path.
    pub(crate) fn begin_wait(
        &mut self,
        state: ThreadState,
        on: WaitOn,
        deadline: Option<Instant>,
    ) -> u64 {
        if self.state != ThreadState::Running || self.membership != Membership::None {
            fatal!(
                "Thread {} blocks in {:?} while {:?}/{:?}",
                self.tid(),
                state,
                self.state,
                self.membership
            );
        }
        trace!("{} -> {:?} on {:?}", self.tid(), state, on);
        self.wait_gen += 1;
        self.state = state;
        self.wait_on = Some(on);
        self.deadline = deadline;
        self.wakeup = Wakeup::None;
        self.wait_gen
    }

    /// Installs a new signal mask.
    pub(crate) fn set_sigmask(&mut self, mask: SigSet) {
        self.sig.mask = mask.without_unblockable();
    }
}

impl Schedulable for ThreadSched {
    fn tid(&self) -> ThreadId {
        self.thread.id
    }

    fn queue_level(&self) -> usize {
        priority::queue_level(
            self.active_priority,
            self.policy,
            self.flags.contains(ThreadFlags::SIG_BOOST),
        )
    }

    fn membership(&self) -> Membership {
        self.membership
    }

    fn set_membership(&mut self, m: Membership) {
        self.membership = m;
    }

    fn suspend_requested(&self) -> bool {
        self.flags.contains(ThreadFlags::SUSPEND_REQ)
            && !self.flags.contains(ThreadFlags::EXITING)
            && self.critical == 0
    }

    fn mark_suspended(&mut self) {
        trace!("{} is suspended", self.thread.id);
        self.state = ThreadState::Suspended;
    }
}

/// Attributes for creating a thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadAttr {
    scope: Scope,
    detached: bool,
    stack: Option<StackSpec>,
    param: SchedParam,
    inherit_sched: bool,
    suspended: bool,
    name: Option<String>,
}

impl Default for ThreadAttr {
    fn default() -> Self {
        ThreadAttr {
            scope: Scope::Process,
            detached: false,
            stack: None,
            param: SchedParam {
                policy: SchedPolicy::Other,
                priority: DEFAULT_PRIORITY,
            },
            inherit_sched: false,
            suspended: false,
            name: None,
        }
    }
}

impl ThreadAttr {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    pub fn stack(mut self, stack: StackSpec) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn stack_size(self, size: usize) -> Self {
        self.stack(StackSpec::from_size(size))
    }

    pub fn policy(mut self, policy: SchedPolicy) -> Self {
        self.param.policy = policy;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.param.priority = priority;
        self
    }

    /// Take policy and priority from the creating thread instead.
    pub fn inherit_sched(mut self, inherit: bool) -> Self {
        self.inherit_sched = inherit;
        self
    }

    /// Create the thread in the `Suspended` state.
    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn get_scope(&self) -> Scope {
        self.scope
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn get_stack(&self) -> Option<StackSpec> {
        self.stack
    }

    pub fn get_schedparam(&self) -> SchedParam {
        self.param
    }

    pub fn is_inherit_sched(&self) -> bool {
        self.inherit_sched
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Rejects out-of-range priorities and unsupported stacks.
    pub(crate) fn validate(&self) -> ThrResult<()> {
        priority::check_priority(self.param.priority)?;
        if let Some(stack) = self.stack {
            stack.validate()?;
        }
        Ok(())
    }
}

/// Join bookkeeping of a thread.
#[derive(Debug, Default)]
pub(crate) struct JoinState {
    pub(crate) status: Option<ExitStatus>,
    pub(crate) detached: bool,
    /// The thread blocked in `join` on us.
    pub(crate) joiner: Option<Arc<Thread>>,
    /// Someone collected the exit status.
    pub(crate) joined: bool,
}

/// Requests that go from the thread-context to the KSE that runs it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum YieldRequest {
    /// Voluntary yield or exhausted slice: back to the run-queue tail.
    Relinquish,
    /// Preempted with slice remaining: back to the run-queue head.
    Preempted,
    /// The thread put itself into a wait; don't requeue it.
    Block,
    /// The thread is about to block in a system call without a KSE.
    BlockInKernel,
    /// The thread has terminated.
    Exit,
}

/// The shared part of a thread.
pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) rt: Arc<Runtime>,
    /// The KSEG this thread belongs to (for its whole lifetime).
    pub(crate) kseg: Arc<Kseg>,
    pub(crate) carrier: Arc<Carrier>,
    pub(crate) scope: Scope,
    pub(crate) name: Option<String>,
    /// Mirror of `ThreadSched::active_priority` for lock-free readers.
    active_priority: AtomicI32,
    /// Set when signals or a cancellation may need processing at the next
    /// safepoint.
    pub(crate) sigcheck: AtomicBool,
    pub(crate) join: spin::Mutex<JoinState>,
    /// Lookups in progress (join, kill, ...); GC skips referenced threads.
    pub(crate) refcount: AtomicUsize,
    /// The KSE that ran this thread last has seen it exit.
    pub(crate) kse_done: AtomicBool,
    pub(crate) cleanup: spin::Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    pub(crate) specific: spin::Mutex<Vec<SpecificSlot>>,
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Thread#{}", self.id.0)
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Thread) -> bool {
        self.id.0 == other.id.0
    }
}

impl Eq for Thread {}

impl Hash for Thread {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        rt: Arc<Runtime>,
        kseg: Arc<Kseg>,
        carrier: Arc<Carrier>,
        scope: Scope,
        name: Option<String>,
        detached: bool,
    ) -> Thread {
        Thread {
            id,
            rt,
            kseg,
            carrier,
            scope,
            name,
            active_priority: AtomicI32::new(DEFAULT_PRIORITY),
            sigcheck: AtomicBool::new(false),
            join: spin::Mutex::new(JoinState {
                detached,
                ..Default::default()
            }),
            refcount: AtomicUsize::new(0),
            kse_done: AtomicBool::new(false),
            cleanup: spin::Mutex::new(Vec::new()),
            specific: spin::Mutex::new(Vec::new()),
        }
    }

    /// Active priority as last published by the scheduling state.
    pub(crate) fn active_priority(&self) -> Priority {
        self.active_priority.load(Ordering::Acquire)
    }

    /// Hands the KSE back to the scheduler and parks until some KSE resumes
    /// this thread again.
    ///
    /// The caller must already have put the thread into the right queue (or
    /// wait state) and must not hold any lock.
    pub(crate) fn switch(&self, request: YieldRequest) {
        debug_assert!(request != YieldRequest::Exit);
        let kse = Environment::kse();
        kse.post(self.id, request);
        if request == YieldRequest::BlockInKernel {
            return;
        }
        self.wait_dispatch();
    }

    /// Parks the carrier until a KSE dispatches this thread.
    pub(crate) fn wait_dispatch(&self) {
        let kse = self.carrier.wait_resume();
        Environment::set_kse(kse);
    }
}
