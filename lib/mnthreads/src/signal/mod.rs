// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Signals between user threads.
//!
//! Dispositions and the process-wide pending set live in the runtime, masks
//! and thread-pending sets in each thread's scheduling state. Delivery to a
//! blocked thread first backs it out of its wait; the handler then runs on
//! the target thread the next time it is in the runtime (see
//! [`process_pending`]).
//!
//! Signal numbers follow the host (`libc::SIGUSR1`, ...), but nothing is
//! sent through the OS unless a signal is forwarded with
//! [`forward_os_signal`] or its default action is taken.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use log::trace;

use crate::cancel;
use crate::error::{ThrError, ThrResult};
use crate::runtime::Runtime;
use crate::scheduler;
use crate::threads::{Thread, ThreadFlags, ThreadId, ThreadState, WaitOn, Wakeup};
use crate::tls::Environment;
use crate::wait;

mod deliver;
pub(crate) mod os;

pub use os::forward_os_signal;

/// A signal number.
pub type Signal = i32;

/// One more than the largest signal number.
pub const NSIG: usize = 65;

/// A set of signals.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SigSet(u64);

fn bit(sig: Signal) -> u64 {
    1u64 << (sig as u64 - 1)
}

/// Is `sig` a valid signal number?
fn check(sig: Signal) -> ThrResult<Signal> {
    if sig > 0 && (sig as usize) < NSIG {
        Ok(sig)
    } else {
        Err(ThrError::InvalidArgument)
    }
}

/// Signals that can be neither caught nor blocked.
fn unblockable(sig: Signal) -> bool {
    sig == libc::SIGKILL || sig == libc::SIGSTOP
}

impl SigSet {
    pub const fn empty() -> SigSet {
        SigSet(0)
    }

    pub const fn full() -> SigSet {
        SigSet(u64::MAX)
    }

    pub(crate) const fn from_bits(bits: u64) -> SigSet {
        SigSet(bits)
    }

    pub(crate) const fn bits(&self) -> u64 {
        self.0
    }

    /// Builds a set from signal numbers; invalid numbers are ignored.
    pub fn from_signals(sigs: &[Signal]) -> SigSet {
        sigs.iter().fold(SigSet::empty(), |set, &s| set.with(s))
    }

    pub fn with(mut self, sig: Signal) -> SigSet {
        self.insert(sig);
        self
    }

    pub fn insert(&mut self, sig: Signal) {
        if check(sig).is_ok() {
            self.0 |= bit(sig);
        }
    }

    pub fn remove(&mut self, sig: Signal) {
        if check(sig).is_ok() {
            self.0 &= !bit(sig);
        }
    }

    pub fn contains(&self, sig: Signal) -> bool {
        check(sig).is_ok() && self.0 & bit(sig) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(&self, other: SigSet) -> SigSet {
        SigSet(self.0 | other.0)
    }

    pub fn intersection(&self, other: SigSet) -> SigSet {
        SigSet(self.0 & other.0)
    }

    pub fn difference(&self, other: SigSet) -> SigSet {
        SigSet(self.0 & !other.0)
    }

    /// The lowest signal number in the set.
    pub fn lowest(&self) -> Option<Signal> {
        match self.0 {
            0 => None,
            bits => Some(bits.trailing_zeros() as Signal + 1),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Signal> {
        let bits = self.0;
        (1..NSIG as Signal).filter(move |s| bits & bit(*s) != 0)
    }

    /// The set without the signals that can't be blocked.
    pub(crate) fn without_unblockable(&self) -> SigSet {
        let mut s = *self;
        s.remove(libc::SIGKILL);
        s.remove(libc::SIGSTOP);
        s
    }
}

impl fmt::Debug for SigSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Where a signal came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigCode {
    /// `kill` or `raise_process`.
    User,
    /// `sigqueue`, carries a value.
    Queue,
    /// Forwarded from the OS.
    Kernel,
}

/// Information about one signal occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: Signal,
    pub code: SigCode,
    pub sender: Option<ThreadId>,
    pub value: usize,
}

impl SigInfo {
    pub(crate) fn new(signo: Signal, code: SigCode) -> SigInfo {
        SigInfo {
            signo,
            code,
            sender: Environment::try_tid(),
            value: 0,
        }
    }
}

/// A signal handler.
pub type HandlerFn = dyn Fn(&SigInfo) + Send + Sync + 'static;

#[derive(Clone)]
pub enum SigHandler {
    Default,
    Ignore,
    Handler(Arc<HandlerFn>),
}

impl fmt::Debug for SigHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SigHandler::Default => write!(f, "Default"),
            SigHandler::Ignore => write!(f, "Ignore"),
            SigHandler::Handler(h) => write!(f, "Handler({:p})", Arc::as_ptr(h)),
        }
    }
}

bitflags! {
    pub struct SaFlags: u32 {
        /// Reset the disposition to default when the handler is entered.
        const RESETHAND = 0b01;
        /// Don't block the signal while its handler runs.
        const NODEFER = 0b10;
    }
}

/// Disposition of a signal.
#[derive(Clone, Debug)]
pub struct SigAction {
    pub handler: SigHandler,
    /// Additionally blocked while the handler runs.
    pub mask: SigSet,
    pub flags: SaFlags,
}

impl Default for SigAction {
    fn default() -> Self {
        SigAction {
            handler: SigHandler::Default,
            mask: SigSet::empty(),
            flags: SaFlags::empty(),
        }
    }
}

impl SigAction {
    /// Runs `f` when the signal is delivered.
    pub fn handler<F>(f: F) -> SigAction
    where
        F: Fn(&SigInfo) + Send + Sync + 'static,
    {
        SigAction {
            handler: SigHandler::Handler(Arc::new(f)),
            ..Default::default()
        }
    }

    pub fn ignore() -> SigAction {
        SigAction {
            handler: SigHandler::Ignore,
            ..Default::default()
        }
    }

    pub fn mask(mut self, mask: SigSet) -> SigAction {
        self.mask = mask;
        self
    }

    pub fn flags(mut self, flags: SaFlags) -> SigAction {
        self.flags = flags;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigmaskHow {
    Block,
    Unblock,
    SetMask,
}

/// What happens to a signal that has the default disposition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
    Continue,
}

pub(crate) fn default_action(sig: Signal) -> DefaultAction {
    match sig {
        libc::SIGCHLD | libc::SIGURG | libc::SIGWINCH => DefaultAction::Ignore,
        libc::SIGCONT => DefaultAction::Continue,
        libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU => DefaultAction::Stop,
        _ => DefaultAction::Terminate,
    }
}

/// Process-wide signal state (the signal lock).
pub(crate) struct ProcessSignals {
    actions: Vec<SigAction>,
    pending: SigSet,
    info: Vec<Option<SigInfo>>,
}

impl ProcessSignals {
    pub(crate) fn new() -> Self {
        ProcessSignals {
            actions: vec![SigAction::default(); NSIG],
            pending: SigSet::empty(),
            info: vec![None; NSIG],
        }
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending = SigSet::empty();
        self.info.iter_mut().for_each(|i| *i = None);
    }

    pub(crate) fn action(&self, sig: Signal) -> &SigAction {
        &self.actions[sig as usize]
    }

    /// Would delivering `sig` have no effect?
    pub(crate) fn ignored(&self, sig: Signal) -> bool {
        match self.action(sig).handler {
            SigHandler::Ignore => true,
            SigHandler::Default => matches!(
                default_action(sig),
                DefaultAction::Ignore | DefaultAction::Continue
            ),
            SigHandler::Handler(_) => false,
        }
    }

    fn add_pending(&mut self, info: SigInfo) {
        self.pending.insert(info.signo);
        self.info[info.signo as usize] = Some(info);
    }

    /// Takes a process-pending signal out of `set`.
    fn take_pending(&mut self, set: SigSet) -> Option<SigInfo> {
        let sig = self.pending.intersection(set).lowest()?;
        self.pending.remove(sig);
        Some(
            self.info[sig as usize]
                .take()
                .unwrap_or_else(|| SigInfo::new(sig, SigCode::Kernel)),
        )
    }
}

/// Examines and changes the disposition of `sig`; returns the old one.
pub fn sigaction(sig: Signal, action: Option<SigAction>) -> ThrResult<SigAction> {
    check(sig)?;
    let rt = Runtime::current();
    let mut sigs = rt.signals.lock();
    let old = sigs.actions[sig as usize].clone();
    if let Some(action) = action {
        if unblockable(sig) {
            return Err(ThrError::InvalidArgument);
        }
        sigs.actions[sig as usize] = action;
        if sigs.ignored(sig) {
            // Pending instances of an ignored signal are discarded.
            sigs.pending.remove(sig);
            sigs.info[sig as usize] = None;
            drop(sigs);
            for t in rt.all_threads() {
                let mut st = t.kseg.lock();
                if let Some(s) = st.try_sched(t.id) {
                    s.sig.pending.remove(sig);
                    s.sig.info[sig as usize] = None;
                }
            }
        }
    }
    Ok(old)
}

/// Examines and changes the signal mask of the calling thread; returns the
/// old mask.
pub fn sigmask(how: SigmaskHow, set: Option<SigSet>) -> ThrResult<SigSet> {
    let me = Environment::current()?;
    let old = {
        let mut st = me.kseg.lock();
        let s = st.sched(me.id);
        let old = s.sig.mask;
        if let Some(set) = set {
            let new = match how {
                SigmaskHow::Block => old.union(set),
                SigmaskHow::Unblock => old.difference(set),
                SigmaskHow::SetMask => set,
            };
            s.set_sigmask(new);
        }
        old
    };
    // Unblocked signals that are pending run right away.
    process_pending(&me);
    Ok(old)
}

/// Signals pending for the calling thread or the process.
pub fn sigpending() -> ThrResult<SigSet> {
    let me = Environment::current()?;
    let sigs = me.rt.signals.lock();
    let mut st = me.kseg.lock();
    Ok(st.sched(me.id).sig.pending.union(sigs.pending))
}

fn send(tid: ThreadId, info: SigInfo) -> ThrResult<()> {
    let rt = Runtime::current();
    let t = rt.lookup(tid)?;
    deliver::to_thread(&rt, &t, info);
    drop(t);
    if let Some(me) = Environment::try_thread() {
        scheduler::poll_async(&me);
    }
    Ok(())
}

/// Sends `sig` to a thread. Signal 0 only checks that the thread exists.
pub fn kill(tid: ThreadId, sig: Signal) -> ThrResult<()> {
    if sig == 0 {
        return Runtime::current().lookup(tid).map(|_| ());
    }
    check(sig)?;
    send(tid, SigInfo::new(sig, SigCode::User))
}

/// Sends `sig` with an accompanying value to a thread.
pub fn sigqueue(tid: ThreadId, sig: Signal, value: usize) -> ThrResult<()> {
    check(sig)?;
    let info = SigInfo {
        value,
        ..SigInfo::new(sig, SigCode::Queue)
    };
    send(tid, info)
}

/// Sends `sig` to the process; some thread that doesn't block it handles it.
pub fn raise_process(sig: Signal) -> ThrResult<()> {
    check(sig)?;
    let rt = Runtime::current();
    deliver::to_process(&rt, SigInfo::new(sig, SigCode::User));
    if let Some(me) = Environment::try_thread() {
        scheduler::poll_async(&me);
    }
    Ok(())
}

/// Waits for a signal in `set`, consuming it without running a handler.
pub fn sigwait(set: SigSet) -> ThrResult<Signal> {
    sigwait_until(set, None).map(|i| i.signo)
}

/// Like [`sigwait`] but returns the full signal information.
pub fn sigwaitinfo(set: SigSet) -> ThrResult<SigInfo> {
    sigwait_until(set, None)
}

/// Like [`sigwaitinfo`] but gives up with `TimedOut` after `timeout`.
///
/// Returns `Interrupted` if a handler for another signal ran.
pub fn sigtimedwait(set: SigSet, timeout: Duration) -> ThrResult<SigInfo> {
    sigwait_until(set, Some(Instant::now() + timeout))
}

fn sigwait_until(set: SigSet, deadline: Option<Instant>) -> ThrResult<SigInfo> {
    let me = Environment::current()?;
    let set = set.without_unblockable();
    if set.is_empty() {
        return Err(ThrError::InvalidArgument);
    }

    loop {
        cancel::test_point(&me);
        {
            let mut sigs = me.rt.signals.lock();
            let mut st = me.kseg.lock();
            let s = st.sched(me.id);
            if let Some(sig) = s.sig.pending.intersection(set).lowest() {
                s.sig.pending.remove(sig);
                let info = s.sig.info[sig as usize].take();
                return Ok(info.unwrap_or_else(|| SigInfo::new(sig, SigCode::Kernel)));
            }
            if let Some(info) = sigs.take_pending(set) {
                return Ok(info);
            }
            if matches!(deadline, Some(d) if d <= Instant::now()) {
                return Err(ThrError::TimedOut);
            }
            s.sig.waitset = set;
            s.sig.caught = None;
            st.sleep_on(me.id, ThreadState::SigWait, WaitOn::SigWait, deadline);
        }

        let w = wait::block(&me);
        let caught = {
            let mut st = me.kseg.lock();
            let s = st.sched(me.id);
            s.sig.waitset = SigSet::empty();
            s.sig.caught.take()
        };
        if let Some(info) = caught {
            trace!("{} sigwait returns {}", me.id, info.signo);
            return Ok(info);
        }
        match w {
            Wakeup::TimedOut => return Err(ThrError::TimedOut),
            Wakeup::Canceled => cancel::act(&me),
            Wakeup::Signaled => {
                process_pending(&me);
                if deadline.is_some() {
                    return Err(ThrError::Interrupted);
                }
            }
            _ => {}
        }
    }
}

/// Replaces the signal mask with `mask` and waits until a handler ran.
///
/// Always returns `Interrupted`; the old mask is restored.
pub fn sigsuspend(mask: SigSet) -> ThrResult<()> {
    let me = Environment::current()?;
    cancel::test_point(&me);
    let saved = {
        let mut st = me.kseg.lock();
        let s = st.sched(me.id);
        let saved = s.sig.mask;
        s.set_sigmask(mask);
        saved
    };
    let restore = |me: &Arc<Thread>| {
        let mut st = me.kseg.lock();
        st.sched(me.id).set_sigmask(saved);
    };

    loop {
        let ready = {
            let sigs = me.rt.signals.lock();
            let mut st = me.kseg.lock();
            let s = st.sched(me.id);
            let ready = !s.sig.pending.difference(s.sig.mask).is_empty()
                || !sigs.pending.difference(s.sig.mask).is_empty();
            if !ready {
                st.sleep_on(me.id, ThreadState::SigSuspend, WaitOn::SigSuspend, None);
            }
            ready
        };
        if ready {
            process_pending(&me);
            break;
        }
        match wait::block(&me) {
            Wakeup::Signaled => {
                process_pending(&me);
                break;
            }
            Wakeup::Canceled => {
                restore(&me);
                cancel::act(&me)
            }
            _ => {}
        }
    }
    restore(&me);
    Err(ThrError::Interrupted)
}

/// What the handler wrapper does with the next deliverable signal.
enum Next {
    Drop,
    Default(Signal),
    Run(Arc<HandlerFn>, SigInfo, SigSet),
}

/// Runs the handlers of all deliverable pending signals of the caller.
///
/// For each signal the handler runs with the action's mask (and the signal
/// itself, unless `NODEFER`) blocked; the mask is restored afterwards.
pub(crate) fn process_pending(me: &Arc<Thread>) {
    loop {
        let next = {
            let mut sigs = me.rt.signals.lock();
            let mut st = me.kseg.lock();
            let s = st.sched(me.id);
            s.flags.remove(ThreadFlags::SIG_BOOST);
            let mask = s.sig.mask;

            let info = match s.sig.pending.difference(mask).lowest() {
                Some(sig) => {
                    s.sig.pending.remove(sig);
                    s.sig.info[sig as usize]
                        .take()
                        .unwrap_or_else(|| SigInfo::new(sig, SigCode::Kernel))
                }
                None => match sigs.take_pending(SigSet::full().difference(mask)) {
                    Some(info) => info,
                    None => break,
                },
            };

            let sig = info.signo;
            let action = sigs.actions[sig as usize].clone();
            match action.handler {
                SigHandler::Ignore => Next::Drop,
                SigHandler::Default => {
                    if sigs.ignored(sig) {
                        Next::Drop
                    } else {
                        Next::Default(sig)
                    }
                }
                SigHandler::Handler(h) => {
                    let saved = s.sig.mask;
                    let mut m = saved.union(action.mask);
                    if !action.flags.contains(SaFlags::NODEFER) {
                        m.insert(sig);
                    }
                    s.set_sigmask(m);
                    if action.flags.contains(SaFlags::RESETHAND) {
                        sigs.actions[sig as usize] = SigAction::default();
                    }
                    Next::Run(h, info, saved)
                }
            }
        };

        match next {
            Next::Drop => continue,
            Next::Default(sig) => os::default_action(sig),
            Next::Run(h, info, saved) => {
                trace!("{} runs handler for {}", me.id, info.signo);
                h(&info);
                let mut st = me.kseg.lock();
                st.sched(me.id).set_sigmask(saved);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lifecycle::{self, join, spawn};
    use crate::threads::ExitStatus;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sigset_ops() {
        let s = SigSet::from_signals(&[libc::SIGUSR1, libc::SIGUSR2, 0, 99]);
        assert!(s.contains(libc::SIGUSR1));
        assert!(!s.contains(libc::SIGINT));
        assert_eq!(s.iter().count(), 2);
        assert_eq!(s.lowest(), Some(libc::SIGUSR1.min(libc::SIGUSR2)));
        let k = s.with(libc::SIGKILL).without_unblockable();
        assert_eq!(k, s);
        assert!(s.difference(s).is_empty());
        assert_eq!(SigSet::empty().lowest(), None);
        assert_eq!(SigSet::from_signals(&[64]).lowest(), Some(64));
    }

    #[test]
    fn kill_runs_handler_on_target() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config {
            concurrency: 2,
            ..Default::default()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        rt.block_on(move || {
            sigaction(
                libc::SIGUSR1,
                Some(SigAction::handler(move |info| {
                    assert_eq!(info.signo, libc::SIGUSR1);
                    assert_eq!(info.value, 7);
                    h.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

            let t = spawn(|| match lifecycle::sleep(Duration::from_secs(10)) {
                Err(ThrError::Interrupted) => 1,
                _ => 0,
            })
            .unwrap();
            while lifecycle::state(t) != Ok(ThreadState::SleepWait) {
                lifecycle::yield_now();
            }
            sigqueue(t, libc::SIGUSR1, 7).unwrap();
            assert_eq!(join(t), Ok(ExitStatus::Exited(1)));
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn masked_signals_stay_pending() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        rt.block_on(move || {
            sigaction(
                libc::SIGUSR2,
                Some(SigAction::handler(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
            let me = lifecycle::current();
            sigmask(SigmaskHow::Block, Some(SigSet::empty().with(libc::SIGUSR2))).unwrap();
            kill(me, libc::SIGUSR2).unwrap();
            assert!(sigpending().unwrap().contains(libc::SIGUSR2));
            assert_eq!(hits.load(Ordering::SeqCst), 0);

            let old = sigmask(SigmaskHow::Unblock, Some(SigSet::empty().with(libc::SIGUSR2)))
                .unwrap();
            assert!(old.contains(libc::SIGUSR2));
            assert!(sigpending().unwrap().is_empty());
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn ignored_signals_are_dropped() {
        let rt = Runtime::new(Config::default());
        rt.block_on(|| {
            sigaction(libc::SIGUSR1, Some(SigAction::ignore())).unwrap();
            let me = lifecycle::current();
            kill(me, libc::SIGUSR1).unwrap();
            assert!(sigpending().unwrap().is_empty());
            assert_eq!(
                sigaction(libc::SIGKILL, Some(SigAction::ignore())).err(),
                Some(ThrError::InvalidArgument)
            );
            assert_eq!(kill(me, 0), Ok(()));
            assert_eq!(kill(me, 100), Err(ThrError::InvalidArgument));
        });
    }

    #[test]
    fn sigwait_consumes_without_handler() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config {
            concurrency: 2,
            ..Default::default()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        rt.block_on(move || {
            sigaction(
                libc::SIGUSR1,
                Some(SigAction::handler(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
            let set = SigSet::empty().with(libc::SIGUSR1);
            sigmask(SigmaskHow::Block, Some(set)).unwrap();
            let t = spawn(move || sigwait(set).unwrap() as usize).unwrap();
            while lifecycle::state(t) != Ok(ThreadState::SigWait) {
                lifecycle::yield_now();
            }
            raise_process(libc::SIGUSR1).unwrap();
            assert_eq!(join(t), Ok(ExitStatus::Exited(libc::SIGUSR1 as usize)));

            assert_eq!(
                sigtimedwait(set, Duration::from_millis(5)).err(),
                Some(ThrError::TimedOut)
            );
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sigsuspend_returns_interrupted() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config {
            concurrency: 2,
            ..Default::default()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        rt.block_on(move || {
            sigaction(
                libc::SIGUSR2,
                Some(SigAction::handler(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
            let set = SigSet::empty().with(libc::SIGUSR2);
            sigmask(SigmaskHow::Block, Some(set)).unwrap();
            let me = lifecycle::current();
            let t = spawn(move || {
                while lifecycle::state(me) != Ok(ThreadState::SigSuspend) {
                    lifecycle::yield_now();
                }
                kill(me, libc::SIGUSR2).unwrap();
                0
            })
            .unwrap();
            assert_eq!(sigsuspend(SigSet::empty()), Err(ThrError::Interrupted));
            // The old mask is back in place.
            assert!(sigmask(SigmaskHow::Block, None).unwrap().contains(libc::SIGUSR2));
            join(t).unwrap();
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
