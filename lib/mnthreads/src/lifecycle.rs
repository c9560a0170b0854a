// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Creating, joining and terminating threads, and the scheduling calls that
//! operate on thread ids.

use core::time::Duration;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};

use crate::cancel;
use crate::carrier::Carrier;
use crate::error::{ThrError, ThrResult};
use crate::freelist;
use crate::priority::{self, Priority, SchedParam};
use crate::runtime::Runtime;
use crate::scheduler;
use crate::signal::{self, SigSet};
use crate::specific;
use crate::stack::StackSpec;
use crate::threads::{
    ExitStatus, Scope, Thread, ThreadAttr, ThreadFlags, ThreadId, ThreadSched, ThreadState,
    WaitOn, Wakeup, YieldRequest,
};
use crate::tls::Environment;
use crate::wait;

/// Unwinds a thread to its exit path.
///
/// Used as the panic payload by [`exit`] and by cancellation.
pub(crate) struct ThreadExit(pub(crate) ExitStatus);

impl ThreadExit {
    pub(crate) fn status(&self) -> ExitStatus {
        self.0
    }
}

/// Creates a thread that runs `f`.
///
/// The value returned by `f` becomes the thread's exit status. Must be
/// called from a runtime thread.
pub fn create<F>(attr: &ThreadAttr, f: F) -> ThrResult<ThreadId>
where
    F: FnOnce() -> usize + Send + 'static,
{
    let me = Environment::current()?;
    let rt = me.rt.clone();
    attr.validate()?;
    if rt.live_threads() >= rt.config.max_threads {
        warn!("Thread limit of {} reached", rt.config.max_threads);
        return Err(ThrError::ResourceExhausted);
    }
    freelist::maybe_gc(&rt);

    let (param, mask) = {
        let mut st = me.kseg.lock();
        let s = st.sched(me.id);
        let param = if attr.is_inherit_sched() {
            SchedParam {
                policy: s.policy,
                priority: s.base_priority,
            }
        } else {
            attr.get_schedparam()
        };
        (param, s.sig.mask)
    };

    let stack = attr
        .get_stack()
        .unwrap_or_else(|| StackSpec::from_size(rt.config.stack_size));
    let carrier = freelist::carrier_alloc(&rt, &stack)?;
    let (kseg, kse) = match attr.get_scope() {
        Scope::Process => (rt.primary(), None),
        Scope::System => {
            let kse = match freelist::kse_get(&rt) {
                Ok(kse) => kse,
                Err(e) => {
                    freelist::carrier_free(&rt, carrier);
                    return Err(e);
                }
            };
            (freelist::kseg_alloc(&rt), Some(kse))
        }
    };

    let tid = rt.next_tid();
    let thread = Arc::new(Thread::new(
        tid,
        rt.clone(),
        kseg.clone(),
        carrier.clone(),
        attr.get_scope(),
        attr.get_name().map(String::from),
        attr.is_detached(),
    ));
    rt.threads.lock().insert(tid, thread.clone());
    rt.thread_started();
    {
        let mut s = ThreadSched::new(thread.clone(), param, mask);
        if attr.is_suspended() {
            s.flags.insert(ThreadFlags::SUSPEND_REQ);
        }
        kseg.lock().threads.insert(tid, s);
    }

    let t = thread.clone();
    carrier.start(Box::new(move || {
        Environment::set_thread(Some(t.clone()));
        t.wait_dispatch();
        thread_main(t, f);
    }));

    // Suspended threads are parked by the run queue right away.
    kseg.lock().make_runnable(tid, false);
    if let Some(kse) = kse {
        kse.assign(kseg);
    }
    debug!("created {} ({:?}, {:?})", tid, attr.get_scope(), param);

    scheduler::safepoint(&me);
    Ok(tid)
}

/// Creates a thread with default attributes.
pub fn spawn<F>(f: F) -> ThrResult<ThreadId>
where
    F: FnOnce() -> usize + Send + 'static,
{
    create(&ThreadAttr::default(), f)
}

fn thread_main<F>(me: Arc<Thread>, f: F)
where
    F: FnOnce() -> usize,
{
    scheduler::poll_async(&me);
    let status = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => ExitStatus::Exited(v),
        Err(payload) => match payload.downcast::<ThreadExit>() {
            Ok(exit) => exit.status(),
            Err(_) => {
                warn!("{} panicked", me.id);
                ExitStatus::Panicked
            }
        },
    };
    terminate(&me, status);
}

/// Turns the caller of `block_on` into a thread of `rt`.
pub(crate) fn adopt(rt: &Arc<Runtime>) {
    let carrier = Carrier::adopt(rt.next_carrier_id());
    let kseg = rt.primary();
    let tid = rt.next_tid();
    let thread = Arc::new(Thread::new(
        tid,
        rt.clone(),
        kseg.clone(),
        carrier,
        Scope::Process,
        Some(String::from("main")),
        true,
    ));
    rt.threads.lock().insert(tid, thread.clone());
    rt.thread_started();
    {
        let mut st = kseg.lock();
        st.threads.insert(
            tid,
            ThreadSched::new(thread.clone(), SchedParam::default(), SigSet::empty()),
        );
        st.make_runnable(tid, false);
    }
    Environment::set_thread(Some(thread.clone()));
    thread.wait_dispatch();
    trace!("adopted the calling OS thread as {}", tid);
}

/// Terminates the adopted thread at the end of `block_on`.
pub(crate) fn leave(status: ExitStatus) {
    let me = Environment::thread();
    terminate(&me, status);
}

/// The exit path of every thread.
fn terminate(me: &Arc<Thread>, status: ExitStatus) {
    {
        let mut st = me.kseg.lock();
        let s = st.sched(me.id);
        s.flags.insert(ThreadFlags::EXITING);
        s.cancel.enabled = false;
    }

    loop {
        let handler = me.cleanup.lock().pop();
        match handler {
            Some(h) => {
                if panic::catch_unwind(AssertUnwindSafe(h)).is_err() {
                    warn!("{} cleanup handler panicked", me.id);
                }
            }
            None => break,
        }
    }
    specific::run_destructors(me);

    let owned = {
        let mut st = me.kseg.lock();
        st.sched(me.id).owned.len()
    };
    if owned > 0 {
        warn!("{} exits while owning {} mutexes", me.id, owned);
    }

    {
        let mut js = me.join.lock();
        js.status = Some(status);
        if let Some(joiner) = js.joiner.take() {
            let mut st = joiner.kseg.lock();
            let waiting = match st.try_sched(joiner.id) {
                Some(s) => {
                    s.state == ThreadState::Join
                        && matches!(s.wait_on, Some(WaitOn::Join(t)) if t == me.id)
                }
                None => false,
            };
            if waiting {
                st.finish_wait(joiner.id, Wakeup::Event);
            }
        }
    }

    {
        let mut st = me.kseg.lock();
        st.sched(me.id).state = ThreadState::Dead;
    }
    let rt = me.rt.clone();
    rt.thread_terminated();
    freelist::thread_dead(&rt, me.clone());
    debug!("{} terminated: {:?}", me.id, status);

    let kse = Environment::kse();
    kse.post(me.id, YieldRequest::Exit);
    Environment::set_thread(None);
    Environment::clear_kse();
}

/// Waits for a thread to terminate and returns its exit status.
///
/// A thread can be joined once; joining a detached thread, or one somebody
/// else is joining, fails with `InvalidArgument`.
pub fn join(tid: ThreadId) -> ThrResult<ExitStatus> {
    let me = Environment::current()?;
    if tid == me.id {
        return Err(ThrError::Deadlock);
    }
    let rt = me.rt.clone();
    let target = rt.lookup(tid)?;

    let status = loop {
        cancel::test_point(&me);
        {
            let mut js = target.join.lock();
            if js.detached || js.joined {
                return Err(ThrError::InvalidArgument);
            }
            match &js.joiner {
                Some(j) if j.id != me.id => return Err(ThrError::InvalidArgument),
                _ => {}
            }
            if let Some(status) = js.status {
                js.joined = true;
                js.joiner = None;
                break status;
            }
            js.joiner = Some(me.clone());
            me.kseg
                .lock()
                .sleep_on(me.id, ThreadState::Join, WaitOn::Join(tid), None);
        }

        match wait::block(&me) {
            Wakeup::Signaled => signal::process_pending(&me),
            Wakeup::Canceled => {
                let mut js = target.join.lock();
                if matches!(&js.joiner, Some(j) if j.id == me.id) {
                    js.joiner = None;
                }
                drop(js);
                drop(target);
                cancel::act(&me)
            }
            _ => {}
        }
    };

    drop(target);
    freelist::maybe_gc(&rt);
    Ok(status)
}

/// Lets the resources of a thread be reclaimed without joining it.
pub fn detach(tid: ThreadId) -> ThrResult<()> {
    let rt = Runtime::current();
    {
        let t = rt.lookup(tid)?;
        let mut js = t.join.lock();
        if js.detached {
            return Err(ThrError::InvalidArgument);
        }
        js.detached = true;
    }
    freelist::maybe_gc(&rt);
    Ok(())
}

/// Terminates the calling thread with `value` as its exit status.
///
/// Cleanup handlers and thread-specific data destructors run first. Called
/// in the closure passed to `block_on`, the process exits once every other
/// thread has terminated.
///
/// # Panics
/// If not called from a runtime thread.
pub fn exit(value: usize) -> ! {
    assert!(Environment::in_thread(), "exit called outside of a thread");
    panic::resume_unwind(Box::new(ThreadExit(ExitStatus::Exited(value))))
}

/// Id of the calling thread.
pub fn current() -> ThreadId {
    Environment::tid()
}

/// Gives up the KSE; the caller goes to the back of its priority level.
pub fn yield_now() {
    if let Some(me) = Environment::try_thread() {
        me.switch(YieldRequest::Relinquish);
        scheduler::poll_async(&me);
    }
}

/// Blocks the calling thread for `duration`.
///
/// Returns `Interrupted` if a signal handler ran in the meantime. Threads
/// that don't belong to a runtime block their OS thread.
pub fn sleep(duration: Duration) -> ThrResult<()> {
    let me = match Environment::try_thread() {
        Some(me) => me,
        None => {
            std::thread::sleep(duration);
            return Ok(());
        }
    };
    cancel::test_point(&me);
    if duration == Duration::from_secs(0) {
        yield_now();
        return Ok(());
    }

    let deadline = Instant::now() + duration;
    match wait::sleep_until(&me, ThreadState::SleepWait, WaitOn::Sleep, Some(deadline)) {
        Wakeup::Signaled => {
            signal::process_pending(&me);
            Err(ThrError::Interrupted)
        }
        Wakeup::Canceled => cancel::act(&me),
        _ => Ok(()),
    }
}

/// Runs a blocking operation (e.g., a system call) without holding a KSE.
///
/// Other threads of the caller's group keep running in the meantime; the
/// caller queues up again once `f` returns.
pub fn blocking<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let me = match Environment::try_thread() {
        Some(me) => me,
        None => return f(),
    };

    me.kseg
        .lock()
        .sched(me.id)
        .flags
        .insert(ThreadFlags::IN_KERNEL);
    me.switch(YieldRequest::BlockInKernel);

    let r = panic::catch_unwind(AssertUnwindSafe(f));

    {
        let mut st = me.kseg.lock();
        st.completed.push(me.id);
        st.kick();
    }
    me.wait_dispatch();
    match r {
        Ok(v) => {
            scheduler::safepoint(&me);
            v
        }
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// Stops a thread until it is resumed.
///
/// Runnable threads are taken off the run queue; a blocked thread finishes
/// its wait first and is suspended instead of being made runnable; a
/// running thread suspends itself at its next safepoint.
pub fn suspend(tid: ThreadId) -> ThrResult<()> {
    if Environment::try_tid() == Some(tid) {
        return Err(ThrError::Deadlock);
    }
    let rt = Runtime::current();
    let t = rt.lookup(tid)?;
    let mut st = t.kseg.lock();
    let s = st.try_sched(tid).ok_or(ThrError::NoSuchThread)?;
    if s.state == ThreadState::Dead {
        return Err(ThrError::NoSuchThread);
    }
    s.flags.insert(ThreadFlags::SUSPEND_REQ);
    let deferred = s.critical > 0 || s.flags.contains(ThreadFlags::EXITING);
    if !deferred && st.dequeue(tid) {
        let s = st.sched(tid);
        s.state = ThreadState::Suspended;
        trace!("{} suspended while runnable", tid);
    }
    Ok(())
}

/// Resumes a suspended thread (or withdraws a pending suspend request).
pub fn resume(tid: ThreadId) -> ThrResult<()> {
    let rt = Runtime::current();
    let t = rt.lookup(tid)?;
    let mut st = t.kseg.lock();
    let s = st.try_sched(tid).ok_or(ThrError::NoSuchThread)?;
    s.flags.remove(ThreadFlags::SUSPEND_REQ);
    if s.state == ThreadState::Suspended {
        s.state = ThreadState::Running;
        st.make_runnable(tid, false);
    }
    Ok(())
}

/// Current state of a thread.
pub fn state(tid: ThreadId) -> ThrResult<ThreadState> {
    let rt = Runtime::current();
    let t = rt.lookup(tid)?;
    let mut st = t.kseg.lock();
    Ok(st
        .try_sched(tid)
        .map(|s| s.state)
        .unwrap_or(ThreadState::Dead))
}

/// Active (possibly boosted) priority of a thread.
pub fn active_priority(tid: ThreadId) -> ThrResult<Priority> {
    let rt = Runtime::current();
    let t = rt.lookup(tid)?;
    let mut st = t.kseg.lock();
    st.try_sched(tid)
        .map(|s| s.active_priority())
        .ok_or(ThrError::NoSuchThread)
}

/// Scheduling policy and base priority of a thread.
pub fn schedparam(tid: ThreadId) -> ThrResult<SchedParam> {
    let rt = Runtime::current();
    let t = rt.lookup(tid)?;
    let mut st = t.kseg.lock();
    st.try_sched(tid)
        .map(|s| SchedParam {
            policy: s.policy,
            priority: s.base_priority,
        })
        .ok_or(ThrError::NoSuchThread)
}

/// Changes policy and base priority of a thread.
///
/// The thread moves inside whatever queue it is in; if it waits on a
/// priority-inheritance mutex the new priority propagates to the owner.
pub fn set_schedparam(tid: ThreadId, param: SchedParam) -> ThrResult<()> {
    priority::check_priority(param.priority)?;
    let rt = Runtime::current();
    let t = rt.lookup(tid)?;

    let waiting_on = {
        let mut st = t.kseg.lock();
        let s = st.try_sched(tid).ok_or(ThrError::NoSuchThread)?;
        s.policy = param.policy;
        s.base_priority = param.priority;
        let old = s.update_active_priority();
        let moved = old != s.active_priority();
        let on = match s.state {
            ThreadState::MutexWait | ThreadState::CondWait => s.wait_on.clone(),
            _ => None,
        };
        // A new policy can change the level even if the priority didn't.
        st.requeue(tid);
        if moved {
            trace!("{} priority {} -> {}", tid, old, param.priority);
        }
        on
    };

    match waiting_on {
        Some(WaitOn::Mutex(m)) => crate::mutex::reposition_waiter(&m, &t),
        Some(WaitOn::Cond(c)) => crate::condvar::reposition_waiter(&c, tid),
        _ => {}
    }
    drop(t);

    if let Some(me) = Environment::try_thread() {
        scheduler::safepoint(&me);
    }
    Ok(())
}

/// Sets the number of KSEs of the primary group.
///
/// Growing takes effect immediately, shrinking once the runtime restarts.
pub fn set_concurrency(level: usize) -> ThrResult<()> {
    if level == 0 {
        return Err(ThrError::InvalidArgument);
    }
    Runtime::current().set_concurrency(level)
}

/// The configured number of KSEs of the primary group.
pub fn concurrency() -> usize {
    Runtime::current().concurrency()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crossbeam_queue::ArrayQueue;

    fn runtime() -> Arc<Runtime> {
        let _r = env_logger::try_init();
        let mut config = Config::default();
        config.concurrency = 2;
        Runtime::new(config)
    }

    #[test]
    fn spawn_and_join() {
        let rt = runtime();
        let st = rt.block_on(|| {
            let t = spawn(|| 7).expect("Can't spawn");
            join(t)
        });
        assert_eq!(st, Ok(ExitStatus::Exited(7)));
    }

    #[test]
    fn exit_and_panic_status() {
        let rt = runtime();
        rt.block_on(|| {
            let a = spawn(|| exit(3)).expect("Can't spawn");
            let b = spawn(|| panic!("expected")).expect("Can't spawn");
            assert_eq!(join(a), Ok(ExitStatus::Exited(3)));
            assert_eq!(join(b), Ok(ExitStatus::Panicked));
        });
    }

    #[test]
    fn join_errors() {
        let rt = runtime();
        rt.block_on(|| {
            assert_eq!(join(current()), Err(ThrError::Deadlock));
            assert_eq!(join(ThreadId(999)), Err(ThrError::NoSuchThread));

            let attr = ThreadAttr::new().detached(true);
            let d = create(&attr, || 0).expect("Can't create");
            assert_eq!(join(d).err(), Some(ThrError::InvalidArgument));

            let t = spawn(|| 1).expect("Can't spawn");
            assert_eq!(detach(t), Ok(()));
            assert_eq!(detach(t).err(), Some(ThrError::InvalidArgument));
        });
    }

    #[test]
    fn yield_alternates_equal_priorities() {
        let rt = Runtime::new(Config {
            concurrency: 1,
            ..Default::default()
        });
        let log: Arc<ArrayQueue<usize>> = Arc::new(ArrayQueue::new(16));
        rt.block_on(|| {
            let mut tids = Vec::new();
            for i in 0..2 {
                let log = log.clone();
                tids.push(
                    spawn(move || {
                        for _ in 0..3 {
                            assert!(log.push(i).is_ok());
                            yield_now();
                        }
                        0
                    })
                    .expect("Can't spawn"),
                );
            }
            for t in tids {
                join(t).expect("Can't join");
            }
        });
        let order: Vec<usize> = core::iter::from_fn(|| log.pop()).collect();
        assert_eq!(order, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn sleep_waits_at_least_duration() {
        let rt = runtime();
        rt.block_on(|| {
            let start = Instant::now();
            assert_eq!(sleep(Duration::from_millis(20)), Ok(()));
            assert!(start.elapsed() >= Duration::from_millis(20));
        });
    }

    #[test]
    fn blocking_section_releases_kse() {
        let rt = Runtime::new(Config {
            concurrency: 1,
            ..Default::default()
        });
        let seen: Arc<ArrayQueue<&'static str>> = Arc::new(ArrayQueue::new(4));
        rt.block_on(|| {
            let s = seen.clone();
            let t = spawn(move || {
                assert!(s.push("other").is_ok());
                0
            })
            .expect("Can't spawn");
            let v = blocking(|| {
                std::thread::sleep(Duration::from_millis(30));
                5
            });
            assert_eq!(v, 5);
            assert!(seen.push("main").is_ok());
            join(t).expect("Can't join");
        });
        assert_eq!(seen.pop(), Some("other"));
        assert_eq!(seen.pop(), Some("main"));
    }

    #[test]
    fn suspend_and_resume() {
        let rt = runtime();
        rt.block_on(|| {
            assert_eq!(suspend(current()), Err(ThrError::Deadlock));
            let attr = ThreadAttr::new().suspended(true);
            let t = create(&attr, || 9).expect("Can't create");
            assert_eq!(state(t), Ok(ThreadState::Suspended));
            resume(t).expect("Can't resume");
            assert_eq!(join(t), Ok(ExitStatus::Exited(9)));
        });
    }

    #[test]
    fn schedparam_roundtrip() {
        let rt = runtime();
        rt.block_on(|| {
            let me = current();
            let p = SchedParam {
                policy: crate::priority::SchedPolicy::RoundRobin,
                priority: 20,
            };
            set_schedparam(me, p).expect("Can't set schedparam");
            assert_eq!(schedparam(me), Ok(p));
            assert_eq!(active_priority(me), Ok(20));
            assert_eq!(
                set_schedparam(
                    me,
                    SchedParam {
                        priority: 500,
                        ..p
                    }
                ),
                Err(ThrError::InvalidArgument)
            );
        });
    }

    #[test]
    fn system_scope_gets_own_group() {
        let rt = runtime();
        rt.block_on(|| {
            let attr = ThreadAttr::new().scope(Scope::System);
            let t = create(&attr, || {
                let me = Environment::thread();
                assert!(!me.kseg.primary);
                let n = me.kseg.lock().kses.len();
                n
            })
            .expect("Can't create");
            assert_eq!(join(t), Ok(ExitStatus::Exited(1)));
        });
    }
}
