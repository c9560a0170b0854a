// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The process-wide context of the scheduler.

use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;

use crate::carrier::Carrier;
use crate::config::Config;
use crate::error::{ThrError, ThrResult};
use crate::freelist::{self, FreeLists};
use crate::kse::KseId;
use crate::kseg::Kseg;
use crate::lifecycle::{self, ThreadExit};
use crate::signal::ProcessSignals;
use crate::specific::KeyTable;
use crate::threads::{ExitStatus, Thread, ThreadId, ThreadSched};
use crate::tls::Environment;

static GLOBAL: OnceCell<Arc<Runtime>> = OnceCell::new();

/// A counted reference to a thread found by id.
///
/// The garbage collector leaves threads alone while such references exist.
pub(crate) struct ThreadRef(Arc<Thread>);

impl Deref for ThreadRef {
    type Target = Arc<Thread>;

    fn deref(&self) -> &Arc<Thread> {
        &self.0
    }
}

impl Drop for ThreadRef {
    fn drop(&mut self) {
        self.0.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The scheduler state of a process: its KSEGs, threads, free lists and
/// signal dispositions.
pub struct Runtime {
    pub(crate) config: Config,
    /// Time base for per-KSE timestamps.
    pub(crate) epoch: Instant,
    /// Incremented whenever the KSEs of the primary group should go away.
    session: AtomicUsize,
    /// Are the primary KSEs of the current session started?
    running: AtomicBool,
    /// Incremented by `reinit_after_fork`.
    fork_generation: AtomicUsize,
    next_tid: AtomicUsize,
    next_kse: AtomicUsize,
    next_kseg: AtomicUsize,
    next_carrier: AtomicUsize,
    primary: spin::Mutex<Arc<Kseg>>,
    /// All threads that have not been collected yet (the thread-list lock).
    pub(crate) threads: spin::Mutex<HashMap<ThreadId, Arc<Thread>>>,
    /// Free lists (the allocator lock).
    pub(crate) alloc: spin::Mutex<FreeLists>,
    pub(crate) signals: spin::Mutex<ProcessSignals>,
    pub(crate) keys: spin::Mutex<KeyTable>,
    /// Last value passed to `set_concurrency`.
    concurrency: AtomicUsize,
    /// Threads that haven't terminated.
    live: AtomicUsize,
    /// Dead threads waiting for collection.
    pub(crate) dead: AtomicUsize,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("session", &self.session.load(Ordering::Relaxed))
            .field("live", &self.live.load(Ordering::Relaxed))
            .field("dead", &self.dead.load(Ordering::Relaxed))
            .finish()
    }
}

impl Runtime {
    pub fn new(config: Config) -> Arc<Runtime> {
        let rt = Runtime {
            concurrency: AtomicUsize::new(config.concurrency),
            config,
            epoch: Instant::now(),
            session: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            fork_generation: AtomicUsize::new(0),
            next_tid: AtomicUsize::new(1),
            next_kse: AtomicUsize::new(1),
            next_kseg: AtomicUsize::new(2),
            next_carrier: AtomicUsize::new(1),
            primary: spin::Mutex::new(Arc::new(Kseg::new(1, true))),
            threads: spin::Mutex::new(HashMap::with_capacity(64)),
            alloc: spin::Mutex::new(FreeLists::default()),
            signals: spin::Mutex::new(ProcessSignals::new()),
            keys: spin::Mutex::new(KeyTable::new()),
            live: AtomicUsize::new(0),
            dead: AtomicUsize::new(0),
        };
        Arc::new(rt)
    }

    /// The process-wide runtime, configured from the environment.
    pub fn global() -> &'static Arc<Runtime> {
        GLOBAL.get_or_init(|| Runtime::new(Config::from_env()))
    }

    /// The runtime of the calling thread, or the global one.
    pub(crate) fn current() -> Arc<Runtime> {
        match Environment::try_thread() {
            Some(t) => t.rt.clone(),
            None => Runtime::global().clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn session(&self) -> usize {
        self.session.load(Ordering::Acquire)
    }

    pub fn fork_generation(&self) -> usize {
        self.fork_generation.load(Ordering::Acquire)
    }

    pub(crate) fn primary(&self) -> Arc<Kseg> {
        self.primary.lock().clone()
    }

    pub(crate) fn next_tid(&self) -> ThreadId {
        ThreadId(self.next_tid.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_kse_id(&self) -> KseId {
        KseId(self.next_kse.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_kseg_id(&self) -> usize {
        self.next_kseg.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_carrier_id(&self) -> usize {
        self.next_carrier.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of threads that haven't terminated yet.
    pub fn live_threads(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Number of threads that still have a thread record (live or awaiting
    /// collection).
    pub fn thread_records(&self) -> usize {
        self.threads.lock().len()
    }

    pub(crate) fn thread_started(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn thread_terminated(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Finds a thread that hasn't been collected.
    pub(crate) fn lookup(&self, tid: ThreadId) -> ThrResult<ThreadRef> {
        let threads = self.threads.lock();
        let t = threads.get(&tid).ok_or(ThrError::NoSuchThread)?;
        t.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(ThreadRef(t.clone()))
    }

    /// Snapshot of all threads.
    pub(crate) fn all_threads(&self) -> Vec<Arc<Thread>> {
        let mut v: Vec<Arc<Thread>> = self.threads.lock().values().cloned().collect();
        v.sort_by_key(|t| t.id);
        v
    }

    pub(crate) fn forget_kse(&self, id: KseId) {
        self.alloc.lock().all_kses.retain(|k| k.id != id);
    }

    /// Number of KSEs (running, idle or cached).
    pub fn kse_count(&self) -> usize {
        self.alloc.lock().all_kses.len()
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Acquire)
    }

    /// Grows the primary group to `level` KSEs.
    ///
    /// Shrinking only records the new level; surplus KSEs stay until the
    /// session ends.
    pub(crate) fn set_concurrency(self: &Arc<Self>, level: usize) -> ThrResult<()> {
        let old = self.concurrency.swap(level, Ordering::AcqRel);
        if !self.running.load(Ordering::Acquire) || level <= old {
            return Ok(());
        }
        let primary = self.primary();
        for _ in old..level {
            freelist::kse_alloc(self, &primary)?;
        }
        info!("concurrency {} -> {}", old, level);
        Ok(())
    }

    /// Starts the KSEs of the primary group.
    fn start(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(level) = self.config.log_filter {
            log::set_max_level(level);
        }

        let primary = self.primary();
        let n = self.concurrency().max(1);
        for _ in 0..n {
            if let Err(e) = freelist::kse_alloc(self, &primary) {
                fatal!("Can't start the primary KSEs: {}", e);
            }
        }
        debug!("runtime started with {} KSEs", n);
    }

    /// Runs `f` as the initial thread of this runtime.
    ///
    /// The calling OS thread is adopted as a user thread for the duration of
    /// `f`. When `f` returns, the runtime shuts down: idle KSEs and cached
    /// carriers exit. A panic in `f` is propagated after shutdown. If `f`
    /// calls [`crate::exit`], the process exits once all other threads have
    /// terminated.
    ///
    /// # Panics
    /// If called from a thread that belongs to a runtime.
    pub fn block_on<F, R>(self: &Arc<Self>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        assert!(
            !Environment::in_thread(),
            "block_on must not be called from a runtime thread"
        );
        self.start();
        lifecycle::adopt(self);

        let r = panic::catch_unwind(AssertUnwindSafe(f));
        match r {
            Ok(v) => {
                lifecycle::leave(ExitStatus::Exited(0));
                self.shutdown();
                v
            }
            Err(payload) => match payload.downcast::<ThreadExit>() {
                Ok(exit) => {
                    lifecycle::leave(exit.status());
                    while self.live_threads() > 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    self.shutdown();
                    std::process::exit(0)
                }
                Err(payload) => {
                    lifecycle::leave(ExitStatus::Panicked);
                    self.shutdown();
                    panic::resume_unwind(payload)
                }
            },
        }
    }

    /// Ends the current session: idle primary KSEs, cached KSEs and cached
    /// carriers exit.
    ///
    /// Threads that are still alive stay where they are and continue if
    /// `block_on` is called again.
    pub fn shutdown(&self) {
        self.session.fetch_add(1, Ordering::AcqRel);
        self.running.store(false, Ordering::Release);

        let primary = self.primary();
        {
            let mut st = primary.lock();
            for kse in st.idle.drain(..) {
                kse.kick();
            }
        }

        let (carriers, kses) = {
            let mut fl = self.alloc.lock();
            let carriers: Vec<Arc<Carrier>> = fl.carriers.drain(..).collect();
            let mut kses: Vec<_> = fl.kses.drain(..).collect();
            kses.extend(fl.pending_kses.drain(..));
            (carriers, kses)
        };
        for c in carriers {
            c.retire();
        }
        for k in kses {
            k.destroy();
        }
        debug!("runtime session ended");
    }

    /// Collects dead threads and recycles retired KSEs and KSEGs.
    pub fn gc(&self) {
        freelist::gc(self);
    }

    /// Resets the runtime in the child of a `fork`.
    ///
    /// Only the calling OS thread exists in the child, so every other
    /// thread, KSE and carrier is forgotten. If the caller is a runtime
    /// thread it continues as the only thread of a fresh primary group.
    pub fn reinit_after_fork(self: &Arc<Self>) {
        self.fork_generation.fetch_add(1, Ordering::AcqRel);
        self.session.fetch_add(1, Ordering::AcqRel);
        self.running.store(false, Ordering::Release);

        // Locks may be held by threads that don't exist in the child.
        unsafe {
            if self.threads.is_locked() {
                self.threads.force_unlock();
            }
            if self.alloc.is_locked() {
                self.alloc.force_unlock();
            }
            if self.signals.is_locked() {
                self.signals.force_unlock();
            }
            if self.keys.is_locked() {
                self.keys.force_unlock();
            }
            if self.primary.is_locked() {
                self.primary.force_unlock();
            }
        }

        let me = Environment::try_thread();
        let saved = me.as_ref().map(|t| {
            // Safety: no other thread of the parent exists in the child.
            unsafe { t.kseg.force_unlock() };
            let mut st = t.kseg.lock();
            let s = st.sched(t.id);
            (s.policy, s.base_priority, s.sig.mask)
        });

        let kseg = Arc::new(Kseg::new(self.next_kseg_id(), true));
        *self.primary.lock() = kseg.clone();
        *self.threads.lock() = HashMap::with_capacity(64);
        *self.alloc.lock() = FreeLists::default();
        self.signals.lock().clear_pending();
        self.live.store(0, Ordering::Release);
        self.dead.store(0, Ordering::Release);

        let (old, (policy, prio, mask)) = match (me, saved) {
            (Some(me), Some(saved)) => (me, saved),
            _ => return,
        };

        self.start();
        let carrier = Carrier::adopt(self.next_carrier_id());
        let thread = Arc::new(Thread::new(
            old.id,
            self.clone(),
            kseg.clone(),
            carrier,
            old.scope,
            old.name.clone(),
            true,
        ));
        *thread.specific.lock() = core::mem::take(&mut *old.specific.lock());
        *thread.cleanup.lock() = core::mem::take(&mut *old.cleanup.lock());

        self.threads.lock().insert(thread.id, thread.clone());
        self.thread_started();
        {
            let param = crate::priority::SchedParam {
                policy,
                priority: prio,
            };
            let mut st = kseg.lock();
            st.threads
                .insert(thread.id, ThreadSched::new(thread.clone(), param, mask));
            st.make_runnable(thread.id, false);
        }
        warn!("{} continues alone after fork", thread.id);
        Environment::set_thread(Some(thread.clone()));
        thread.wait_dispatch();
    }
}

/// Runs `f` as the initial thread of the global runtime.
pub fn block_on<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    Runtime::global().block_on(f)
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.live.load(Ordering::Relaxed) > 0 {
            error!("Runtime dropped with live threads");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::ThreadState;

    #[test]
    fn block_on_runs_closure_as_thread() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config::default());
        let tid = rt.block_on(|| {
            assert!(Environment::in_thread());
            let me = Environment::thread();
            let st = me.kseg.lock();
            assert!(me.kseg.primary);
            assert_eq!(st.threads[&me.id].state, ThreadState::Running);
            me.id
        });
        assert_eq!(tid, ThreadId(1));
        assert!(!Environment::in_thread());
        assert_eq!(rt.live_threads(), 0);
    }

    #[test]
    fn block_on_propagates_panics() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config::default());
        let r = panic::catch_unwind(AssertUnwindSafe(|| {
            rt.block_on(|| {
                panic!("boom");
            })
        }));
        assert!(r.is_err());
        assert_eq!(rt.live_threads(), 0);
        // The runtime can be used again.
        assert_eq!(rt.block_on(|| 5), 5);
    }

    #[test]
    fn lookup_counts_references() {
        let rt = Runtime::new(Config::default());
        rt.block_on(|| {
            let me = Environment::tid();
            let rt = Runtime::current();
            let r = rt.lookup(me).expect("Can't find myself");
            assert_eq!(r.refcount.load(Ordering::Relaxed), 1);
            drop(r);
            assert_eq!(
                rt.lookup(ThreadId(4242)).map(|_| ()),
                Err(ThrError::NoSuchThread)
            );
        });
    }

    #[test]
    fn shutdown_releases_kses() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config {
            concurrency: 2,
            ..Default::default()
        });
        rt.block_on(|| {
            let t = crate::lifecycle::spawn(|| 0).expect("Can't spawn");
            crate::lifecycle::join(t).expect("Can't join");
        });
        let start = std::time::Instant::now();
        while rt.kse_count() > 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(rt.kse_count(), 0);
    }

    #[test]
    fn reinit_resets_runtime() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config {
            concurrency: 1,
            ..Default::default()
        });
        assert_eq!(rt.block_on(|| 1), 1);
        rt.reinit_after_fork();
        assert_eq!(rt.fork_generation(), 1);
        assert_eq!(rt.thread_records(), 0);
        assert_eq!(rt.live_threads(), 0);
        assert_eq!(rt.block_on(|| 2), 2);
    }
}
