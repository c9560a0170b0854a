// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Scenarios for thread creation, termination and collection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mnthreads::{
    cancel, cleanup_push, create, join, resume, sleep, spawn, state, suspend, yield_now, CondVar,
    Config, ExitStatus, Key, Mutex, Runtime, Scope, ThrError, ThreadAttr, ThreadState,
};

fn runtime(concurrency: usize) -> Arc<Runtime> {
    let _r = env_logger::try_init();
    Runtime::new(Config {
        concurrency,
        gc_watermark: 4,
        ..Default::default()
    })
}

/// Waits until the runtime collected all but `records` thread records.
fn settle(rt: &Arc<Runtime>, records: usize) -> bool {
    for _ in 0..2000 {
        rt.gc();
        if rt.thread_records() <= records {
            return true;
        }
        sleep(Duration::from_millis(1)).unwrap();
    }
    false
}

#[test]
fn joined_threads_are_collected() {
    let rt = runtime(2);
    let r = rt.clone();
    rt.block_on(move || {
        for round in 0..3 {
            let tids: Vec<_> = (0..20)
                .map(|i| spawn(move || i + round).unwrap())
                .collect();
            for (i, t) in tids.into_iter().enumerate() {
                assert_eq!(join(t), Ok(ExitStatus::Exited(i + round)));
            }
            // Only the main thread is left.
            assert!(settle(&r, 1));
        }
        assert_eq!(r.live_threads(), 1);
    });
    assert_eq!(rt.live_threads(), 0);
}

#[test]
fn detached_threads_are_collected() {
    let rt = runtime(2);
    let r = rt.clone();
    rt.block_on(move || {
        let done = Arc::new(AtomicUsize::new(0));
        let attr = ThreadAttr::new().detached(true);
        for _ in 0..10 {
            let d = done.clone();
            create(&attr, move || {
                d.fetch_add(1, Ordering::SeqCst);
                0
            })
            .unwrap();
        }
        while done.load(Ordering::SeqCst) < 10 {
            yield_now();
        }
        assert!(settle(&r, 1));
    });
}

static DESTROYED: AtomicUsize = AtomicUsize::new(0);

fn destroy_value(v: usize) {
    DESTROYED.fetch_add(v, Ordering::SeqCst);
}

#[test]
fn specific_data_destructors() {
    let rt = runtime(2);
    rt.block_on(|| {
        let key = Key::create(Some(destroy_value)).unwrap();
        let tids: Vec<_> = (1..=4)
            .map(|i| {
                spawn(move || {
                    assert_eq!(key.get(), 0);
                    key.set(i).unwrap();
                    yield_now();
                    key.get()
                })
                .unwrap()
            })
            .collect();
        for (i, t) in tids.into_iter().enumerate() {
            assert_eq!(join(t), Ok(ExitStatus::Exited(i + 1)));
        }
        key.delete().unwrap();
    });
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1 + 2 + 3 + 4);
}

#[test]
fn cancel_condvar_waiter_runs_cleanup() {
    let rt = runtime(2);
    rt.block_on(|| {
        let m = Arc::new(Mutex::default());
        let cv = Arc::new(CondVar::new());
        let (m2, cv2) = (m.clone(), cv.clone());
        let t = spawn(move || {
            let m3 = m2.clone();
            m2.lock().unwrap();
            // The mutex is held again when the handler runs.
            cleanup_push(move || {
                m3.unlock().unwrap();
            })
            .unwrap();
            loop {
                cv2.wait(&m2).unwrap();
            }
        })
        .unwrap();
        while state(t) != Ok(ThreadState::CondWait) {
            yield_now();
        }
        cancel(t).unwrap();
        assert_eq!(join(t), Ok(ExitStatus::Canceled));
        assert_eq!(m.owner(), None);
        m.lock().unwrap();
        m.unlock().unwrap();
    });
}

#[test]
fn cancel_joiner() {
    let rt = runtime(2);
    rt.block_on(|| {
        let sleeper = spawn(|| {
            let _ = sleep(Duration::from_secs(30));
            0
        })
        .unwrap();
        let joiner = spawn(move || join(sleeper).map(|_| 1).unwrap_or(2)).unwrap();
        while state(joiner) != Ok(ThreadState::Join) {
            yield_now();
        }
        cancel(joiner).unwrap();
        assert_eq!(join(joiner), Ok(ExitStatus::Canceled));
        cancel(sleeper).unwrap();
        assert_eq!(join(sleeper), Ok(ExitStatus::Canceled));
    });
}

#[test]
fn suspend_stops_progress() {
    let rt = runtime(2);
    rt.block_on(|| {
        let counter = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicUsize::new(0));
        let (c, s) = (counter.clone(), stop.clone());
        let t = spawn(move || {
            while s.load(Ordering::SeqCst) == 0 {
                c.fetch_add(1, Ordering::SeqCst);
                yield_now();
            }
            0
        })
        .unwrap();
        while counter.load(Ordering::SeqCst) < 10 {
            yield_now();
        }

        suspend(t).unwrap();
        while state(t) != Ok(ThreadState::Suspended) {
            yield_now();
        }
        let frozen = counter.load(Ordering::SeqCst);
        sleep(Duration::from_millis(20)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), frozen);

        resume(t).unwrap();
        while counter.load(Ordering::SeqCst) == frozen {
            yield_now();
        }
        stop.store(1, Ordering::SeqCst);
        assert_eq!(join(t), Ok(ExitStatus::Exited(0)));
    });
}

#[test]
fn suspend_condvar_waiter() {
    let rt = runtime(2);
    rt.block_on(|| {
        let m = Arc::new(Mutex::default());
        let cv = Arc::new(CondVar::new());
        let ready = Arc::new(AtomicUsize::new(0));
        let (m2, cv2, r2) = (m.clone(), cv.clone(), ready.clone());
        let t = spawn(move || {
            m2.lock().unwrap();
            while r2.load(Ordering::SeqCst) == 0 {
                cv2.wait(&m2).unwrap();
            }
            m2.unlock().unwrap();
            7
        })
        .unwrap();
        while state(t) != Ok(ThreadState::CondWait) {
            yield_now();
        }

        // Suspending a blocked thread leaves it waiting; resuming it without
        // a signal changes nothing either.
        suspend(t).unwrap();
        assert_eq!(state(t), Ok(ThreadState::CondWait));
        resume(t).unwrap();
        assert_eq!(state(t), Ok(ThreadState::CondWait));

        // Woken while suspended: it stays off the run queue.
        suspend(t).unwrap();
        m.lock().unwrap();
        ready.store(1, Ordering::SeqCst);
        cv.broadcast().unwrap();
        m.unlock().unwrap();
        assert_eq!(state(t), Ok(ThreadState::Suspended));
        sleep(Duration::from_millis(20)).unwrap();
        assert_eq!(state(t), Ok(ThreadState::Suspended));

        resume(t).unwrap();
        assert_eq!(join(t), Ok(ExitStatus::Exited(7)));
    });
}

#[test]
fn system_scope_threads_run_in_parallel() {
    let rt = runtime(1);
    let r = rt.clone();
    rt.block_on(move || {
        let before = r.kse_count();
        let flag = Arc::new(AtomicUsize::new(0));
        let f = flag.clone();
        let attr = ThreadAttr::new().scope(Scope::System);
        // Spins without ever calling into the runtime.
        let spinner = create(&attr, move || {
            while f.load(Ordering::SeqCst) == 0 {
                std::hint::spin_loop();
            }
            7
        })
        .unwrap();
        assert!(r.kse_count() > before);
        // The primary KSE is still free to run us.
        sleep(Duration::from_millis(10)).unwrap();
        flag.store(1, Ordering::SeqCst);
        assert_eq!(join(spinner), Ok(ExitStatus::Exited(7)));
    });
}

#[test]
fn thread_limit() {
    let _r = env_logger::try_init();
    let rt = Runtime::new(Config {
        max_threads: 2,
        ..Default::default()
    });
    rt.block_on(|| {
        let t = spawn(|| {
            let _ = sleep(Duration::from_secs(30));
            0
        })
        .unwrap();
        assert_eq!(spawn(|| 0).err(), Some(ThrError::ResourceExhausted));
        cancel(t).unwrap();
        join(t).unwrap();
    });
}
