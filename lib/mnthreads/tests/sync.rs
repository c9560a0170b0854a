// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Scenarios for the synchronization primitives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;

use mnthreads::{
    create, join, spawn, yield_now, CondVar, Config, ExitStatus, Mutex, MutexAttr, MutexProtocol,
    RwLock, RwLockIntent, Runtime, Semaphore, ThrError, ThreadAttr,
};

fn runtime(concurrency: usize) -> Arc<Runtime> {
    let _r = env_logger::try_init();
    Runtime::new(Config {
        concurrency,
        ..Default::default()
    })
}

#[test]
fn mutual_exclusion() {
    let rt = runtime(4);
    let inside = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));
    let (i, t) = (inside.clone(), total.clone());
    rt.block_on(move || {
        let m = Arc::new(Mutex::default());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let (m, inside, total) = (m.clone(), i.clone(), t.clone());
                spawn(move || {
                    for _ in 0..200 {
                        m.lock().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        yield_now();
                        total.fetch_add(1, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        m.unlock().unwrap();
                    }
                    0
                })
                .unwrap()
            })
            .collect();
        for w in workers {
            assert_eq!(join(w), Ok(ExitStatus::Exited(0)));
        }
        m.destroy().unwrap();
    });
    assert_eq!(total.load(Ordering::SeqCst), 8 * 200);
    assert_eq!(inside.load(Ordering::SeqCst), 0);
}

#[test]
fn condvar_producer_consumer() {
    let rt = runtime(2);
    rt.block_on(|| {
        let m = Arc::new(Mutex::default());
        let cv = Arc::new(CondVar::new());
        let items = Arc::new(AtomicUsize::new(0));

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let (m, cv, items) = (m.clone(), cv.clone(), items.clone());
                spawn(move || {
                    for _ in 0..25 {
                        m.lock().unwrap();
                        while items.load(Ordering::SeqCst) == 0 {
                            cv.wait(&m).unwrap();
                        }
                        items.fetch_sub(1, Ordering::SeqCst);
                        m.unlock().unwrap();
                    }
                    0
                })
                .unwrap()
            })
            .collect();

        for _ in 0..100 {
            m.lock().unwrap();
            items.fetch_add(1, Ordering::SeqCst);
            cv.signal().unwrap();
            m.unlock().unwrap();
        }
        for c in consumers {
            assert_eq!(join(c), Ok(ExitStatus::Exited(0)));
        }
        assert_eq!(items.load(Ordering::SeqCst), 0);
        assert_eq!(cv.waiters(), 0);
        cv.destroy().unwrap();
    });
}

#[test]
fn signal_after_enqueue_is_never_lost() {
    let rt = runtime(1);
    rt.block_on(|| {
        for _ in 0..20 {
            let m = Arc::new(Mutex::default());
            let cv = Arc::new(CondVar::new());
            let (m2, cv2) = (m.clone(), cv.clone());
            let waiter = spawn(move || {
                m2.lock().unwrap();
                cv2.wait(&m2).unwrap();
                m2.unlock().unwrap();
                1
            })
            .unwrap();
            // The waiter holds the mutex until it is enqueued on the condvar.
            while cv.waiters() == 0 {
                yield_now();
            }
            m.lock().unwrap();
            cv.signal().unwrap();
            m.unlock().unwrap();
            assert_eq!(join(waiter), Ok(ExitStatus::Exited(1)));
        }
    });
}

#[test]
fn timed_wait_reacquires_mutex() {
    let rt = runtime(2);
    rt.block_on(|| {
        let m = Mutex::default();
        let cv = CondVar::new();
        m.lock().unwrap();
        let start = Instant::now();
        let r = cv.timed_wait(&m, start + Duration::from_millis(20));
        assert_eq!(r, Err(ThrError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(m.owner(), Some(mnthreads::current()));
        m.unlock().unwrap();
    });
}

#[test]
fn inheritance_is_undone_on_unlock() {
    let rt = runtime(1);
    let order: Arc<ArrayQueue<&'static str>> = Arc::new(ArrayQueue::new(4));
    let o = order.clone();
    rt.block_on(move || {
        let m = Arc::new(Mutex::new(MutexAttr::new().protocol(MutexProtocol::Inherit)).unwrap());

        let (ml, ol) = (m.clone(), o.clone());
        let low = create(&ThreadAttr::new().priority(3), move || {
            ml.lock().unwrap();
            mnthreads::sleep(Duration::from_millis(40)).unwrap();
            let me = mnthreads::current();
            assert_eq!(mnthreads::active_priority(me), Ok(28));
            ml.unlock().unwrap();
            assert!(ol.push("low").is_ok());
            assert_eq!(mnthreads::active_priority(me), Ok(3));
            0
        })
        .unwrap();
        mnthreads::sleep(Duration::from_millis(10)).unwrap();

        let (mh, oh) = (m.clone(), o.clone());
        let high = create(&ThreadAttr::new().priority(28), move || {
            mh.lock().unwrap();
            assert!(oh.push("high").is_ok());
            mh.unlock().unwrap();
            0
        })
        .unwrap();

        join(high).unwrap();
        join(low).unwrap();
    });
    // `high` gets the mutex handed over and preempts `low` right away.
    assert_eq!(order.pop(), Some("high"));
    assert_eq!(order.pop(), Some("low"));
}

#[test]
fn rwlock_readers_share_writers_exclude() {
    let rt = runtime(4);
    rt.block_on(|| {
        let rw = Arc::new(RwLock::new());
        let readers = Arc::new(AtomicUsize::new(0));
        let writers = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..6)
            .map(|i| {
                let (rw, readers, writers) = (rw.clone(), readers.clone(), writers.clone());
                spawn(move || {
                    for _ in 0..50 {
                        if i % 3 == 0 {
                            rw.enter(RwLockIntent::Write).unwrap();
                            assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(readers.load(Ordering::SeqCst), 0);
                            yield_now();
                            writers.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            rw.enter(RwLockIntent::Read).unwrap();
                            readers.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(writers.load(Ordering::SeqCst), 0);
                            yield_now();
                            readers.fetch_sub(1, Ordering::SeqCst);
                        }
                        rw.exit().unwrap();
                    }
                    0
                })
                .unwrap()
            })
            .collect();
        for t in threads {
            assert_eq!(join(t), Ok(ExitStatus::Exited(0)));
        }
    });
}

#[test]
fn semaphore_bounds_concurrency() {
    let rt = runtime(4);
    rt.block_on(|| {
        let sem = Arc::new(Semaphore::new(2));
        let inside = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..6)
            .map(|_| {
                let (sem, inside) = (sem.clone(), inside.clone());
                spawn(move || {
                    for _ in 0..20 {
                        sem.down().unwrap();
                        assert!(inside.fetch_add(1, Ordering::SeqCst) < 2);
                        yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        sem.up().unwrap();
                    }
                    0
                })
                .unwrap()
            })
            .collect();
        for t in threads {
            join(t).unwrap();
        }
        assert_eq!(sem.value(), 2);
    });
}
