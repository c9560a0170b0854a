// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reader-writer lock built on [`Mutex`] and [`CondVar`].
//!
//! Writers are preferred: once a writer waits, new readers queue up behind
//! it so writes don't starve.

use std::time::Instant;

use either::{Either, Left, Right};
use log::trace;

use crate::condvar::CondVar;
use crate::error::{ThrError, ThrResult};
use crate::mutex::{Mutex, MutexAttr};
use crate::threads::ThreadId;
use crate::tls::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwLockIntent {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct RwState {
    /// The writer, or the threads that hold the lock for reading.
    owner: Option<Either<ThreadId, Vec<ThreadId>>>,
    waiting_readers: usize,
    waiting_writers: usize,
}

impl RwState {
    fn can_enter(&self, intent: RwLockIntent) -> bool {
        match (intent, &self.owner) {
            (_, Some(Left(_))) => false,
            (RwLockIntent::Write, Some(Right(_))) => false,
            (RwLockIntent::Write, None) => true,
            (RwLockIntent::Read, _) => self.waiting_writers == 0,
        }
    }

    fn enter(&mut self, intent: RwLockIntent, tid: ThreadId) {
        match (intent, &mut self.owner) {
            (RwLockIntent::Read, Some(Right(readers))) => readers.push(tid),
            (RwLockIntent::Read, _) => self.owner = Some(Right(vec![tid])),
            (RwLockIntent::Write, _) => self.owner = Some(Left(tid)),
        }
    }

    fn waiting(&mut self, intent: RwLockIntent) -> &mut usize {
        match intent {
            RwLockIntent::Read => &mut self.waiting_readers,
            RwLockIntent::Write => &mut self.waiting_writers,
        }
    }
}

/// A reader-writer lock for runtime threads.
///
/// The state is only touched with `mutex` held; the spin lock around it is
/// never contended.
#[derive(Debug, Default)]
pub struct RwLock {
    mutex: Mutex,
    readers: CondVar,
    writers: CondVar,
    state: spin::Mutex<RwState>,
}

impl RwLock {
    pub const fn new() -> RwLock {
        RwLock {
            mutex: Mutex::lazy(MutexAttr::new()),
            readers: CondVar::new(),
            writers: CondVar::new(),
            state: spin::Mutex::new(RwState {
                owner: None,
                waiting_readers: 0,
                waiting_writers: 0,
            }),
        }
    }

    /// Blocks until the lock is held with `intent`.
    pub fn enter(&self, intent: RwLockIntent) -> ThrResult<()> {
        self.enter_until(intent, None)
    }

    /// Like [`RwLock::enter`] but gives up with `TimedOut` at `deadline`.
    pub fn timed_enter(&self, intent: RwLockIntent, deadline: Instant) -> ThrResult<()> {
        self.enter_until(intent, Some(deadline))
    }

    fn enter_until(&self, intent: RwLockIntent, deadline: Option<Instant>) -> ThrResult<()> {
        let tid = Environment::current()?.id;
        let guard = self.mutex.guard()?;
        if self.holds(tid, RwLockIntent::Write) {
            return Err(ThrError::Deadlock);
        }

        loop {
            {
                let mut st = self.state.lock();
                if st.can_enter(intent) {
                    st.enter(intent, tid);
                    trace!("{} entered rwlock for {:?}", tid, intent);
                    return Ok(());
                }
                *st.waiting(intent) += 1;
            }
            let waiters = Waiting {
                lock: self,
                intent,
            };
            let cv = match intent {
                RwLockIntent::Read => &self.readers,
                RwLockIntent::Write => &self.writers,
            };
            let r = match deadline {
                Some(d) => cv.timed_wait(guard.mutex(), d),
                None => cv.wait(guard.mutex()),
            };
            drop(waiters);
            r?;
        }
    }

    /// Takes the lock with `intent` if that is possible without blocking.
    pub fn try_enter(&self, intent: RwLockIntent) -> bool {
        let tid = match Environment::current() {
            Ok(me) => me.id,
            Err(_) => return false,
        };
        let _guard = match self.mutex.guard() {
            Ok(g) => g,
            Err(_) => return false,
        };
        let mut st = self.state.lock();
        if st.can_enter(intent) {
            st.enter(intent, tid);
            true
        } else {
            false
        }
    }

    /// Turns the caller's read hold into a write hold if it is the only
    /// reader.
    pub fn try_upgrade(&self) -> bool {
        let tid = match Environment::current() {
            Ok(me) => me.id,
            Err(_) => return false,
        };
        let _guard = match self.mutex.guard() {
            Ok(g) => g,
            Err(_) => return false,
        };
        let mut st = self.state.lock();
        let sole_reader =
            matches!(&st.owner, Some(Right(readers)) if readers.len() == 1 && readers[0] == tid);
        if sole_reader {
            trace!("{} upgraded rwlock", tid);
            st.owner = Some(Left(tid));
        } else {
            trace!("can not upgrade rwlock, owner is {:?}", st.owner);
        }
        sole_reader
    }

    /// Turns the caller's write hold into a read hold and lets waiting
    /// readers in.
    pub fn downgrade(&self) -> ThrResult<()> {
        let tid = Environment::current()?.id;
        let _guard = self.mutex.guard()?;
        {
            let mut st = self.state.lock();
            if st.owner != Some(Left(tid)) {
                return Err(ThrError::NotOwner);
            }
            st.owner = Some(Right(vec![tid]));
        }
        self.readers.broadcast()
    }

    /// Releases the caller's hold.
    pub fn exit(&self) -> ThrResult<()> {
        let tid = Environment::current()?.id;
        let _guard = self.mutex.guard()?;
        let free = {
            let mut st = self.state.lock();
            st.owner = match st.owner.take() {
                Some(Left(owner)) if owner == tid => None,
                Some(Right(mut readers)) if readers.contains(&tid) => {
                    if let Some(pos) = readers.iter().position(|r| *r == tid) {
                        readers.swap_remove(pos);
                    }
                    if readers.is_empty() {
                        None
                    } else {
                        Some(Right(readers))
                    }
                }
                other => {
                    st.owner = other;
                    return Err(ThrError::NotOwner);
                }
            };
            st.owner.is_none()
        };
        if free {
            self.wakeup_writer_then_readers()?;
        }
        Ok(())
    }

    /// Does the caller hold the lock with `intent`?
    pub fn held(&self, intent: RwLockIntent) -> bool {
        match Environment::try_tid() {
            Some(tid) => self.holds(tid, intent),
            None => false,
        }
    }

    fn holds(&self, tid: ThreadId, intent: RwLockIntent) -> bool {
        let st = self.state.lock();
        match (intent, &st.owner) {
            (RwLockIntent::Write, Some(Left(owner))) => *owner == tid,
            (RwLockIntent::Read, Some(Right(readers))) => readers.contains(&tid),
            _ => false,
        }
    }

    // Writers go first to avoid starving them.
    fn wakeup_writer_then_readers(&self) -> ThrResult<()> {
        let (writers, readers) = {
            let st = self.state.lock();
            (st.waiting_writers, st.waiting_readers)
        };
        if writers > 0 {
            self.writers.signal()
        } else if readers > 0 {
            self.readers.broadcast()
        } else {
            Ok(())
        }
    }
}

/// Counts the caller as a waiter while it blocks; also undone when the wait
/// unwinds because of a cancellation.
struct Waiting<'a> {
    lock: &'a RwLock,
    intent: RwLockIntent,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let wake_readers = {
            let mut st = self.lock.state.lock();
            *st.waiting(self.intent) -= 1;
            self.intent == RwLockIntent::Write
                && st.waiting_writers == 0
                && st.waiting_readers > 0
                && !matches!(st.owner, Some(Left(_)))
        };
        // The last waiting writer gave up; readers no longer have to stay out.
        if wake_readers {
            let _ = self.lock.readers.broadcast();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lifecycle::{self, join, spawn};
    use crate::runtime::Runtime;
    use crate::threads::ExitStatus;
    use core::time::Duration;
    use std::sync::Arc;

    #[test]
    fn upgrade_and_downgrade() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config::default());
        rt.block_on(|| {
            let rwlock = Arc::new(RwLock::new());
            let rwlock1 = rwlock.clone();
            let rwlock2 = rwlock.clone();

            let a = spawn(move || {
                rwlock2.enter(RwLockIntent::Read).unwrap();
                lifecycle::yield_now();

                assert!(rwlock2.held(RwLockIntent::Read));
                assert!(!rwlock2.held(RwLockIntent::Write));
                while !rwlock2.try_upgrade() {
                    lifecycle::yield_now();
                }
                assert!(!rwlock2.held(RwLockIntent::Read));
                assert!(rwlock2.held(RwLockIntent::Write));

                rwlock2.downgrade().unwrap();
                assert!(rwlock2.held(RwLockIntent::Read));
                rwlock2.exit().unwrap();
                0
            })
            .unwrap();

            let b = spawn(move || {
                for _i in 0..5 {
                    rwlock1.enter(RwLockIntent::Read).unwrap();
                    assert!(rwlock1.held(RwLockIntent::Read));
                    assert!(!rwlock1.held(RwLockIntent::Write));
                    rwlock1.exit().unwrap();
                    lifecycle::yield_now();
                }
                0
            })
            .unwrap();

            assert_eq!(join(a), Ok(ExitStatus::Exited(0)));
            assert_eq!(join(b), Ok(ExitStatus::Exited(0)));
            assert_eq!(rwlock.exit(), Err(ThrError::NotOwner));
        });
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config {
            concurrency: 2,
            ..Default::default()
        });
        rt.block_on(|| {
            let rwlock = Arc::new(RwLock::new());
            rwlock.enter(RwLockIntent::Read).unwrap();

            let rw = rwlock.clone();
            let writer = spawn(move || {
                rw.enter(RwLockIntent::Write).unwrap();
                rw.exit().unwrap();
                1
            })
            .unwrap();
            while rwlock.state.lock().waiting_writers == 0 {
                lifecycle::yield_now();
            }

            // A second reader would starve the writer.
            let rw = rwlock.clone();
            let reader = spawn(move || rw.try_enter(RwLockIntent::Read) as usize).unwrap();
            assert_eq!(join(reader), Ok(ExitStatus::Exited(0)));

            rwlock.exit().unwrap();
            assert_eq!(join(writer), Ok(ExitStatus::Exited(1)));
            assert!(rwlock.try_enter(RwLockIntent::Read));
            rwlock.exit().unwrap();
        });
    }

    #[test]
    fn timed_enter_times_out() {
        let rt = Runtime::new(Config::default());
        rt.block_on(|| {
            let rwlock = Arc::new(RwLock::new());
            rwlock.enter(RwLockIntent::Write).unwrap();
            assert_eq!(
                rwlock.enter(RwLockIntent::Read),
                Err(ThrError::Deadlock)
            );
            let rw = rwlock.clone();
            let t = spawn(move || {
                let deadline = Instant::now() + Duration::from_millis(10);
                match rw.timed_enter(RwLockIntent::Read, deadline) {
                    Err(ThrError::TimedOut) => 1,
                    _ => 0,
                }
            })
            .unwrap();
            assert_eq!(join(t), Ok(ExitStatus::Exited(1)));
            assert_eq!(rwlock.state.lock().waiting_readers, 0);
            rwlock.exit().unwrap();
        });
    }
}
