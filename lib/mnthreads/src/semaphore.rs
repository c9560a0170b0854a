// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Counting semaphore built on [`Mutex`] and [`CondVar`].

use core::sync::atomic::{AtomicIsize, Ordering};
use std::time::Instant;

use log::trace;

use crate::condvar::CondVar;
use crate::error::{ThrError, ThrResult};
use crate::mutex::{Mutex, MutexAttr};

#[derive(Debug)]
pub struct Semaphore {
    /// Only changed with `mutex` held.
    count: AtomicIsize,
    mutex: Mutex,
    cv: CondVar,
}

impl Semaphore {
    pub const fn new(count: isize) -> Semaphore {
        Semaphore {
            count: AtomicIsize::new(count),
            mutex: Mutex::lazy(MutexAttr::new()),
            cv: CondVar::new(),
        }
    }

    pub fn up(&self) -> ThrResult<()> {
        let _guard = self.mutex.guard()?;
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if count > 0 {
            self.cv.signal()?;
        }
        Ok(())
    }

    pub fn down(&self) -> ThrResult<()> {
        self.down_until(None)
    }

    /// Like [`Semaphore::down`] but gives up with `TimedOut` at `deadline`.
    pub fn timed_down(&self, deadline: Instant) -> ThrResult<()> {
        self.down_until(Some(deadline))
    }

    /// Decrements the count if that doesn't have to wait.
    pub fn try_down(&self) -> ThrResult<()> {
        let _guard = self.mutex.guard()?;
        if self.count.load(Ordering::Acquire) <= 0 {
            return Err(ThrError::WouldBlock);
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn down_until(&self, deadline: Option<Instant>) -> ThrResult<()> {
        let guard = self.mutex.guard()?;
        while self.count.load(Ordering::Acquire) <= 0 {
            match deadline {
                Some(d) => self.cv.timed_wait(guard.mutex(), d)?,
                None => self.cv.wait(guard.mutex())?,
            }
        }
        let left = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!("semaphore down, {} left", left);
        Ok(())
    }

    /// Current count (may be stale by the time it is looked at).
    pub fn value(&self) -> isize {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new(0)
    }
}
