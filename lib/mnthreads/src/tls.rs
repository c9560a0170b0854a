// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per OS-thread state of the runtime.
//!
//! Carriers record the user thread they currently host, KSEs and carriers
//! both keep the parker they block on.

use core::cell::RefCell;
use core::time::Duration;
use std::sync::Arc;

use crossbeam_utils::sync::Parker;

use crate::error::{ThrError, ThrResult};
use crate::kse::Kse;
use crate::threads::{Thread, ThreadId};

thread_local! {
    /// The user thread hosted by this carrier.
    static THREAD: RefCell<Option<Arc<Thread>>> = RefCell::new(None);

    /// The KSE that dispatched the hosted thread (or this KSE itself).
    static KSE: RefCell<Option<Arc<Kse>>> = RefCell::new(None);

    /// What this OS thread blocks on.
    static PARKER: RefCell<Option<Parker>> = RefCell::new(None);
}

/// Convenience functions to access the state of the calling thread.
pub struct Environment {}

impl Environment {
    /// Id of the calling user thread.
    ///
    /// # Panics
    /// If not called from a thread managed by a runtime.
    pub fn tid() -> ThreadId {
        let tid = Environment::try_tid();
        assert!(tid.is_some(), "Don't have TCB available?");
        tid.unwrap_or(ThreadId(0))
    }

    /// Id of the calling user thread, if there is one.
    pub fn try_tid() -> Option<ThreadId> {
        THREAD.with(|t| t.borrow().as_ref().map(|t| t.id))
    }

    /// Is the caller a thread managed by a runtime?
    pub fn in_thread() -> bool {
        Environment::try_tid().is_some()
    }

    pub(crate) fn try_thread() -> Option<Arc<Thread>> {
        THREAD.with(|t| t.borrow().clone())
    }

    /// The calling user thread, or `NotSupported` for foreign OS threads.
    pub(crate) fn current() -> ThrResult<Arc<Thread>> {
        Environment::try_thread().ok_or(ThrError::NotSupported)
    }

    pub(crate) fn thread() -> Arc<Thread> {
        match Environment::try_thread() {
            Some(t) => t,
            None => fatal!("Don't have TCB available?"),
        }
    }

    pub(crate) fn set_thread(thread: Option<Arc<Thread>>) {
        THREAD.with(|t| *t.borrow_mut() = thread);
    }

    pub(crate) fn kse() -> Arc<Kse> {
        match KSE.with(|k| k.borrow().clone()) {
            Some(k) => k,
            None => fatal!("Not running on a KSE?"),
        }
    }

    pub(crate) fn set_kse(kse: Arc<Kse>) {
        KSE.with(|k| *k.borrow_mut() = Some(kse));
    }

    pub(crate) fn clear_kse() {
        KSE.with(|k| *k.borrow_mut() = None);
    }

    pub(crate) fn install_parker(parker: Parker) {
        PARKER.with(|p| *p.borrow_mut() = Some(parker));
    }

    /// Blocks the OS thread until unparked.
    pub(crate) fn park() {
        PARKER.with(|p| match p.borrow().as_ref() {
            Some(p) => p.park(),
            None => fatal!("No parker installed on this OS thread"),
        })
    }

    pub(crate) fn park_timeout(timeout: Duration) {
        PARKER.with(|p| match p.borrow().as_ref() {
            Some(p) => p.park_timeout(timeout),
            None => fatal!("No parker installed on this OS thread"),
        })
    }
}
