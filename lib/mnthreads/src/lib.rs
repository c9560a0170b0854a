// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A user-space M:N thread scheduler with support for synchronization primitives.
//!
//! Many user threads are multiplexed onto a few kernel schedulable entities
//! (KSEs, one OS thread each). KSEs are grouped into scheduling groups (KSEGs)
//! that share a priority run queue and a timed wait queue:
//!
//! * Process-scope threads share the primary KSEG and its pool of KSEs
//!   (sized by the configured concurrency level).
//! * System-scope threads get a KSEG with a single KSE of their own.
//!
//! Every user thread runs on a *carrier*: an OS thread that provides its stack
//! and is only allowed to make progress while a KSE has dispatched it. Blocking
//! operations (mutex, condition variable, join, sleep, sigwait) put the thread
//! into the right queue under its KSEG's scheduling lock, hand the KSE back to
//! the scheduler loop and park the carrier until some KSE resumes it.
//!
//! ```no_run
//! use mnthreads::{Runtime, Config};
//!
//! let rt = Runtime::new(Config::default());
//! let v = rt.block_on(|| {
//!     let t = mnthreads::spawn(|| 42).unwrap();
//!     mnthreads::join(t).unwrap()
//! });
//! assert_eq!(v, mnthreads::ExitStatus::Exited(42));
//! ```

/// Reports corruption of the scheduler's own state and terminates.
///
/// These are bugs in the runtime, not errors an application can handle.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!("{}:{}: {}", file!(), line!(), format_args!($($arg)*));
        $crate::abort_process()
    }};
}

pub mod cancel;
mod carrier;
pub mod condvar;
pub mod config;
pub mod error;
mod freelist;
mod kse;
mod kseg;
pub mod lifecycle;
pub mod mutex;
pub mod priority;
mod runq;
pub mod runtime;
pub mod rwlock;
mod scheduler;
pub mod semaphore;
pub mod signal;
pub mod specific;
pub mod stack;
pub mod threads;
mod tls;
mod wait;
mod waitq;

pub use crate::cancel::{
    cancel, cleanup_pop, cleanup_push, set_cancel_state, set_cancel_type, test_cancel,
    CancelState, CancelType,
};
pub use crate::condvar::CondVar;
pub use crate::config::Config;
pub use crate::error::{ThrError, ThrResult};
pub use crate::lifecycle::{
    active_priority, blocking, concurrency, create, current, detach, exit, join, resume,
    schedparam, set_concurrency, set_schedparam, sleep, spawn, state, suspend, yield_now,
};
pub use crate::mutex::{Mutex, MutexAttr, MutexGuard, MutexProtocol, MutexType};
pub use crate::priority::{Priority, SchedParam, SchedPolicy};
pub use crate::runtime::{block_on, Runtime};
pub use crate::rwlock::{RwLock, RwLockIntent};
pub use crate::semaphore::Semaphore;
pub use crate::signal::{
    forward_os_signal, kill, raise_process, sigaction, sigmask, sigpending, sigqueue,
    sigsuspend, sigtimedwait, sigwait, sigwaitinfo, SaFlags, SigAction, SigCode, SigHandler, SigInfo,
    SigSet, Signal, SigmaskHow,
};
pub use crate::specific::Key;
pub use crate::stack::StackSpec;
pub use crate::threads::{ExitStatus, Scope, ThreadAttr, ThreadId, ThreadState};
pub use crate::tls::Environment;

#[cfg(not(test))]
#[doc(hidden)]
pub(crate) fn abort_process() -> ! {
    std::process::abort()
}

/// Unit tests check invariant violations with `#[should_panic]`.
#[cfg(test)]
#[doc(hidden)]
pub(crate) fn abort_process() -> ! {
    panic!("scheduler invariant violated")
}

static_assertions::assert_impl_all!(Runtime: Send, Sync);
static_assertions::assert_impl_all!(Mutex: Send, Sync);
static_assertions::assert_impl_all!(CondVar: Send, Sync);
static_assertions::assert_impl_all!(RwLock: Send, Sync);
static_assertions::assert_impl_all!(Semaphore: Send, Sync);
