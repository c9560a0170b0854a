// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Errors reported by the threading API.

use custom_error::custom_error;

custom_error! {
    #[derive(PartialEq, Eq, Clone, Copy)]
    pub ThrError
    InvalidArgument = "Malformed attributes, out-of-range argument or bad handle.",
    WouldBlock = "The mutex is held by another thread.",
    AlreadyLocked = "The calling thread already holds this (non-recursive) mutex.",
    TimedOut = "The deadline elapsed before the operation succeeded.",
    Busy = "The synchronization object is still in use.",
    NotOwner = "The calling thread does not own the mutex.",
    Deadlock = "The operation would deadlock the calling thread.",
    ResourceExhausted = "Can't allocate another thread, KSE or KSEG.",
    Interrupted = "The wait was interrupted by a signal or cancellation.",
    NoSuchThread = "No thread with the given id exists.",
    NotSupported = "The requested operation is not supported.",
}

/// Result type used throughout the crate.
pub type ThrResult<T> = Result<T, ThrError>;

impl ThrError {
    /// The POSIX error number that corresponds to this error.
    ///
    /// Several kinds collapse into the same number (e.g., `WouldBlock`,
    /// `AlreadyLocked` and `Busy` are all `EBUSY` for pthread callers).
    pub fn errno(&self) -> i32 {
        match self {
            ThrError::InvalidArgument => libc::EINVAL,
            ThrError::WouldBlock => libc::EBUSY,
            ThrError::AlreadyLocked => libc::EBUSY,
            ThrError::TimedOut => libc::ETIMEDOUT,
            ThrError::Busy => libc::EBUSY,
            ThrError::NotOwner => libc::EPERM,
            ThrError::Deadlock => libc::EDEADLK,
            ThrError::ResourceExhausted => libc::EAGAIN,
            ThrError::Interrupted => libc::EINTR,
            ThrError::NoSuchThread => libc::ESRCH,
            ThrError::NotSupported => libc::ENOTSUP,
        }
    }
}

impl From<ThrError> for i32 {
    fn from(e: ThrError) -> i32 {
        e.errno()
    }
}

impl Default for ThrError {
    fn default() -> ThrError {
        ThrError::NotSupported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(ThrError::TimedOut.errno(), libc::ETIMEDOUT);
        assert_eq!(ThrError::Deadlock.errno(), libc::EDEADLK);
        let e: i32 = ThrError::NotOwner.into();
        assert_eq!(e, libc::EPERM);
        assert_eq!(ThrError::default(), ThrError::NotSupported);
    }

    #[test]
    fn display_is_descriptive() {
        let msg = format!("{}", ThrError::ResourceExhausted);
        assert!(msg.contains("allocate"));
    }
}
