// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Priorities and scheduling policies.
//!
//! User-visible priorities range from [`MIN_PRIORITY`] to [`MAX_PRIORITY`].
//! The run queue has more levels than that: threads with a realtime policy
//! are queued [`RT_PRIORITY`] levels higher, and a thread that was just
//! interrupted for signal delivery is boosted by [`SIGNAL_PRIORITY`] until
//! its handler runs.

use core::convert::TryFrom;

use crate::error::{ThrError, ThrResult};

/// A thread or mutex priority.
pub type Priority = i32;

pub const MIN_PRIORITY: Priority = 0;
pub const MAX_PRIORITY: Priority = 31;
pub const DEFAULT_PRIORITY: Priority = 15;

/// Boost applied while a thread has a signal frame to run.
pub(crate) const SIGNAL_PRIORITY: usize = 32;
/// Boost applied to threads with a realtime (`Fifo`/`RoundRobin`) policy.
pub(crate) const RT_PRIORITY: usize = 64;
/// Number of run-queue levels (user levels + both boosts).
pub(crate) const PRIORITY_LEVELS: usize = MAX_PRIORITY as usize + 1 + SIGNAL_PRIORITY + RT_PRIORITY;

/// Scheduling policy of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedPolicy {
    /// Time-shared (`SCHED_OTHER`).
    Other,
    /// Run until block or yield, no time slicing (`SCHED_FIFO`).
    Fifo,
    /// Realtime with time slicing (`SCHED_RR`).
    RoundRobin,
}

impl SchedPolicy {
    pub fn is_realtime(&self) -> bool {
        !matches!(self, SchedPolicy::Other)
    }

    /// Whether threads with this policy are preempted when their slice ends.
    pub(crate) fn is_timesliced(&self) -> bool {
        !matches!(self, SchedPolicy::Fifo)
    }
}

impl Default for SchedPolicy {
    fn default() -> Self {
        SchedPolicy::Other
    }
}

impl TryFrom<i32> for SchedPolicy {
    type Error = ThrError;

    fn try_from(v: i32) -> ThrResult<Self> {
        match v {
            libc::SCHED_OTHER => Ok(SchedPolicy::Other),
            libc::SCHED_FIFO => Ok(SchedPolicy::Fifo),
            libc::SCHED_RR => Ok(SchedPolicy::RoundRobin),
            _ => Err(ThrError::InvalidArgument),
        }
    }
}

/// Scheduling parameters of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SchedParam {
    pub policy: SchedPolicy,
    pub priority: Priority,
}

impl Default for SchedParam {
    fn default() -> Self {
        SchedParam {
            policy: SchedPolicy::Other,
            priority: DEFAULT_PRIORITY,
        }
    }
}

/// Rejects priorities outside of `MIN_PRIORITY..=MAX_PRIORITY`.
pub(crate) fn check_priority(prio: Priority) -> ThrResult<Priority> {
    if (MIN_PRIORITY..=MAX_PRIORITY).contains(&prio) {
        Ok(prio)
    } else {
        Err(ThrError::InvalidArgument)
    }
}

/// The run-queue level for a thread.
pub(crate) fn queue_level(active: Priority, policy: SchedPolicy, signal_boost: bool) -> usize {
    let mut level = active.clamp(MIN_PRIORITY, MAX_PRIORITY) as usize;
    if signal_boost {
        level += SIGNAL_PRIORITY;
    }
    if policy.is_realtime() {
        level += RT_PRIORITY;
    }
    debug_assert!(level < PRIORITY_LEVELS);
    level
}
