// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Timed wait queue.
//!
//! A vector sorted by descending deadline so the earliest deadline is last
//! and expiring entries are popped from the end. Entries without a deadline
//! (wait forever) sort before all timed ones and never expire.

use core::cmp::Ordering;
use std::time::Instant;

use log::trace;

use crate::threads::ThreadId;

/// What a wait-queue entry stands for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum EntryKind {
    /// The thread's membership is the wait queue itself (sleep, join,
    /// sigwait, sigsuspend).
    Sleeper,
    /// The thread sits in a mutex or condvar queue; this entry only carries
    /// its deadline.
    Timer,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct WaitEntry {
    pub(crate) deadline: Option<Instant>,
    pub(crate) tid: ThreadId,
    /// Wait generation of the thread when the entry was made.
    pub(crate) gen: u64,
    pub(crate) kind: EntryKind,
}

/// Orders deadlines with "forever" after everything else.
fn cmp_deadline(a: Option<Instant>, b: Option<Instant>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    entries: Vec<WaitEntry>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        WaitQueue {
            entries: Vec::with_capacity(64),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn contains(&self, tid: ThreadId) -> bool {
        self.entries.iter().any(|e| e.tid == tid)
    }

    /// Inserts an entry; threads with the same deadline expire in insertion
    /// order.
    pub(crate) fn insert(&mut self, entry: WaitEntry) {
        if self.contains(entry.tid) {
            panic!("Thread already in waitlist?");
        }
        // Everything before `pos` expires strictly later than `entry`, so the
        // new entry lands in front of the ones with an equal deadline (they
        // sit closer to the end and get popped first).
        let pos = self
            .entries
            .partition_point(|e| cmp_deadline(e.deadline, entry.deadline) == Ordering::Greater);
        self.entries.insert(pos, entry);
        trace!("Waitlist is {:?}", self.entries);
    }

    pub(crate) fn remove(&mut self, tid: ThreadId) -> Option<WaitEntry> {
        let pos = self.entries.iter().position(|e| e.tid == tid)?;
        Some(self.entries.remove(pos))
    }

    /// Earliest deadline in the queue.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.last().and_then(|e| e.deadline)
    }

    /// Pops every entry whose deadline is `<= now`, earliest first.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<WaitEntry> {
        let mut expired = Vec::new();
        while let Some(e) = self.entries.last() {
            match e.deadline {
                Some(d) if d <= now => {
                    if let Some(e) = self.entries.pop() {
                        expired.push(e);
                    }
                }
                _ => break,
            }
        }
        expired
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &WaitEntry> {
        self.entries.iter().rev()
    }
}
