// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Priority run queue.
//!
//! One FIFO list per queue level. The lists are doubly linked through a
//! table keyed by `ThreadId` so a member can be removed in O(1). A two-word
//! bitmap records which levels are non-empty; finding the highest level is a
//! `leading_zeros` per word.

use hashbrown::HashMap;
use log::trace;

use crate::priority::PRIORITY_LEVELS;
use crate::threads::{Membership, ThreadId};

/// What the run queue needs to know about a queued thread.
pub(crate) trait Schedulable {
    fn tid(&self) -> ThreadId;
    fn queue_level(&self) -> usize;
    fn membership(&self) -> Membership;
    fn set_membership(&mut self, m: Membership);
    fn suspend_requested(&self) -> bool;
    fn mark_suspended(&mut self);
}

#[derive(Clone, Copy, Debug, Default)]
struct Level {
    head: Option<ThreadId>,
    tail: Option<ThreadId>,
}

#[derive(Clone, Copy, Debug)]
struct Link {
    level: usize,
    prev: Option<ThreadId>,
    next: Option<ThreadId>,
}

pub(crate) struct RunQueue {
    levels: [Level; PRIORITY_LEVELS],
    links: HashMap<ThreadId, Link>,
    /// Bit `p` is set iff `levels[p]` is non-empty.
    bits: [u64; 2],
}

static_assertions::const_assert!(PRIORITY_LEVELS <= 128);

impl Default for RunQueue {
    fn default() -> Self {
        RunQueue::new()
    }
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        RunQueue {
            levels: [Level::default(); PRIORITY_LEVELS],
            links: HashMap::with_capacity(64),
            bits: [0; 2],
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.bits[0] == 0 && self.bits[1] == 0
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, tid: ThreadId) -> bool {
        self.links.contains_key(&tid)
    }

    /// Highest level that has queued threads.
    pub(crate) fn highest_level(&self) -> Option<usize> {
        if self.bits[1] != 0 {
            Some(127 - self.bits[1].leading_zeros() as usize)
        } else if self.bits[0] != 0 {
            Some(63 - self.bits[0].leading_zeros() as usize)
        } else {
            None
        }
    }

    fn set_bit(&mut self, p: usize) {
        self.bits[p / 64] |= 1u64 << (p % 64);
    }

    fn clear_bit(&mut self, p: usize) {
        self.bits[p / 64] &= !(1u64 << (p % 64));
    }

    /// Checks whether `t` may be queued. Returns false if it got suspended
    /// instead.
    fn admit<T: Schedulable>(&self, t: &mut T) -> bool {
        if t.membership() != Membership::None || self.links.contains_key(&t.tid()) {
            fatal!(
                "Thread {} already in a queue ({:?})?",
                t.tid(),
                t.membership()
            );
        }
        if t.suspend_requested() {
            t.mark_suspended();
            return false;
        }
        true
    }

    /// Puts `t` at the front of its level.
    pub(crate) fn insert_head<T: Schedulable>(&mut self, t: &mut T) {
        if !self.admit(t) {
            return;
        }
        let tid = t.tid();
        let p = t.queue_level();
        let old_head = self.levels[p].head;
        self.links.insert(
            tid,
            Link {
                level: p,
                prev: None,
                next: old_head,
            },
        );
        match old_head {
            Some(h) => self.link_mut(h).prev = Some(tid),
            None => self.levels[p].tail = Some(tid),
        }
        self.levels[p].head = Some(tid);
        self.set_bit(p);
        t.set_membership(Membership::RunQueue);
        trace!("runq: {} at head of level {}", tid, p);
    }

    /// Puts `t` at the back of its level.
    pub(crate) fn insert_tail<T: Schedulable>(&mut self, t: &mut T) {
        if !self.admit(t) {
            return;
        }
        let tid = t.tid();
        let p = t.queue_level();
        let old_tail = self.levels[p].tail;
        self.links.insert(
            tid,
            Link {
                level: p,
                prev: old_tail,
                next: None,
            },
        );
        match old_tail {
            Some(h) => self.link_mut(h).next = Some(tid),
            None => self.levels[p].head = Some(tid),
        }
        self.levels[p].tail = Some(tid);
        self.set_bit(p);
        t.set_membership(Membership::RunQueue);
        trace!("runq: {} at tail of level {}", tid, p);
    }

    fn link_mut(&mut self, tid: ThreadId) -> &mut Link {
        match self.links.get_mut(&tid) {
            Some(l) => l,
            None => fatal!("Run queue link for {} is missing", tid),
        }
    }

    fn unlink(&mut self, tid: ThreadId) {
        let link = match self.links.remove(&tid) {
            Some(l) => l,
            None => fatal!("Thread {} is not in the run queue", tid),
        };
        match link.prev {
            Some(p) => self.link_mut(p).next = link.next,
            None => self.levels[link.level].head = link.next,
        }
        match link.next {
            Some(n) => self.link_mut(n).prev = link.prev,
            None => self.levels[link.level].tail = link.prev,
        }
        if self.levels[link.level].head.is_none() {
            self.clear_bit(link.level);
        }
    }

    /// Takes `t` out of the queue.
    pub(crate) fn remove<T: Schedulable>(&mut self, t: &mut T) {
        if t.membership() != Membership::RunQueue {
            fatal!(
                "Removing {} from the run queue but it is in {:?}",
                t.tid(),
                t.membership()
            );
        }
        self.unlink(t.tid());
        t.set_membership(Membership::None);
    }

    /// Pops the first runnable thread of the highest non-empty level.
    ///
    /// Threads that got a suspend request while queued are marked suspended
    /// and dropped from the queue.
    pub(crate) fn first<T: Schedulable>(
        &mut self,
        threads: &mut HashMap<ThreadId, T>,
    ) -> Option<ThreadId> {
        while let Some(p) = self.highest_level() {
            let tid = match self.levels[p].head {
                Some(tid) => tid,
                None => fatal!("Level {} is marked non-empty but has no head", p),
            };
            self.unlink(tid);
            let t = match threads.get_mut(&tid) {
                Some(t) => t,
                None => fatal!("Queued thread {} is not a member of the group", tid),
            };
            t.set_membership(Membership::None);
            if t.suspend_requested() {
                t.mark_suspended();
                continue;
            }
            return Some(tid);
        }
        None
    }

    /// Queued thread ids from the highest level down, FIFO within a level.
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        (0..PRIORITY_LEVELS).rev().flat_map(move |p| {
            let mut cur = self.levels[p].head;
            core::iter::from_fn(move || {
                let tid = cur?;
                cur = self.links.get(&tid).and_then(|l| l.next);
                Some(tid)
            })
        })
    }
}
