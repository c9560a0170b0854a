// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thread-specific data.
//!
//! A [`Key`] names one `usize` slot in every thread. Values are per thread,
//! keys are per runtime. Keys are recycled after `delete`; a sequence number
//! makes sure a recycled key doesn't see values stored under its
//! predecessor.

use std::sync::Arc;

use log::{trace, warn};

use crate::error::{ThrError, ThrResult};
use crate::runtime::Runtime;
use crate::threads::Thread;
use crate::tls::Environment;

/// Maximum number of keys that can exist at the same time.
pub const KEYS_MAX: usize = 256;

/// How often destructors are re-run when they store new values.
pub const DESTRUCTOR_ITERATIONS: usize = 4;

/// Called with a thread's non-zero value when the thread exits.
pub type Destructor = fn(usize);

#[derive(Clone, Copy, Debug, Default)]
struct KeyEntry {
    allocated: bool,
    seqno: u64,
    destructor: Option<Destructor>,
}

/// Allocation state of all keys of a runtime.
pub(crate) struct KeyTable {
    entries: Vec<KeyEntry>,
}

impl KeyTable {
    pub(crate) fn new() -> Self {
        KeyTable {
            entries: vec![KeyEntry::default(); KEYS_MAX],
        }
    }

    fn valid(&self, key: Key) -> bool {
        match self.entries.get(key.index) {
            Some(e) => e.allocated && e.seqno == key.seqno,
            None => false,
        }
    }
}

/// A thread's value for one key.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SpecificSlot {
    seqno: u64,
    value: usize,
}

/// Handle of a thread-specific data key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    index: usize,
    seqno: u64,
}

impl Key {
    /// Allocates a key; every thread starts out with value 0 for it.
    pub fn create(destructor: Option<Destructor>) -> ThrResult<Key> {
        let rt = Runtime::current();
        let mut keys = rt.keys.lock();
        let (index, e) = keys
            .entries
            .iter_mut()
            .enumerate()
            .find(|(_, e)| !e.allocated)
            .ok_or(ThrError::ResourceExhausted)?;
        e.allocated = true;
        e.seqno += 1;
        e.destructor = destructor;
        trace!("created key {} (seqno {})", index, e.seqno);
        Ok(Key {
            index,
            seqno: e.seqno,
        })
    }

    /// Frees the key. Values stored under it are discarded without running
    /// the destructor.
    pub fn delete(self) -> ThrResult<()> {
        let rt = Runtime::current();
        let mut keys = rt.keys.lock();
        if !keys.valid(self) {
            return Err(ThrError::InvalidArgument);
        }
        let e = &mut keys.entries[self.index];
        e.allocated = false;
        e.destructor = None;
        Ok(())
    }

    /// Stores `value` for the calling thread.
    pub fn set(self, value: usize) -> ThrResult<()> {
        let me = Environment::current()?;
        if !me.rt.keys.lock().valid(self) {
            return Err(ThrError::InvalidArgument);
        }
        let mut slots = me.specific.lock();
        if slots.len() <= self.index {
            slots.resize(self.index + 1, SpecificSlot::default());
        }
        slots[self.index] = SpecificSlot {
            seqno: self.seqno,
            value,
        };
        Ok(())
    }

    /// The calling thread's value (0 if none was stored).
    pub fn get(self) -> usize {
        let me = match Environment::try_thread() {
            Some(me) => me,
            None => return 0,
        };
        let slots = me.specific.lock();
        match slots.get(self.index) {
            Some(s) if s.seqno == self.seqno => s.value,
            _ => 0,
        }
    }
}

/// Runs the destructors of all non-zero values of an exiting thread.
///
/// Values are cleared before their destructor runs. Destructors that store
/// new values cause another round, up to [`DESTRUCTOR_ITERATIONS`].
pub(crate) fn run_destructors(me: &Arc<Thread>) {
    for _round in 0..DESTRUCTOR_ITERATIONS {
        let mut pending = Vec::new();
        {
            let keys = me.rt.keys.lock();
            let mut slots = me.specific.lock();
            for (index, slot) in slots.iter_mut().enumerate() {
                if slot.value == 0 {
                    continue;
                }
                let e = &keys.entries[index];
                let value = core::mem::take(&mut slot.value);
                if e.allocated && e.seqno == slot.seqno {
                    if let Some(d) = e.destructor {
                        pending.push((d, value));
                    }
                }
            }
        }
        if pending.is_empty() {
            return;
        }
        for (d, value) in pending {
            d(value);
        }
    }

    if me.specific.lock().iter().any(|s| s.value != 0) {
        warn!(
            "{} still has thread-specific data after {} destructor rounds",
            me.id, DESTRUCTOR_ITERATIONS
        );
    }
}
