// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Free lists for KSEs, KSEGs and carriers, and garbage collection of dead
//! threads.
//!
//! Everything here is protected by the allocator lock, which comes before
//! the thread-list lock and any KSEG lock.

use core::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, trace};

use crate::carrier::Carrier;
use crate::error::ThrResult;
use crate::kse::Kse;
use crate::kseg::Kseg;
use crate::runtime::Runtime;
use crate::stack::StackSpec;
use crate::threads::Thread;

#[derive(Default)]
pub(crate) struct FreeLists {
    /// Idle carriers, ready to host a thread.
    pub(crate) carriers: Vec<Arc<Carrier>>,
    /// Unassigned KSEs.
    pub(crate) kses: Vec<Arc<Kse>>,
    /// Empty KSEGs.
    pub(crate) ksegs: Vec<Arc<Kseg>>,
    /// KSEs that left their group; freed by the next GC pass.
    pub(crate) pending_kses: Vec<Arc<Kse>>,
    /// Groups whose last KSE left; freed by the next GC pass.
    pub(crate) pending_ksegs: Vec<Arc<Kseg>>,
    /// Terminated threads that still have a thread record.
    pub(crate) dead: Vec<Arc<Thread>>,
    /// Every KSE whose OS thread is alive.
    pub(crate) all_kses: Vec<Arc<Kse>>,
}

/// Gets an unassigned KSE, from the free list if possible.
pub(crate) fn kse_get(rt: &Arc<Runtime>) -> ThrResult<Arc<Kse>> {
    let cached = rt.alloc.lock().kses.pop();
    match cached {
        Some(kse) => Ok(kse),
        None => {
            let kse = Kse::spawn(rt.clone(), rt.next_kse_id())?;
            rt.alloc.lock().all_kses.push(kse.clone());
            Ok(kse)
        }
    }
}

/// Gets a KSE and assigns it to `kseg`.
pub(crate) fn kse_alloc(rt: &Arc<Runtime>, kseg: &Arc<Kseg>) -> ThrResult<Arc<Kse>> {
    let kse = kse_get(rt)?;
    trace!("{:?} -> {:?}", kse, kseg);
    kse.assign(kseg.clone());
    Ok(kse)
}

/// A KSE has left its (now empty) group.
pub(crate) fn kse_retire(rt: &Runtime, kse: &Arc<Kse>, kseg: &Arc<Kseg>, group_done: bool) {
    let mut fl = rt.alloc.lock();
    fl.pending_kses.push(kse.clone());
    if group_done {
        fl.pending_ksegs.push(kseg.clone());
    }
}

/// Gets an empty, non-primary KSEG.
pub(crate) fn kseg_alloc(rt: &Runtime) -> Arc<Kseg> {
    let cached = rt.alloc.lock().ksegs.pop();
    cached.unwrap_or_else(|| Arc::new(Kseg::new(rt.next_kseg_id(), false)))
}

/// Gets a carrier that runs on a stack like `stack`.
pub(crate) fn carrier_alloc(rt: &Runtime, stack: &StackSpec) -> ThrResult<Arc<Carrier>> {
    {
        let mut fl = rt.alloc.lock();
        if let Some(pos) = fl.carriers.iter().position(|c| c.fits(stack)) {
            return Ok(fl.carriers.swap_remove(pos));
        }
    }
    Carrier::spawn(rt.next_carrier_id(), *stack)
}

/// Returns an unused carrier to the free list.
pub(crate) fn carrier_free(rt: &Runtime, carrier: Arc<Carrier>) {
    if carrier.is_adopted() {
        return;
    }
    let mut fl = rt.alloc.lock();
    if fl.carriers.len() < rt.config.thread_cache {
        fl.carriers.push(carrier);
    } else {
        drop(fl);
        carrier.retire();
    }
}

/// Records a terminated thread for the garbage collector.
pub(crate) fn thread_dead(rt: &Runtime, t: Arc<Thread>) {
    rt.alloc.lock().dead.push(t);
    rt.dead.fetch_add(1, Ordering::AcqRel);
}

/// Can the record of this dead thread be dropped?
fn collectable(t: &Thread) -> bool {
    if !t.kse_done.load(Ordering::Acquire) || t.refcount.load(Ordering::Acquire) > 0 {
        return false;
    }
    let js = t.join.lock();
    js.detached || js.joined
}

/// Collects dead threads that are detached (or joined) and no longer
/// referenced, recycles their carriers and frees retired KSEs and KSEGs.
pub(crate) fn gc(rt: &Runtime) {
    let mut retire = Vec::new();
    let mut destroy = Vec::new();
    let mut collected = 0;
    {
        let mut fl = rt.alloc.lock();
        let mut threads = rt.threads.lock();

        let dead = core::mem::take(&mut fl.dead);
        for t in dead {
            if !collectable(&t) {
                fl.dead.push(t);
                continue;
            }
            threads.remove(&t.id);
            collected += 1;
            let carrier = t.carrier.clone();
            if carrier.is_adopted() {
                continue;
            }
            if fl.carriers.len() < rt.config.thread_cache {
                fl.carriers.push(carrier);
            } else {
                retire.push(carrier);
            }
        }
        drop(threads);

        for kse in core::mem::take(&mut fl.pending_kses) {
            if fl.kses.len() < rt.config.kse_cache {
                fl.kses.push(kse);
            } else {
                destroy.push(kse);
            }
        }
        for kseg in core::mem::take(&mut fl.pending_ksegs) {
            if fl.ksegs.len() < rt.config.kseg_cache && kseg.lock().is_empty() {
                fl.ksegs.push(kseg);
            }
        }
    }
    rt.dead.fetch_sub(collected, Ordering::AcqRel);

    if collected > 0 || !retire.is_empty() || !destroy.is_empty() {
        debug!(
            "gc: collected {} threads, retired {} carriers, destroyed {} KSEs",
            collected,
            retire.len(),
            destroy.len()
        );
    }
    for c in retire {
        c.retire();
    }
    for k in destroy {
        k.destroy();
    }
}

/// Runs the collector once enough dead threads piled up.
pub(crate) fn maybe_gc(rt: &Runtime) {
    if rt.dead.load(Ordering::Acquire) >= rt.config.gc_watermark {
        gc(rt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn carriers_are_reused_by_stack_geometry() {
        let _r = env_logger::try_init();
        let rt = Runtime::new(Config::default());
        let c = carrier_alloc(&rt, &StackSpec::default()).expect("Can't get a carrier");
        rt.alloc.lock().carriers.push(c.clone());

        let big = StackSpec::from_size(4 << 20);
        let c2 = carrier_alloc(&rt, &big).expect("Can't get a carrier");
        assert_ne!(c.id, c2.id);
        let c3 = carrier_alloc(&rt, &StackSpec::default()).expect("Can't get a carrier");
        assert_eq!(c.id, c3.id);
        assert!(rt.alloc.lock().carriers.is_empty());
        c2.retire();
        c3.retire();
    }

    #[test]
    fn ksegs_are_recycled_after_gc() {
        let rt = Runtime::new(Config::default());
        let g = kseg_alloc(&rt);
        assert!(!g.primary);
        rt.alloc.lock().pending_ksegs.push(g.clone());
        gc(&rt);
        let g2 = kseg_alloc(&rt);
        assert_eq!(g.id, g2.id);
    }
}
