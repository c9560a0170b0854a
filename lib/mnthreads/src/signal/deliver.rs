// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Picks the thread that gets a signal and interrupts it.

use core::sync::atomic::Ordering;
use std::sync::Arc;

use log::trace;

use crate::runtime::Runtime;
use crate::threads::{Membership, Thread, ThreadFlags, ThreadState, WaitOn, Wakeup};
use crate::tls::Environment;
use crate::wait;

use super::{os, SigHandler, SigInfo};

enum Interrupt {
    Nothing,
    Backout(u64, WaitOn),
    Default,
}

/// Delivers a thread-directed signal to `t`.
pub(super) fn to_thread(rt: &Arc<Runtime>, t: &Arc<Thread>, info: SigInfo) {
    let sig = info.signo;
    let interrupt = {
        let sigs = rt.signals.lock();
        let mut st = t.kseg.lock();
        let s = match st.try_sched(t.id) {
            Some(s) if s.state != ThreadState::Dead => s,
            _ => return,
        };

        if s.state == ThreadState::SigWait && s.sig.waitset.contains(sig) {
            trace!("{} sigwaits for {}", t.id, sig);
            s.sig.caught = Some(info);
            st.finish_wait(t.id, Wakeup::Event);
            return;
        }
        if sigs.ignored(sig) {
            return;
        }

        s.sig.pending.insert(sig);
        s.sig.info[sig as usize] = Some(info);
        if s.sig.mask.contains(sig) {
            trace!("{} keeps {} pending", t.id, sig);
            return;
        }
        t.sigcheck.store(true, Ordering::Release);

        if s.flags.contains(ThreadFlags::IN_KERNEL) {
            // Picked up when the blocking section completes.
            Interrupt::Nothing
        } else if s.state.is_blocked() || s.state == ThreadState::Deadlock {
            match s.wait_on.clone() {
                Some(on) => Interrupt::Backout(s.wait_gen, on),
                None => Interrupt::Nothing,
            }
        } else if s.membership == Membership::RunQueue {
            s.flags.insert(ThreadFlags::SIG_BOOST);
            st.requeue(t.id);
            Interrupt::Nothing
        } else if s.state == ThreadState::Running {
            Interrupt::Nothing
        } else if matches!(sigs.action(sig).handler, SigHandler::Default) {
            // Suspended with a fatal signal: nobody would run it.
            Interrupt::Default
        } else {
            Interrupt::Nothing
        }
    };

    match interrupt {
        Interrupt::Nothing => {}
        Interrupt::Backout(gen, on) => wait::backout(t, gen, &on, Wakeup::Signaled),
        Interrupt::Default => os::default_action(sig),
    }
}

fn unmasked(t: &Arc<Thread>, sig: i32) -> bool {
    let mut st = t.kseg.lock();
    match st.try_sched(t.id) {
        Some(s) => {
            s.state != ThreadState::Dead
                && !s.flags.contains(ThreadFlags::EXITING)
                && !s.sig.mask.contains(sig)
        }
        None => false,
    }
}

fn in_state(t: &Arc<Thread>, state: ThreadState) -> bool {
    let mut st = t.kseg.lock();
    matches!(st.try_sched(t.id), Some(s) if s.state == state)
}

/// Delivers a process-directed signal.
pub(super) fn to_process(rt: &Arc<Runtime>, info: SigInfo) {
    let sig = info.signo;
    let threads = rt.all_threads();
    let caller = Environment::try_thread().filter(|me| Arc::ptr_eq(&me.rt, rt));

    let target = {
        let mut sigs = rt.signals.lock();

        for t in threads.iter() {
            let mut st = t.kseg.lock();
            if let Some(s) = st.try_sched(t.id) {
                if s.state == ThreadState::SigWait && s.sig.waitset.contains(sig) {
                    trace!("{} sigwaits for process signal {}", t.id, sig);
                    s.sig.caught = Some(info);
                    st.finish_wait(t.id, Wakeup::Event);
                    return;
                }
            }
        }

        if sigs.ignored(sig) {
            return;
        }
        if let SigHandler::Default = sigs.action(sig).handler {
            drop(sigs);
            os::default_action(sig);
            return;
        }

        let target = caller
            .filter(|me| unmasked(me, sig))
            .or_else(|| {
                threads
                    .iter()
                    .find(|t| in_state(t, ThreadState::SigSuspend) && unmasked(t, sig))
                    .cloned()
            })
            .or_else(|| threads.iter().find(|t| unmasked(t, sig)).cloned());

        match target {
            Some(t) => t,
            None => {
                trace!("process signal {} stays pending", sig);
                sigs.add_pending(info);
                return;
            }
        }
    };

    to_thread(rt, &target, info);
}
