// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Carriers: the OS threads that host user threads.
//!
//! A carrier provides the stack and machine context of one user thread at a
//! time. It only runs while a KSE has dispatched its user thread; the rest of
//! the time it is parked on a command queue. Once its thread is collected a
//! carrier goes back to a free list and can host the next thread.

use core::fmt;
use std::sync::Arc;
use std::thread;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::sync::{Parker, Unparker};
use log::{error, trace};

use crate::error::{ThrError, ThrResult};
use crate::kse::Kse;
use crate::stack::StackSpec;
use crate::tls::Environment;

/// The body of a user thread.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum CarrierCmd {
    /// Host a new user thread.
    Start(Job),
    /// Continue the hosted thread on the given KSE.
    Resume(Arc<Kse>),
    /// Exit the OS thread.
    Retire,
}

impl fmt::Debug for CarrierCmd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CarrierCmd::Start(_) => write!(f, "Start"),
            CarrierCmd::Resume(k) => write!(f, "Resume({:?})", k.id),
            CarrierCmd::Retire => write!(f, "Retire"),
        }
    }
}

pub(crate) struct Carrier {
    pub(crate) id: usize,
    cmds: ArrayQueue<CarrierCmd>,
    unparker: Unparker,
    stack: StackSpec,
    /// The OS thread that called `block_on`; never recycled.
    adopted: bool,
}

impl fmt::Debug for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Carrier#{}", self.id)
    }
}

impl Carrier {
    /// Creates a carrier with its own OS thread.
    pub(crate) fn spawn(id: usize, stack: StackSpec) -> ThrResult<Arc<Carrier>> {
        let parker = Parker::new();
        let carrier = Arc::new(Carrier {
            id,
            cmds: ArrayQueue::new(4),
            unparker: parker.unparker().clone(),
            stack,
            adopted: false,
        });

        let c = carrier.clone();
        thread::Builder::new()
            .name(format!("carrier-{}", id))
            .stack_size(stack.reservation())
            .spawn(move || carrier_main(c, parker))
            .map_err(|e| {
                error!("Can't spawn carrier {}: {}", id, e);
                ThrError::ResourceExhausted
            })?;

        trace!("spawned carrier {} with {:?}", id, stack);
        Ok(carrier)
    }

    /// Turns the calling OS thread into a carrier.
    pub(crate) fn adopt(id: usize) -> Arc<Carrier> {
        let parker = Parker::new();
        let carrier = Arc::new(Carrier {
            id,
            cmds: ArrayQueue::new(4),
            unparker: parker.unparker().clone(),
            stack: StackSpec::default(),
            adopted: true,
        });
        Environment::install_parker(parker);
        carrier
    }

    pub(crate) fn is_adopted(&self) -> bool {
        self.adopted
    }

    /// Can this carrier host a thread that wants `stack`?
    pub(crate) fn fits(&self, stack: &StackSpec) -> bool {
        !self.adopted && self.stack.size() == stack.size() && self.stack.guard() == stack.guard()
    }

    fn send(&self, cmd: CarrierCmd) {
        if let Err(cmd) = self.cmds.push(cmd) {
            fatal!("Carrier {} command queue overflow ({:?})", self.id, cmd);
        }
        self.unparker.unpark();
    }

    pub(crate) fn start(&self, job: Job) {
        self.send(CarrierCmd::Start(job));
    }

    pub(crate) fn resume(&self, kse: Arc<Kse>) {
        self.send(CarrierCmd::Resume(kse));
    }

    pub(crate) fn retire(&self) {
        self.send(CarrierCmd::Retire);
    }

    /// Parks until a KSE dispatches the hosted thread.
    ///
    /// Must be called on the carrier's own OS thread.
    pub(crate) fn wait_resume(&self) -> Arc<Kse> {
        loop {
            match self.cmds.pop() {
                Some(CarrierCmd::Resume(kse)) => return kse,
                Some(cmd) => fatal!("Carrier {} got {:?} while hosting a thread", self.id, cmd),
                None => Environment::park(),
            }
        }
    }
}

fn carrier_main(carrier: Arc<Carrier>, parker: Parker) {
    Environment::install_parker(parker);
    loop {
        match carrier.cmds.pop() {
            Some(CarrierCmd::Start(job)) => {
                job();
                Environment::set_thread(None);
                Environment::clear_kse();
            }
            Some(CarrierCmd::Retire) => break,
            Some(cmd) => fatal!("Idle carrier {} got {:?}", carrier.id, cmd),
            None => Environment::park(),
        }
    }
    trace!("carrier {} exits", carrier.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_queue::ArrayQueue;
    use std::time::{Duration, Instant};

    #[test]
    fn runs_jobs_in_order() {
        let _r = env_logger::try_init();
        let c = Carrier::spawn(1, StackSpec::default()).expect("Can't spawn carrier");
        let seen: Arc<ArrayQueue<usize>> = Arc::new(ArrayQueue::new(4));
        for i in 0..3 {
            let seen = seen.clone();
            c.start(Box::new(move || {
                assert!(seen.push(i).is_ok());
            }));
        }

        let start = Instant::now();
        while seen.len() < 3 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(seen.pop(), Some(0));
        assert_eq!(seen.pop(), Some(1));
        assert_eq!(seen.pop(), Some(2));
        c.retire();
    }

    #[test]
    fn stack_reuse() {
        let c = Carrier::adopt(7);
        assert!(c.is_adopted());
        assert!(!c.fits(&StackSpec::default()));
    }
}
