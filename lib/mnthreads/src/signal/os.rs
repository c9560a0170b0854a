// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Adapter between OS signals and the runtime.
//!
//! The OS handler only records the signal in [`OS_PENDING`] and writes a
//! byte to a pipe. A forwarding thread reads the pipe and passes the signals
//! to a KSE of every runtime that asked for them; the KSE delivers them
//! process-directed on its next activation.

use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::io;
use std::sync::{Arc, Weak};
use std::thread;

use lazy_static::lazy_static;
use log::{debug, error, info, trace, warn};
use once_cell::sync::OnceCell;

use crate::error::{ThrError, ThrResult};
use crate::kse::Kse;
use crate::runtime::Runtime;

use super::{check, default_action as disposition, deliver, unblockable, DefaultAction};
use super::{SigCode, SigInfo, SigSet, Signal};

/// Signals caught by the OS handler and not yet forwarded.
static OS_PENDING: AtomicU64 = AtomicU64::new(0);

/// Write end of the wakeup pipe (-1: not set up).
static PIPE_WR: AtomicI32 = AtomicI32::new(-1);

static FORWARDER: OnceCell<()> = OnceCell::new();

lazy_static! {
    /// Runtimes and the OS signals they receive.
    static ref REGISTRY: spin::Mutex<Vec<(Weak<Runtime>, SigSet)>> = spin::Mutex::new(Vec::new());
}

extern "C" fn on_os_signal(sig: libc::c_int) {
    if sig > 0 && (sig as usize) < super::NSIG {
        OS_PENDING.fetch_or(1u64 << (sig - 1), Ordering::AcqRel);
    }
    let fd = PIPE_WR.load(Ordering::Acquire);
    if fd >= 0 {
        let b = [0u8; 1];
        // A full pipe already guarantees a wakeup.
        unsafe {
            libc::write(fd, b.as_ptr() as *const libc::c_void, 1);
        }
    }
}

fn setup_forwarder() -> ThrResult<()> {
    FORWARDER
        .get_or_try_init(|| {
            let mut fds = [0 as libc::c_int; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                error!("Can't create signal pipe: {}", io::Error::last_os_error());
                return Err(ThrError::ResourceExhausted);
            }
            let (rd, wr) = (fds[0], fds[1]);
            unsafe {
                let flags = libc::fcntl(wr, libc::F_GETFL);
                libc::fcntl(wr, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }

            thread::Builder::new()
                .name("sigforward".to_string())
                .spawn(move || forward_main(rd))
                .map_err(|e| {
                    error!("Can't spawn signal forwarder: {}", e);
                    ThrError::ResourceExhausted
                })?;
            PIPE_WR.store(wr, Ordering::Release);
            Ok(())
        })
        .map(|_| ())
}

fn forward_main(rd: libc::c_int) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("Signal pipe broken: {}", err);
            return;
        }
        if n == 0 {
            return;
        }
        let bits = OS_PENDING.swap(0, Ordering::AcqRel);
        if bits != 0 {
            dispatch(SigSet::from_bits(bits));
        }
    }
}

/// Hands `set` to one KSE of each interested runtime.
fn dispatch(set: SigSet) {
    let targets: Vec<(Arc<Runtime>, SigSet)> = {
        let mut reg = REGISTRY.lock();
        reg.retain(|(rt, _)| rt.strong_count() > 0);
        reg.iter()
            .filter_map(|(rt, wanted)| rt.upgrade().map(|rt| (rt, wanted.intersection(set))))
            .filter(|(_, s)| !s.is_empty())
            .collect()
    };

    for (rt, set) in targets {
        let kse = {
            let primary = rt.primary();
            let st = primary.lock();
            st.idle.first().or_else(|| st.kses.first()).cloned()
        };
        match kse {
            Some(kse) => {
                trace!("forwarding {:?} to {:?}", set, kse);
                kse.note_signals(set);
                kse.kick();
            }
            // No KSE is running; deliver from here.
            None => deliver_set(&rt, set),
        }
    }
}

fn deliver_set(rt: &Arc<Runtime>, set: SigSet) {
    for sig in set.iter() {
        let info = SigInfo {
            signo: sig,
            code: SigCode::Kernel,
            sender: None,
            value: 0,
        };
        deliver::to_process(rt, info);
    }
}

/// Delivers the OS signals noted for `kse`.
pub(crate) fn poll(kse: &Arc<Kse>) {
    let set = kse.take_signals();
    if !set.is_empty() {
        debug!("{:?} delivers OS signals {:?}", kse, set);
        deliver_set(&kse.rt, set);
    }
}

/// Routes the OS signal `sig` into the calling thread's runtime, where it is
/// delivered process-directed.
pub fn forward_os_signal(sig: Signal) -> ThrResult<()> {
    check(sig)?;
    if unblockable(sig) {
        return Err(ThrError::InvalidArgument);
    }
    setup_forwarder()?;

    let rt = Runtime::current();
    {
        let mut reg = REGISTRY.lock();
        match reg
            .iter_mut()
            .find(|(r, _)| r.upgrade().map_or(false, |r| Arc::ptr_eq(&r, &rt)))
        {
            Some((_, set)) => set.insert(sig),
            None => reg.push((Arc::downgrade(&rt), SigSet::empty().with(sig))),
        }
    }

    let mut sa: libc::sigaction = unsafe { core::mem::zeroed() };
    sa.sa_sigaction = on_os_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    sa.sa_flags = libc::SA_RESTART;
    let rc = unsafe {
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(sig, &sa, core::ptr::null_mut())
    };
    if rc != 0 {
        warn!("sigaction({}) failed: {}", sig, io::Error::last_os_error());
        return Err(ThrError::InvalidArgument);
    }
    info!("forwarding OS signal {}", sig);
    Ok(())
}

/// Takes the default action of `sig` for the whole process.
pub(crate) fn default_action(sig: Signal) {
    match disposition(sig) {
        DefaultAction::Ignore | DefaultAction::Continue => {}
        DefaultAction::Stop => {
            warn!("signal {} stops the process", sig);
            unsafe {
                libc::raise(libc::SIGSTOP);
            }
        }
        DefaultAction::Terminate => {
            warn!("signal {} terminates the process", sig);
            unsafe {
                libc::signal(sig, libc::SIG_DFL);
                libc::raise(sig);
            }
            fatal!("still alive after default action of signal {}", sig);
        }
    }
}
