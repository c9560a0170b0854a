// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! OS signals forwarded into a runtime.
//!
//! Lives in its own test binary since the OS handler is process-wide.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mnthreads::{forward_os_signal, sigaction, Config, Runtime, SigAction, SigCode, ThrError};

#[test]
fn os_signal_reaches_handler() {
    let _r = env_logger::try_init();
    let rt = Runtime::new(Config {
        concurrency: 1,
        ..Default::default()
    });
    let hits = Arc::new(AtomicUsize::new(0));
    let (h, seen) = (hits.clone(), hits.clone());
    rt.block_on(move || {
        sigaction(
            libc::SIGUSR1,
            Some(SigAction::handler(move |info| {
                assert_eq!(info.code, SigCode::Kernel);
                assert_eq!(info.sender, None);
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(
            forward_os_signal(libc::SIGKILL),
            Err(ThrError::InvalidArgument)
        );
        forward_os_signal(libc::SIGUSR1).unwrap();

        unsafe {
            libc::kill(libc::getpid(), libc::SIGUSR1);
        }
        for _ in 0..2000 {
            if seen.load(Ordering::SeqCst) > 0 {
                break;
            }
            // Interrupted once the handler ran on this thread.
            let _ = mnthreads::sleep(Duration::from_millis(1));
        }
    });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
