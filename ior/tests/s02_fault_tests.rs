// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reboots and panics of fake root domains.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use ior::error::IorError;
use ior::executor::Remote;
use ior::fault::{spawn_fault_thread, FaultInjector, FaultKind, FaultRequest, KernelFlavor};
use ior::report::Reporter;
use ior::signal::CoordinationSignal;

use testutils::fake_target::FakeTarget;
use testutils::{pty_connector, FAST};

fn injector(target: &FakeTarget, tmp: &TempDir) -> FaultInjector {
    let remote = Remote::new(target.endpoint(), pty_connector(), FAST.clone());
    FaultInjector::new(remote, tmp.path()).crash_dir(&target.crash_dir().display().to_string())
}

#[test]
fn s02_reboot_waits_for_console_login() {
    let _r = env_logger::try_init();
    let target = FakeTarget::builder("nprd-a")
        .console_login()
        .build()
        .expect("fake target");
    let tmp = TempDir::new().expect("tmp");

    injector(&target, &tmp)
        .reboot(2, FAST.fault)
        .expect("reboot");
    assert_eq!(target.logins(), 2);
}

#[test]
fn s02_kernel_flavor() {
    let _r = env_logger::try_init();
    let tmp = TempDir::new().expect("tmp");

    let plain = FakeTarget::builder("nprd-a").build().expect("fake target");
    assert_eq!(
        injector(&plain, &tmp).kernel_flavor().expect("flavor"),
        KernelFlavor::NonDebug
    );

    let debug = FakeTarget::builder("nprd-b")
        .debug_kernel()
        .build()
        .expect("fake target");
    assert_eq!(
        injector(&debug, &tmp).kernel_flavor().expect("flavor"),
        KernelFlavor::Debug
    );
}

/// A non-debug kernel leaves a dump, which is emptied again.
#[test]
fn s02_panic_cleans_its_crash_dump() {
    let _r = env_logger::try_init();
    let target = FakeTarget::builder("nprd-a")
        .console_login()
        .build()
        .expect("fake target");
    let tmp = TempDir::new().expect("tmp");

    injector(&target, &tmp)
        .panic(1, FAST.fault)
        .expect("panic");

    assert_eq!(target.crash_dumps(), vec!["0".to_string()]);
    assert!(target.crash_files().is_empty());

    let prev = std::fs::read_to_string(tmp.path().join("prev_crash_list")).expect("prev");
    let post = std::fs::read_to_string(tmp.path().join("post_crash_list")).expect("post");
    assert_eq!(prev.trim(), "");
    assert_eq!(post.trim(), "0");
}

/// A debug kernel stops in kmdb and is reset over the console, also when
/// the console has to be taken over first.
#[test]
fn s02_debug_panic_resets_from_kmdb() {
    let _r = env_logger::try_init();
    let tmp = TempDir::new().expect("tmp");

    for contended in &[false, true] {
        let mut builder = FakeTarget::builder("nprd-b").console_login().debug_kernel();
        if *contended {
            builder = builder.contended();
        }
        let target = builder.build().expect("fake target");

        injector(&target, &tmp)
            .panic(1, FAST.fault)
            .expect("panic");
        assert!(!target.in_kmdb());
        assert!(target.crash_dumps().is_empty());
        // Flavor probe and the panic itself, the reset needs no login.
        assert_eq!(target.logins(), 2);
    }
}

/// The signal is up exactly once for a fault thread, however the fault
/// ends.
#[test]
fn s02_fault_thread_signal_lifecycle() {
    let _r = env_logger::try_init();
    let tmp = TempDir::new().expect("tmp");
    let target = FakeTarget::builder("nprd-a")
        .console_login()
        .build()
        .expect("fake target");
    let reporter = Arc::new(Reporter::console());

    let request = FaultRequest {
        target: target.endpoint(),
        kind: FaultKind::Reboot,
        count: 1,
        timeout: FAST.fault,
    };
    let signal = CoordinationSignal::new();
    let handle = spawn_fault_thread(
        injector(&target, &tmp),
        request.clone(),
        &signal,
        reporter.clone(),
        Duration::from_millis(5),
    )
    .expect("spawn");
    assert_eq!(signal.raises(), 1);
    assert!(handle.join().expect("join").is_ok());
    assert_eq!((signal.raises(), signal.clears()), (1, 1));
    assert!(!signal.is_set());

    let failing = |_kind: FaultKind, _count: usize, _timeout: Duration| -> Result<(), IorError> {
        Err(IorError::NothingToCheck)
    };
    let signal = CoordinationSignal::new();
    let handle = spawn_fault_thread(
        failing,
        request.clone(),
        &signal,
        reporter.clone(),
        Duration::from_secs(3600),
    )
    .expect("spawn");
    assert!(handle.join().expect("join").is_err());
    assert_eq!((signal.raises(), signal.clears()), (1, 1));

    let panicking = |_kind: FaultKind, _count: usize, _timeout: Duration| -> Result<(), IorError> {
        panic!("disruptor went away");
    };
    let signal = CoordinationSignal::new();
    let handle = spawn_fault_thread(panicking, request, &signal, reporter, Duration::from_secs(3600))
        .expect("spawn");
    assert!(handle.join().is_err());
    assert_eq!((signal.raises(), signal.clears()), (1, 1));
}
