// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multi-process bulkhead behavior through the public API, driven by fork.
//!
//! Both phases live in one test so the binary never forks from two test
//! threads at once.

#![cfg(unix)]

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use semian::ResourceOptions;
use std::time::{Duration, Instant};

fn wait_for_exit(pid: Pid) -> i32 {
    loop {
        match waitpid(pid, None).expect("waitpid") {
            WaitStatus::Exited(_, code) => return code,
            WaitStatus::Signaled(..) => return -1,
            _ => continue,
        }
    }
}

fn poll_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn workers_register_across_processes_and_tickets_survive_sigkill() {
    // Phase 1: a forked worker that registers the same resource shows up in
    // the shared worker count, and its registration is undone on exit.
    let name = format!("xp-workers-{}", std::process::id());
    let options = ResourceOptions {
        quota: Some(0.5),
        timeout: Some(Duration::from_millis(100)),
        circuit_breaker: false,
        ..Default::default()
    };
    let resource = semian::register(&name, options.clone()).unwrap();
    let bulkhead = resource.bulkhead().unwrap();
    assert_eq!(bulkhead.registered_workers().unwrap(), 1);
    assert_eq!(bulkhead.tickets().unwrap(), 1);

    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            semian::after_fork();
            let code = match semian::register(&name, options.clone()) {
                Ok(child_resource) => {
                    match child_resource
                        .bulkhead()
                        .and_then(|b| b.registered_workers().ok())
                    {
                        Some(2) => 0,
                        _ => 1,
                    }
                }
                Err(_) => 2,
            };
            unsafe { libc::_exit(code) };
        }
        ForkResult::Parent { child } => {
            assert_eq!(wait_for_exit(child), 0, "child saw a wrong worker count");
        }
    }

    // The child's registration is reaped by kernel undo on exit.
    assert!(
        poll_until(Duration::from_secs(2), || {
            bulkhead.registered_workers().unwrap() == 1
        }),
        "child worker registration was never undone"
    );
    semian::destroy(&name).unwrap();

    // Phase 2: SIGKILL-ing a ticket holder returns the ticket.
    let name = format!("xp-undo-{}", std::process::id());
    let resource = semian::register(
        &name,
        ResourceOptions {
            tickets: Some(1),
            timeout: Some(Duration::from_millis(50)),
            circuit_breaker: false,
            ..Default::default()
        },
    )
    .unwrap();
    let bulkhead = resource.bulkhead().unwrap();

    let child = match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            // Hold the only ticket until SIGKILL. The guard is leaked on
            // purpose: only kernel undo may release it.
            match bulkhead.ticket(None) {
                Ok(guard) => {
                    std::mem::forget(guard);
                    loop {
                        unsafe { libc::pause() };
                    }
                }
                Err(_) => unsafe { libc::_exit(3) },
            }
        }
        ForkResult::Parent { child } => child,
    };

    assert!(
        poll_until(Duration::from_secs(2), || bulkhead.count().unwrap() == 0),
        "child never took the ticket"
    );
    kill(child, Signal::SIGKILL).unwrap();
    assert_eq!(wait_for_exit(child), -1);

    let ticket = bulkhead.ticket(Some(Duration::from_secs(2)));
    assert!(ticket.is_ok(), "ticket was not returned after SIGKILL");
    drop(ticket);

    semian::destroy(&name).unwrap();
}
