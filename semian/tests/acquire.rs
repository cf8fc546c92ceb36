// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end breaker behavior through the public API.

use semian::{
    AcquireError, AcquireOptions, CircuitState, Error, Event, MarksCircuits, ResourceOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("dependency exploded")]
struct SomeError;
impl MarksCircuits for SomeError {}

fn unique(name: &str) -> String {
    format!("{name}-{}", std::process::id())
}

fn breaker_options() -> ResourceOptions {
    ResourceOptions {
        bulkhead: false,
        ..Default::default()
    }
}

fn fail(resource: &semian::Resource) -> Result<i32, AcquireError<SomeError>> {
    resource.acquire(AcquireOptions::default(), || Err(SomeError))
}

fn succeed(resource: &semian::Resource) -> Result<i32, AcquireError<SomeError>> {
    resource.acquire(AcquireOptions::default(), || Ok(1))
}

#[test]
fn opens_after_the_error_threshold() {
    let name = unique("e2e-threshold");
    let resource = semian::register(
        &name,
        ResourceOptions {
            error_threshold: Some(2),
            error_timeout: Some(Duration::from_secs(5)),
            success_threshold: Some(1),
            ..breaker_options()
        },
    )
    .unwrap();

    assert!(fail(&resource).is_err());
    assert!(fail(&resource).is_err());

    let ran = AtomicUsize::new(0);
    let err = resource
        .acquire::<i32, SomeError, _>(AcquireOptions::default(), || {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        })
        .unwrap_err();
    assert!(matches!(
        err,
        AcquireError::Guard(Error::OpenCircuit { .. })
    ));
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    semian::destroy(&name).unwrap();
}

#[test]
fn recovers_through_a_half_open_probe() {
    let name = unique("e2e-recovery");
    let resource = semian::register(
        &name,
        ResourceOptions {
            error_threshold: Some(2),
            error_timeout: Some(Duration::from_millis(100)),
            success_threshold: Some(1),
            ..breaker_options()
        },
    )
    .unwrap();

    assert!(fail(&resource).is_err());
    assert!(fail(&resource).is_err());
    assert_eq!(resource.circuit_state(), Some(CircuitState::Open));
    assert!(!resource.request_allowed());

    std::thread::sleep(Duration::from_millis(150));
    assert!(resource.request_allowed());
    // Asking must not have transitioned anything.
    assert_eq!(resource.circuit_state(), Some(CircuitState::Open));

    // The probe runs and closes the circuit.
    assert_eq!(succeed(&resource).unwrap(), 1);
    assert_eq!(resource.circuit_state(), Some(CircuitState::Closed));
    assert_eq!(succeed(&resource).unwrap(), 1);

    semian::destroy(&name).unwrap();
}

#[test]
fn lumping_dedupes_error_bursts() {
    let name = unique("e2e-lumping");
    let resource = semian::register(
        &name,
        ResourceOptions {
            error_threshold: Some(3),
            error_timeout: Some(Duration::from_secs(10)),
            lumping_interval: Some(Duration::from_millis(100)),
            ..breaker_options()
        },
    )
    .unwrap();

    // A burst inside one lumping interval counts once.
    for _ in 0..6 {
        assert!(fail(&resource).is_err());
    }
    assert_eq!(resource.circuit_state(), Some(CircuitState::Closed));

    std::thread::sleep(Duration::from_millis(150));
    for _ in 0..6 {
        assert!(fail(&resource).is_err());
    }
    assert_eq!(resource.circuit_state(), Some(CircuitState::Closed));

    std::thread::sleep(Duration::from_millis(150));
    assert!(fail(&resource).is_err());
    assert_eq!(resource.circuit_state(), Some(CircuitState::Open));

    semian::destroy(&name).unwrap();
}

#[test]
fn dynamic_backoff_grows_between_failed_probes() {
    let name = unique("e2e-backoff");
    let resource = semian::register(
        &name,
        ResourceOptions {
            error_threshold: Some(1),
            dynamic_timeout: true,
            ..breaker_options()
        },
    )
    .unwrap();
    let breaker = resource.circuit_breaker().unwrap();

    assert!(fail(&resource).is_err());
    assert_eq!(resource.circuit_state(), Some(CircuitState::Open));
    assert_eq!(breaker.error_timeout(), Duration::from_millis(500));

    // Probe too early: still rejected, schedule unchanged.
    assert!(matches!(
        fail(&resource).unwrap_err(),
        AcquireError::Guard(Error::OpenCircuit { .. })
    ));
    assert_eq!(breaker.error_timeout(), Duration::from_millis(500));

    // Failed probe after the cooldown: the timeout doubles.
    std::thread::sleep(Duration::from_millis(600));
    assert!(matches!(
        fail(&resource).unwrap_err(),
        AcquireError::Work(_)
    ));
    assert_eq!(breaker.error_timeout(), Duration::from_secs(1));

    // A successful probe resets the schedule.
    std::thread::sleep(Duration::from_millis(1_100));
    assert_eq!(succeed(&resource).unwrap(), 1);
    assert_eq!(resource.circuit_state(), Some(CircuitState::Closed));
    assert_eq!(breaker.error_timeout(), Duration::from_millis(500));

    semian::destroy(&name).unwrap();
}

#[test]
fn opening_publishes_exactly_one_state_change() {
    let name = unique("e2e-events");
    let opens = Arc::new(AtomicUsize::new(0));
    let captured = Arc::clone(&opens);
    let subscription = semian::subscribe(Some(&name), move |event| {
        if matches!(
            event,
            Event::StateChange {
                state: CircuitState::Open,
                ..
            }
        ) {
            captured.fetch_add(1, Ordering::SeqCst);
        }
    });

    let resource = semian::register(
        &name,
        ResourceOptions {
            error_threshold: Some(2),
            error_timeout: Some(Duration::from_secs(5)),
            ..breaker_options()
        },
    )
    .unwrap();

    assert!(fail(&resource).is_err());
    assert!(fail(&resource).is_err());
    assert_eq!(resource.circuit_state(), Some(CircuitState::Open));
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    // Further rejected calls do not re-publish the transition.
    let _ = succeed(&resource);
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    semian::unsubscribe(subscription);
    semian::destroy(&name).unwrap();
}

#[test]
fn reset_returns_to_closed() {
    let name = unique("e2e-reset");
    let resource = semian::register(
        &name,
        ResourceOptions {
            error_threshold: Some(1),
            error_timeout: Some(Duration::from_secs(60)),
            ..breaker_options()
        },
    )
    .unwrap();

    assert!(fail(&resource).is_err());
    assert_eq!(resource.circuit_state(), Some(CircuitState::Open));

    resource.reset();
    assert_eq!(resource.circuit_state(), Some(CircuitState::Closed));
    assert!(resource.request_allowed());
    assert_eq!(succeed(&resource).unwrap(), 1);

    semian::destroy(&name).unwrap();
}

#[test]
fn registration_round_trips_through_lookup() {
    let name = unique("e2e-lookup");
    let options = ResourceOptions {
        error_threshold: Some(2),
        error_timeout: Some(Duration::from_secs(5)),
        ..breaker_options()
    };
    let registered = semian::register(&name, options.clone()).unwrap();
    let found = semian::lookup(&name).unwrap();
    assert!(Arc::ptr_eq(&registered, &found));

    // Identical options: a no-op returning the same resource.
    let again = semian::register(&name, options).unwrap();
    assert!(Arc::ptr_eq(&registered, &again));

    let err = semian::register(
        &name,
        ResourceOptions {
            error_threshold: Some(9),
            error_timeout: Some(Duration::from_secs(5)),
            ..breaker_options()
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::Argument(_)));

    semian::destroy(&name).unwrap();
    semian::destroy(&name).unwrap();
    assert!(semian::lookup(&name).is_none());
}
