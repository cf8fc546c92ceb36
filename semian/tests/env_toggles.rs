// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment kill switches. One test function: the variables are
//! process-wide, so the phases must run sequentially.

use semian::{AcquireOptions, MarksCircuits, ResourceOptions};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("dependency exploded")]
struct SomeError;
impl MarksCircuits for SomeError {}

fn unique(name: &str) -> String {
    format!("{name}-{}", std::process::id())
}

#[test]
fn kill_switches_turn_guards_into_passthroughs() {
    // Bulkhead disabled: a single-ticket resource admits everything.
    std::env::set_var("SEMIAN_BULKHEAD_DISABLED", "1");
    let name = unique("env-bulkhead");
    let resource = semian::register(
        &name,
        ResourceOptions {
            tickets: Some(1),
            circuit_breaker: false,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(resource.bulkhead().is_none());
    let value: i32 = resource
        .acquire::<_, SomeError, _>(AcquireOptions::default(), || Ok(1))
        .unwrap();
    assert_eq!(value, 1);
    semian::destroy(&name).unwrap();
    std::env::remove_var("SEMIAN_BULKHEAD_DISABLED");

    // Breaker disabled: errors never open anything.
    std::env::set_var("SEMIAN_CIRCUIT_BREAKER_DISABLED", "1");
    let name = unique("env-breaker");
    let resource = semian::register(
        &name,
        ResourceOptions {
            bulkhead: false,
            error_threshold: Some(1),
            error_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(resource.circuit_state().is_none());
    for _ in 0..5 {
        let err = resource
            .acquire::<i32, _, _>(AcquireOptions::default(), || Err(SomeError))
            .unwrap_err();
        assert!(matches!(err, semian::AcquireError::Work(_)));
    }
    assert!(resource.request_allowed());
    semian::destroy(&name).unwrap();
    std::env::remove_var("SEMIAN_CIRCUIT_BREAKER_DISABLED");

    // Everything disabled: the resource is a pure passthrough, but invalid
    // configuration is still rejected deterministically.
    std::env::set_var("SEMIAN_DISABLED", "1");
    let name = unique("env-all");
    let resource = semian::register(
        &name,
        ResourceOptions {
            tickets: Some(1),
            error_threshold: Some(1),
            error_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(resource.bulkhead().is_none());
    assert!(resource.circuit_state().is_none());
    let value: i32 = resource
        .acquire::<_, SomeError, _>(AcquireOptions::default(), || Ok(2))
        .unwrap();
    assert_eq!(value, 2);

    let invalid = semian::register(
        &unique("env-invalid"),
        ResourceOptions {
            tickets: Some(1),
            quota: Some(0.5),
            circuit_breaker: false,
            ..Default::default()
        },
    );
    assert!(matches!(invalid, Err(semian::Error::Argument(_))));

    semian::destroy(&name).unwrap();
    std::env::remove_var("SEMIAN_DISABLED");
}
