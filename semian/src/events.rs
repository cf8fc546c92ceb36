// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide event bus.
//!
//! The core publishes lifecycle notifications here; subscribers (loggers,
//! metric exporters) are opaque callbacks. A panicking subscriber is
//! isolated: it is logged and the remaining subscribers still run.

use crate::breaker::detector::DetectorMetrics;
use crate::breaker::CircuitState;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tracing::warn;

/// Notifications published by the core.
#[derive(Debug, Clone)]
pub enum Event {
    /// A guarded call completed successfully.
    Success { name: Arc<str> },

    /// A guarded call failed with a counted error.
    Error { name: Arc<str> },

    /// A circuit breaker changed state.
    StateChange {
        name: Arc<str>,
        state: CircuitState,
        metrics: DetectorMetrics,
    },

    /// An adaptive controller executed a window update.
    AdaptiveUpdate {
        name: Arc<str>,
        error_rate: f64,
        rejection_rate: f64,
    },

    /// The registry evicted idle resources.
    LruGc {
        size: usize,
        examined: usize,
        cleared: usize,
        elapsed: Duration,
    },
}

impl Event {
    /// The resource the event belongs to; `None` for registry-wide events.
    pub fn resource_name(&self) -> Option<&str> {
        match self {
            Event::Success { name }
            | Event::Error { name }
            | Event::StateChange { name, .. }
            | Event::AdaptiveUpdate { name, .. } => Some(name),
            Event::LruGc { .. } => None,
        }
    }
}

/// Token returned by [`subscribe`]; pass it to [`unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    name: Option<String>,
    handler: Handler,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static SUBSCRIPTIONS: LazyLock<Mutex<Vec<Subscription>>> = LazyLock::new(|| Mutex::new(Vec::new()));

/// Subscribes to events, optionally filtered to one resource name.
///
/// Unfiltered subscribers also receive registry-wide events.
pub fn subscribe<F>(name: Option<&str>, handler: F) -> SubscriptionId
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    let id = SubscriptionId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    let mut subscriptions = SUBSCRIPTIONS.lock().unwrap_or_else(|e| e.into_inner());
    subscriptions.push(Subscription {
        id,
        name: name.map(str::to_string),
        handler: Arc::new(handler),
    });
    id
}

pub fn unsubscribe(id: SubscriptionId) {
    let mut subscriptions = SUBSCRIPTIONS.lock().unwrap_or_else(|e| e.into_inner());
    subscriptions.retain(|s| s.id != id);
}

pub(crate) fn publish(event: &Event) {
    // Snapshot the matching handlers first: a subscriber is allowed to
    // subscribe or unsubscribe from inside its callback.
    let handlers: Vec<Handler> = {
        let subscriptions = SUBSCRIPTIONS.lock().unwrap_or_else(|e| e.into_inner());
        subscriptions
            .iter()
            .filter(|s| match (&s.name, event.resource_name()) {
                (None, _) => true,
                (Some(filter), Some(name)) => filter == name,
                (Some(_), None) => false,
            })
            .map(|s| Arc::clone(&s.handler))
            .collect()
    };

    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            warn!(event = ?event, "event subscriber panicked");
        }
    }
}
