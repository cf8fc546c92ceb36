// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The adaptive circuit breaker.
//!
//! Instead of a binary open/closed switch, a PID controller continuously
//! computes a rejection probability from the gap between the observed and
//! ideal error rates. Counters and the rejection rate are shared across all
//! workers on the host; each worker runs a ticker thread that competes to
//! perform the once-per-window update.

pub(crate) mod controller;
mod p2;
mod shared;

use crate::breaker::CircuitState;
use crate::config::AdaptiveConfig;
use crate::error::{AcquireError, Error, MarksCircuits};
use crate::Outcome;
use controller::AdaptiveController;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub(crate) struct AdaptiveBreaker {
    controller: Arc<AdaptiveController>,
    ticker: Mutex<Option<Ticker>>,
}

impl AdaptiveBreaker {
    pub(crate) fn new(name: Arc<str>, config: AdaptiveConfig, shared: bool) -> Result<Self, Error> {
        let controller = if shared {
            AdaptiveController::shared(name, config)?
        } else {
            AdaptiveController::local(name, config)?
        };
        let controller = Arc::new(controller);
        let ticker = Ticker::start(&controller);
        Ok(AdaptiveBreaker {
            controller,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    pub(crate) fn acquire<T, E, F>(&self, work: F) -> Result<T, AcquireError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: MarksCircuits + std::error::Error + 'static,
    {
        if self.controller.should_reject() {
            self.controller.record(Outcome::Rejected);
            return Err(AcquireError::Guard(Error::OpenCircuit {
                name: self.controller.name().to_string(),
            }));
        }
        let result = work();
        match &result {
            Ok(_) => self.controller.record(Outcome::Success),
            Err(err) if err.marks_circuits() => self.controller.record(Outcome::Error),
            Err(_) => {}
        }
        result.map_err(AcquireError::Work)
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.controller.derived_state()
    }

    pub(crate) fn rejection_rate(&self) -> f64 {
        self.controller.rejection_rate()
    }

    pub(crate) fn request_allowed(&self) -> bool {
        !self.controller.should_reject()
    }

    pub(crate) fn in_use(&self) -> bool {
        self.controller.rejection_rate() > 0.0
    }

    pub(crate) fn reset(&self) {
        self.controller.reset();
    }

    /// Stops the ticker, then removes host-wide kernel objects.
    pub(crate) fn destroy(&self) -> Result<(), Error> {
        self.stop_ticker();
        self.controller.destroy()
    }

    fn stop_ticker(&self) {
        let mut slot = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        drop(slot.take());
    }
}

/// Background window driver: one thread sleeping on a channel timeout, so a
/// stop message (or dropping the sender) wakes it immediately.
struct Ticker {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
    // A forked child inherits this struct but not the thread; joining there
    // would wait on a thread that never existed in the child.
    owner_pid: u32,
}

impl Ticker {
    fn start(controller: &Arc<AdaptiveController>) -> Ticker {
        let (stop, wakeups) = bounded::<()>(1);
        let driven = Arc::clone(controller);
        let window = driven.window_size();
        let handle = std::thread::spawn(move || loop {
            match wakeups.recv_timeout(window) {
                Err(RecvTimeoutError::Timeout) => driven.tick(None),
                _ => return,
            }
        });
        Ticker {
            stop,
            handle: Some(handle),
            owner_pid: std::process::id(),
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if std::process::id() != self.owner_pid {
            return;
        }
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
