// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Everything the core can fail with.
///
/// `ResourceBusy` and `CircuitOpen` are the adapter-facing renditions of
/// `Timeout` and `OpenCircuit`: client-library shims call
/// [`Error::into_adapter`] so their callers can match on one family of
/// errors while logging still attributes the failure to the resource name.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The bulkhead had no free ticket within the wait budget.
    #[error("resource `{name}` timed out after {timeout:?} waiting for a ticket")]
    Timeout { name: String, timeout: Duration },

    /// The circuit breaker rejected the call before it ran.
    #[error("circuit for `{name}` is open")]
    OpenCircuit { name: String },

    /// Adapter-level wrapper over [`Error::Timeout`].
    #[error("resource `{name}` is busy")]
    ResourceBusy { name: String },

    /// Adapter-level wrapper over [`Error::OpenCircuit`].
    #[error("circuit for `{name}` is open")]
    CircuitOpen { name: String },

    /// The kernel refused an IPC operation.
    #[error("ipc failure for `{name}`: {source}")]
    Syscall {
        name: String,
        #[source]
        source: semian_ipc::IpcError,
    },

    /// Invalid configuration. Raised at registration, never at call time.
    #[error("{0}")]
    Argument(String),
}

impl Error {
    /// The resource this error belongs to, when there is one.
    pub fn semian_identifier(&self) -> Option<&str> {
        match self {
            Error::Timeout { name, .. }
            | Error::OpenCircuit { name }
            | Error::ResourceBusy { name }
            | Error::CircuitOpen { name } => Some(name),
            Error::Syscall { name, .. } => Some(name),
            Error::Argument(_) => None,
        }
    }

    /// Rewraps guard errors into their adapter-level kinds.
    pub fn into_adapter(self) -> Error {
        match self {
            Error::Timeout { name, .. } => Error::ResourceBusy { name },
            Error::OpenCircuit { name } => Error::CircuitOpen { name },
            other => other,
        }
    }

    pub(crate) fn from_ipc(name: &str, err: semian_ipc::IpcError, timeout: Duration) -> Error {
        match err {
            semian_ipc::IpcError::Timeout(_) => Error::Timeout {
                name: name.to_string(),
                timeout,
            },
            semian_ipc::IpcError::Argument(msg) => Error::Argument(msg),
            source => Error::Syscall {
                name: name.to_string(),
                source,
            },
        }
    }

    pub(crate) fn syscall(name: &str, err: semian_ipc::IpcError) -> Error {
        match err {
            semian_ipc::IpcError::Argument(msg) => Error::Argument(msg),
            source => Error::Syscall {
                name: name.to_string(),
                source,
            },
        }
    }
}

/// Outcome of a guarded call: either the guard said no, or the caller's own
/// `work` failed and is re-raised untouched.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Guard(#[from] Error),

    #[error(transparent)]
    Work(E),
}

impl<E: std::error::Error + 'static> AcquireError<E> {
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AcquireError::Guard(Error::OpenCircuit { .. } | Error::CircuitOpen { .. })
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AcquireError::Guard(Error::Timeout { .. } | Error::ResourceBusy { .. })
        )
    }
}

/// Declares whether an error counts against the circuit.
///
/// Adapters implement this on the error types they translate; the default is
/// to count. Returning false lets an adapter surface an error to the caller
/// without burning breaker threshold, e.g. for client-side validation
/// failures that say nothing about the dependency's health.
pub trait MarksCircuits {
    fn marks_circuits(&self) -> bool {
        true
    }
}

impl MarksCircuits for std::io::Error {}
