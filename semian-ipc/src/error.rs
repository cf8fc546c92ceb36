// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Failures surfaced by the IPC layer.
///
/// `Syscall` carries the originating operation name so callers can attribute
/// a kernel refusal without re-deriving it from errno alone.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Argument(String),
}

impl IpcError {
    /// Captures `errno` for a failed libc call.
    pub(crate) fn last_syscall(op: &'static str) -> Self {
        IpcError::Syscall {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    pub(crate) fn syscall(op: &'static str, errno: nix::errno::Errno) -> Self {
        IpcError::Syscall {
            op,
            source: errno.into(),
        }
    }

    /// True when the kernel object this error came from no longer exists.
    pub fn is_gone(&self) -> bool {
        match self {
            IpcError::Syscall { source, .. } => matches!(
                source.raw_os_error(),
                Some(libc::EIDRM) | Some(libc::ENOENT) | Some(libc::EINVAL)
            ),
            _ => false,
        }
    }
}
