// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-local IPC primitives shared by the semian core.
//!
//! Everything in here is keyed off a resource name: [`key`] turns a name into
//! a deterministic SysV key or shared-memory path, [`shm`] owns segment
//! handles and mappings, [`atomics`] provides typed atomic views over mapped
//! bytes, and [`sysv`] wraps SysV semaphore sets with undo semantics so a
//! killed process can never leak a ticket.
//!
//! Unix only. Callers that need to run where kernel IPC is unavailable select
//! a process-local fallback at construction time instead of compiling this
//! crate out.

#![cfg(unix)]

mod error;
pub use error::IpcError;

pub mod atomics;
pub mod key;
pub mod shm;
pub mod sysv;

pub type Result<T> = std::result::Result<T, IpcError>;
