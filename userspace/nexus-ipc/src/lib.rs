// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared-memory channel IPC runtime for cross-process communication
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests per module + tests/session.rs (host kernel)
//!
//! PUBLIC API:
//!   - RingChannel: lock-free single-producer/single-consumer ring over shared pages
//!   - Channel / Mode / Reset: role wrapper enforcing producer/consumer discipline
//!   - ChannelRegistry: per-process table of consumer/producer channels by peer
//!   - ChannelClient: connect + synchronous send/receive + asynchronous requests
//!   - ChannelServer / ServerInstance: action dispatch, kernel events, timeouts
//!   - budget: caller-level deadline loops
//!   - IpcError: IPC error types
//!
//! DEPENDENCIES:
//!   - nexus-abi: system-call traits, shared regions, wire header
//!   - log: diagnostics

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod budget;
pub mod channel;
pub mod client;
pub mod registry;
pub mod reqrep;
pub mod ring;
pub mod server;

pub use channel::{Channel, ChannelError, Mode, Reset};
pub use client::{ChannelClient, MAX_SEND_RETRIES};
pub use registry::ChannelRegistry;
pub use reqrep::{RequestTable, MAX_REQUESTS};
pub use ring::{RingChannel, RingError, RING_HEADER};
pub use server::{ChannelServer, ServerInstance};

use nexus_abi::SysError;

/// Result type returned by IPC operations.
pub type Result<T> = core::result::Result<T, IpcError>;

/// Errors produced by the IPC runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    /// Target process, channel or entry does not exist.
    #[error("peer, channel or entry not found")]
    NotFound,
    /// Transport-level failure: mapping failed, wrong channel mode, handshake mismatch.
    #[error("channel i/o error")]
    IoError,
    /// Malformed or oversized message, bad action or size.
    #[error("invalid argument")]
    InvalidArgument,
    /// Pages or request slots exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// Duplicate registration.
    #[error("already exists")]
    AlreadyExists,
    /// A caller-level deadline expired.
    #[error("deadline expired")]
    Timeout,
}

impl From<SysError> for IpcError {
    fn from(err: SysError) -> Self {
        match err {
            SysError::NotFound => Self::NotFound,
            SysError::IoError => Self::IoError,
            SysError::InvalidArgument => Self::InvalidArgument,
            SysError::OutOfMemory => Self::OutOfMemory,
            SysError::AlreadyExists => Self::AlreadyExists,
        }
    }
}
