// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Correlation of asynchronous requests with their responses
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit-tested (host)
//!
//! Fixed-capacity storage: a request occupies one of [`MAX_REQUESTS`] slots from the moment it
//! is sent until its response arrives or the peer goes away. Identifiers come from a
//! deterministic counter and never take the value 0, which marks "no identifier" on the wire.

use nexus_abi::Pid;

use crate::{IpcError, Result};

/// Outstanding asynchronous requests per client.
pub const MAX_REQUESTS: usize = 32;

/// Callback run with the raw response bytes.
pub type ResponseCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Monotonic identifier generator (no randomness; deterministic).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NonceGen {
    next: u32,
}

impl NonceGen {
    /// Create a generator starting at `start` (the first `next_nonce()` returns `start`).
    pub const fn new(start: u32) -> Self {
        Self { next: start }
    }

    /// Returns the next identifier, skipping 0 on wraparound.
    pub fn next_nonce(&mut self) -> u32 {
        if self.next == 0 {
            self.next = 1;
        }
        let out = self.next;
        self.next = self.next.wrapping_add(1);
        out
    }
}

impl Default for NonceGen {
    fn default() -> Self {
        Self::new(1)
    }
}

struct Slot {
    pid: Pid,
    identifier: u32,
    callback: ResponseCallback,
}

/// Bounded table of pending requests keyed by `(peer, identifier)`.
pub struct RequestTable {
    slots: [Option<Slot>; MAX_REQUESTS],
    nonces: NonceGen,
}

impl RequestTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self { slots: core::array::from_fn(|_| None), nonces: NonceGen::default() }
    }

    /// Stores `callback` for a request to `pid` and returns the identifier to put on the wire.
    pub fn insert(&mut self, pid: Pid, callback: ResponseCallback) -> Result<u32> {
        let slot = self.slots.iter_mut().find(|s| s.is_none()).ok_or(IpcError::OutOfMemory)?;
        let identifier = self.nonces.next_nonce();
        *slot = Some(Slot { pid, identifier, callback });
        Ok(identifier)
    }

    /// Runs and frees the callback registered for `(pid, identifier)`.
    pub fn complete(&mut self, pid: Pid, identifier: u32, response: &[u8]) -> Result<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| matches!(s, Some(e) if e.pid == pid && e.identifier == identifier))
            .ok_or(IpcError::NotFound)?;
        if let Some(mut entry) = slot.take() {
            (entry.callback)(response);
        }
        Ok(())
    }

    /// Drops a pending request without running its callback.
    pub fn cancel(&mut self, pid: Pid, identifier: u32) -> Result<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| matches!(s, Some(e) if e.pid == pid && e.identifier == identifier))
            .ok_or(IpcError::NotFound)?;
        *slot = None;
        Ok(())
    }

    /// Drops every request addressed to `pid`; returns how many were dropped.
    pub fn cancel_for(&mut self, pid: Pid) -> usize {
        let mut dropped = 0;
        for slot in &mut self.slots {
            if matches!(slot, Some(e) if e.pid == pid) {
                *slot = None;
                dropped += 1;
            }
        }
        dropped
    }

    /// Requests still waiting for a response.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for RequestTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RequestTable").field("pending", &self.len()).finish()
    }
}
