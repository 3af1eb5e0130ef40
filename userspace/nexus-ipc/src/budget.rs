// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Caller-level deadline loops around non-blocking IPC attempts.
//!
//! Channels themselves never time out. A caller that needs a bounded wait polls a
//! non-blocking operation (returning `Ok(None)` when no progress was possible) and applies an
//! explicit deadline taken from the process-visible timer.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal (crate public, but intended for in-tree use)
//! TEST_COVERAGE: Unit tests (host)

use log::debug;
use nexus_abi::ProcessCtl;

use crate::{IpcError, Result};

const SPIN_CHECK_MASK: usize = 0x7; // check the timer every 8 attempts

/// Tick source used for budgeted loops.
pub trait Clock {
    /// Current timer reading in ticks.
    fn now_ticks(&self) -> Result<u64>;
    /// Ticks per second.
    fn frequency(&self) -> Result<u32>;
    /// Cooperative yield to allow other work to make progress.
    fn yield_now(&self);
}

/// [`Clock`] over a process's system-call handle.
#[derive(Debug)]
pub struct SysClock<'a, S>(pub &'a S);

impl<S: ProcessCtl> Clock for SysClock<'_, S> {
    fn now_ticks(&self) -> Result<u64> {
        Ok(self.0.timer()?.ticks)
    }

    fn frequency(&self) -> Result<u32> {
        Ok(self.0.timer()?.frequency)
    }

    fn yield_now(&self) {
        if let Err(err) = self.0.yield_now() {
            debug!("ipc: pid {} cannot yield: {}", self.0.pid(), err);
        }
    }
}

/// Computes the tick value `msec` milliseconds from now.
pub fn deadline_after(clock: &impl Clock, msec: u64) -> Result<u64> {
    let now = clock.now_ticks()?;
    let hz = u64::from(clock.frequency()?);
    let delta = msec.saturating_mul(hz).div_ceil(1000).max(1);
    Ok(now.saturating_add(delta))
}

/// Runs `op` until it yields a value, fails, or the deadline passes.
///
/// `Ok(None)` from `op` means "no progress yet" and is retried.
pub fn retry_until<T>(
    clock: &impl Clock,
    deadline: u64,
    mut op: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    let mut spins: usize = 0;
    loop {
        if let Some(value) = op()? {
            return Ok(value);
        }
        if (spins & SPIN_CHECK_MASK) == 0 && clock.now_ticks()? >= deadline {
            return Err(IpcError::Timeout);
        }
        clock.yield_now();
        spins = spins.wrapping_add(1);
    }
}

/// Runs `op` until it yields a value, fails, or `msec` milliseconds pass.
pub fn retry_budgeted<T>(
    clock: &impl Clock,
    msec: u64,
    op: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    let deadline = deadline_after(clock, msec)?;
    retry_until(clock, deadline, op)
}
