// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

//! CONTEXT: NEURON process manager, scheduler and channel-share core
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + tests/host_backend.rs
//!
//! PUBLIC API:
//!   - KernelContext: per-core kernel state (processes, shares, memory, timer, events)
//!   - ProcessManager / Scheduler: lifecycle, round-robin dispatch, wake-up list
//!   - ShareTable / PhysicalMemory: shared pages backing IPC channels
//!   - KernelConfig: tunables (TOML on std builds)
//!   - HostKernel / HostProcess (std): threads as processes, implementing the syscall traits
//!
//! DEPENDS_ON: nexus-abi, log, static_assertions; parking_lot + serde + toml on std
//! INVARIANTS: No global state; every subsystem is reached through a KernelContext

extern crate alloc;

pub mod diag;

pub mod config;
pub mod context;
pub mod manager;
pub mod mm;
pub mod process;
pub mod sched;
pub mod shares;

#[cfg(feature = "std")]
pub mod host;

pub use config::{ConfigError, KernelConfig};
pub use context::{KernelContext, Timer};
pub use manager::{ProcessManager, SleepOutcome, WakeOutcome};
pub use mm::{Frames, HostMemory, MemoryError, PhysicalMemory};
pub use process::{Process, ProcessError, ProcessTable};
pub use sched::{Dispatch, EnqueueOutcome, EnqueueRejectReason, Scheduler};
pub use shares::{ShareError, ShareTable};

#[cfg(feature = "std")]
pub use host::{HostKernel, HostProcess};

static_assertions::assert_impl_all!(KernelContext: Send);
