// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions exposed to kernel and userland crates
//! OWNERS: @runtime
//! PUBLIC API: Pid, ProcessState, ProcessInfo, TimerInfo, SysError, ProcessCtl, VmShare,
//!             SharedRegion, MemoryShare, ShareOutcome, ProcessEvent, ChannelMessage, Message
//! DEPENDS_ON: no_std + alloc, bitflags, static_assertions
//! INVARIANTS: Channel header is 16 bytes LE; a share spans SHARE_PAGES pages split into two
//!             CHANNEL_PAGES halves; SysError discriminants are stable

extern crate alloc;

use alloc::string::String;
use core::fmt;

mod event;
mod message;
mod region;

pub use event::{MemoryShare, ProcessEvent, ShareOutcome};
pub use message::{le_u32, put_le_u32, ChannelMessage, Message, MessageKind, HEADER_SIZE};
pub use region::{Access, PhysAddr, SharedPages, SharedRegion, VirtAddr};

/// Size of one page of shared memory.
pub const PAGE_SIZE: usize = 4096;

/// Pages backing one direction of a channel pair (data page + feedback page).
pub const CHANNEL_PAGES: usize = 2;

/// Pages allocated for a full-duplex channel share.
pub const SHARE_PAGES: usize = 2 * CHANNEL_PAGES;

/// Largest message a channel slot may carry.
pub const MAX_MESSAGE_SIZE: usize = PAGE_SIZE / 2 - 8;

/// Result type returned by ABI helpers.
pub type Result<T> = core::result::Result<T, SysError>;

/// Errors surfaced by system calls.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SysError {
    /// Target process, share or entry does not exist.
    NotFound = 1,
    /// Transport-level failure (mapping failed, mode mismatch).
    IoError = 2,
    /// Malformed request.
    InvalidArgument = 3,
    /// The memory collaborator could not satisfy the allocation.
    OutOfMemory = 4,
    /// Duplicate registration.
    AlreadyExists = 5,
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::IoError => write!(f, "i/o error"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::AlreadyExists => write!(f, "already exists"),
        }
    }
}

/// Process identifier.
///
/// **Invariant**: PID 0 is reserved for the kernel and never names a user process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// The kernel's own identifier, used as the sender of kernel events.
    pub const KERNEL: Pid = Pid(0);

    /// Creates a PID from a raw value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw PID value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the PID as an index into per-process vectors.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

/// Scheduling state of a process. Exactly one state holds at a time.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// Currently executing on its core.
    Running = 0,
    /// Runnable, waiting in the ready queue.
    Ready = 1,
    /// Halted until explicitly resumed.
    Stopped = 2,
    /// Blocked until a wake-up (message arrival, space freed, timer).
    Sleeping = 3,
    /// Parent blocked until a child process terminates.
    Waiting = 4,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "Running",
            Self::Ready => "Ready",
            Self::Stopped => "Stopped",
            Self::Sleeping => "Sleeping",
            Self::Waiting => "Waiting",
        };
        f.write_str(name)
    }
}

/// Read-only snapshot of one process, as consumed by `ps`-style tools.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Identifier of the process.
    pub pid: Pid,
    /// Identifier of the parent, `Pid::KERNEL` for boot processes.
    pub parent: Pid,
    /// Scheduling state at the time of the snapshot.
    pub state: ProcessState,
    /// Command line the process was spawned with.
    pub command: String,
}

/// Current timer reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerInfo {
    /// Ticks since boot.
    pub ticks: u64,
    /// Ticks per second.
    pub frequency: u32,
}

impl TimerInfo {
    /// Tick value `msec` milliseconds after this reading.
    pub fn deadline_after_ms(&self, msec: u64) -> u64 {
        let delta = msec.saturating_mul(u64::from(self.frequency)).div_ceil(1000);
        self.ticks.saturating_add(delta.max(1))
    }
}

/// Process control system calls available to a running process.
pub trait ProcessCtl {
    /// Identifier of the calling process.
    fn pid(&self) -> Pid;

    /// Wakes `pid` if it sleeps, otherwise records a pending wake-up for it.
    fn wakeup(&self, pid: Pid) -> Result<()>;

    /// Moves a stopped process back to the ready queue.
    fn resume(&self, pid: Pid) -> Result<()>;

    /// Gives up the CPU; the caller stays runnable.
    fn yield_now(&self) -> Result<()>;

    /// Sleeps until woken, or until the timer passes `deadline` (ticks).
    ///
    /// Returns immediately when a wake-up is already pending.
    fn enter_sleep(&self, deadline: Option<u64>) -> Result<()>;

    /// Snapshot of `pid`.
    fn info(&self, pid: Pid) -> Result<ProcessInfo>;

    /// Reads the system timer.
    fn timer(&self) -> Result<TimerInfo>;

    /// Pops the next kernel event queued for the caller.
    fn next_event(&self) -> Option<ProcessEvent>;

    /// Routes interrupt `vector` to the caller as [`ProcessEvent::Interrupt`].
    fn watch_irq(&self, vector: u32) -> Result<()>;
}

/// Shared-memory system calls used to build channel pairs.
pub trait VmShare {
    /// Creates (or returns the existing) share between the caller and `pid`.
    ///
    /// `message_size` is recorded with a new share so the peer can validate it.
    fn share_create(&self, pid: Pid, message_size: usize) -> Result<ShareOutcome>;

    /// Reads the caller's view of the share with `pid`.
    fn share_read(&self, pid: Pid) -> Result<MemoryShare>;

    /// Unmaps the share with `pid` from both processes and releases its pages.
    fn share_delete(&self, pid: Pid) -> Result<()>;
}

static_assertions::const_assert!(MAX_MESSAGE_SIZE + 8 <= PAGE_SIZE);
static_assertions::const_assert_eq!(SHARE_PAGES, 4);
