// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process records and the table that owns them
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Process, ProcessTable, ProcessError
//! DEPENDS_ON: nexus_abi::{Pid, ProcessState, ProcessInfo}
//! INVARIANTS: PIDs are unique and never 0; a process is in exactly one state; the table is
//!             bounded by the configured process limit

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use core::fmt;

use nexus_abi::{Pid, ProcessInfo, ProcessState, SysError};

/// Errors raised by process bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// No process with that PID.
    NotFound(Pid),
    /// The operation is not valid in the process's current state.
    InvalidState {
        /// Target process.
        pid: Pid,
        /// State it was found in.
        state: ProcessState,
    },
    /// A process may not wait on itself.
    SelfWait(Pid),
    /// Process limit reached.
    TableFull,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(pid) => write!(f, "pid {pid} not found"),
            Self::InvalidState { pid, state } => write!(f, "pid {pid} is {state}"),
            Self::SelfWait(pid) => write!(f, "pid {pid} cannot wait on itself"),
            Self::TableFull => write!(f, "process table full"),
        }
    }
}

impl From<ProcessError> for SysError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NotFound(_) => SysError::NotFound,
            ProcessError::InvalidState { .. } | ProcessError::SelfWait(_) => {
                SysError::InvalidArgument
            }
            ProcessError::TableFull => SysError::OutOfMemory,
        }
    }
}

/// Kernel-side record of one process.
#[derive(Debug, Clone)]
pub struct Process {
    pid: Pid,
    parent: Pid,
    state: ProcessState,
    command: String,
    pub(crate) wakeups: u32,
    pub(crate) sleep_deadline: Option<u64>,
    pub(crate) wait_target: Option<Pid>,
    pub(crate) wait_result: Option<i32>,
}

impl Process {
    fn new(pid: Pid, parent: Pid, command: &str) -> Self {
        Self {
            pid,
            parent,
            state: ProcessState::Ready,
            command: command.to_string(),
            wakeups: 0,
            sleep_deadline: None,
            wait_target: None,
            wait_result: None,
        }
    }

    /// Identifier.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Parent identifier.
    pub fn parent(&self) -> Pid {
        self.parent
    }

    /// Current scheduling state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    /// Command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wake-ups received while not sleeping.
    pub fn pending_wakeups(&self) -> u32 {
        self.wakeups
    }

    /// Tick deadline of the current sleep, if any.
    pub fn sleep_deadline(&self) -> Option<u64> {
        self.sleep_deadline
    }

    /// Snapshot for the process table query interface.
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            parent: self.parent,
            state: self.state,
            command: self.command.clone(),
        }
    }
}

/// Bounded table of live processes keyed by PID.
#[derive(Debug)]
pub struct ProcessTable {
    procs: BTreeMap<Pid, Process>,
    next_pid: u32,
    limit: usize,
}

impl ProcessTable {
    /// Creates an empty table holding at most `limit` processes.
    pub fn new(limit: usize) -> Self {
        Self { procs: BTreeMap::new(), next_pid: 1, limit }
    }

    /// Inserts a Ready process and returns its fresh PID.
    pub fn insert(&mut self, parent: Pid, command: &str) -> Result<Pid, ProcessError> {
        if self.procs.len() >= self.limit {
            return Err(ProcessError::TableFull);
        }
        let mut raw = self.next_pid;
        while raw == 0 || self.procs.contains_key(&Pid::from_raw(raw)) {
            raw = raw.wrapping_add(1);
        }
        self.next_pid = raw.wrapping_add(1);
        let pid = Pid::from_raw(raw);
        self.procs.insert(pid, Process::new(pid, parent, command));
        Ok(pid)
    }

    /// Removes and returns a process.
    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.procs.remove(&pid)
    }

    /// Looks up a process.
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid)
    }

    /// Looks up a process mutably.
    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid)
    }

    /// State of `pid`, or `None` if it does not exist.
    pub fn state(&self, pid: Pid) -> Option<ProcessState> {
        self.procs.get(&pid).map(Process::state)
    }

    /// Iterates processes in PID order.
    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.procs.values()
    }

    /// Iterates processes mutably in PID order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Process> {
        self.procs.values_mut()
    }

    /// Number of live processes.
    pub fn len(&self) -> usize {
        self.procs.len()
    }

    /// Returns `true` when no process exists.
    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}
