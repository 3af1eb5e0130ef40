// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process lifecycle and state transitions on top of the scheduler
//! OWNERS: @kernel-sched-team
//! PUBLIC API: ProcessManager (create/remove/stop/resume/wakeup/sleep/wait/execute_next/tick),
//!             WakeOutcome, SleepOutcome
//! DEPENDS_ON: process::ProcessTable, sched::Scheduler
//! INVARIANTS: Exactly one Running process after a successful pass; a Sleeping process leaves
//!             the queues and only returns through the wake-up list; wake-ups that arrive
//!             while a process is awake are counted, never lost

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use nexus_abi::{Pid, ProcessInfo, ProcessState};

use crate::process::{Process, ProcessError, ProcessTable};
use crate::sched::{Dispatch, Scheduler};

/// What a wake-up did.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// The process was sleeping and is now on the wake-up list.
    Posted,
    /// The process was awake; the wake-up is remembered for its next sleep.
    Pending,
}

/// What a sleep request did.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The process is Sleeping.
    Slept,
    /// A wake-up was already pending and was consumed instead.
    PendingWakeup,
}

/// Owns the process table and the scheduler of one core.
#[derive(Debug)]
pub struct ProcessManager {
    table: ProcessTable,
    scheduler: Scheduler,
    irq_watch: BTreeMap<u32, Vec<Pid>>,
}

impl ProcessManager {
    /// Creates a manager for at most `max_processes` processes.
    pub fn new(max_processes: usize) -> Self {
        Self {
            table: ProcessTable::new(max_processes),
            scheduler: Scheduler::new(),
            irq_watch: BTreeMap::new(),
        }
    }

    /// Creates a Ready process at the tail of the ready queue.
    pub fn create(&mut self, parent: Pid, command: &str) -> Result<Pid, ProcessError> {
        let pid = self.table.insert(parent, command)?;
        let _ = self.scheduler.enqueue(pid);
        crate::log_debug!(target: "proc", "created pid={} parent={} cmd={}", pid, parent, command);
        Ok(pid)
    }

    /// Looks up a process.
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.table.get(pid)
    }

    /// State of `pid`.
    pub fn state(&self, pid: Pid) -> Option<ProcessState> {
        self.table.state(pid)
    }

    /// Returns `true` if `pid` exists.
    pub fn exists(&self, pid: Pid) -> bool {
        self.table.get(pid).is_some()
    }

    /// Number of live processes.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` when no process exists.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The scheduler, for inspection.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Process currently Running.
    pub fn current(&self) -> Option<Pid> {
        self.scheduler.current()
    }

    fn lookup(&mut self, pid: Pid) -> Result<&mut Process, ProcessError> {
        self.table.get_mut(pid).ok_or(ProcessError::NotFound(pid))
    }

    /// Designates the idle process.
    pub fn set_idle(&mut self, pid: Pid) -> Result<(), ProcessError> {
        self.lookup(pid)?;
        self.scheduler.set_idle(pid);
        Ok(())
    }

    /// Removes a process. Processes waiting on it become Ready with `status` as wait result.
    ///
    /// Returns the removed record; shares and event queues are torn down by the caller.
    pub fn remove(&mut self, pid: Pid, status: i32) -> Result<Process, ProcessError> {
        let proc = self.table.remove(pid).ok_or(ProcessError::NotFound(pid))?;
        self.scheduler.purge(pid);
        for watchers in self.irq_watch.values_mut() {
            watchers.retain(|&p| p != pid);
        }

        let waiters: Vec<Pid> = self
            .table
            .iter()
            .filter(|p| p.state() == ProcessState::Waiting && p.wait_target == Some(pid))
            .map(Process::pid)
            .collect();
        for waiter in waiters {
            if let Some(p) = self.table.get_mut(waiter) {
                p.set_state(ProcessState::Ready);
                p.wait_target = None;
                p.wait_result = Some(status);
            }
            let _ = self.scheduler.enqueue(waiter);
        }
        crate::log_debug!(target: "proc", "removed pid={} status={}", pid, status);
        Ok(proc)
    }

    /// Halts a process until [`ProcessManager::resume`].
    pub fn stop(&mut self, pid: Pid) -> Result<(), ProcessError> {
        let proc = self.lookup(pid)?;
        proc.set_state(ProcessState::Stopped);
        proc.sleep_deadline = None;
        let _ = self.scheduler.dequeue(pid);
        Ok(())
    }

    /// Moves a Stopped process back to the ready queue; other states are left alone.
    pub fn resume(&mut self, pid: Pid) -> Result<(), ProcessError> {
        let proc = self.lookup(pid)?;
        if proc.state() == ProcessState::Stopped {
            proc.set_state(ProcessState::Ready);
            let _ = self.scheduler.enqueue(pid);
        }
        Ok(())
    }

    /// Posts a wake-up for `pid`.
    pub fn wakeup(&mut self, pid: Pid) -> Result<WakeOutcome, ProcessError> {
        let proc = self.lookup(pid)?;
        if proc.state() == ProcessState::Sleeping {
            // A second wake-up while already posted coalesces with the first.
            let _ = self.scheduler.post_wakeup(pid);
            Ok(WakeOutcome::Posted)
        } else {
            proc.wakeups = proc.wakeups.saturating_add(1);
            Ok(WakeOutcome::Pending)
        }
    }

    /// Puts `pid` to sleep until a wake-up or until the timer reaches `deadline`.
    pub fn sleep(&mut self, pid: Pid, deadline: Option<u64>) -> Result<SleepOutcome, ProcessError> {
        let proc = self.lookup(pid)?;
        match proc.state() {
            ProcessState::Running | ProcessState::Ready => {}
            state => return Err(ProcessError::InvalidState { pid, state }),
        }
        if proc.wakeups > 0 {
            proc.wakeups = 0;
            return Ok(SleepOutcome::PendingWakeup);
        }
        proc.set_state(ProcessState::Sleeping);
        proc.sleep_deadline = deadline;
        let _ = self.scheduler.dequeue(pid);
        Ok(SleepOutcome::Slept)
    }

    /// Blocks `pid` until `target` is removed.
    pub fn wait(&mut self, pid: Pid, target: Pid) -> Result<(), ProcessError> {
        if pid == target {
            return Err(ProcessError::SelfWait(pid));
        }
        if !self.exists(target) {
            return Err(ProcessError::NotFound(target));
        }
        let proc = self.lookup(pid)?;
        match proc.state() {
            ProcessState::Running | ProcessState::Ready => {}
            state => return Err(ProcessError::InvalidState { pid, state }),
        }
        proc.set_state(ProcessState::Waiting);
        proc.wait_target = Some(target);
        proc.wait_result = None;
        let _ = self.scheduler.dequeue(pid);
        Ok(())
    }

    /// Takes the exit status delivered to a finished wait.
    pub fn take_wait_result(&mut self, pid: Pid) -> Option<i32> {
        self.table.get_mut(pid).and_then(|p| p.wait_result.take())
    }

    /// One scheduling pass. See [`Scheduler::execute_next`].
    pub fn execute_next(&mut self) -> Option<Dispatch> {
        let dispatch = self.scheduler.execute_next(&mut self.table);
        if let Some(d) = dispatch.filter(|d| d.switched) {
            crate::log_debug!(target: "sched", "switch {:?} -> {}", d.previous, d.next);
        }
        dispatch
    }

    /// Wakes `pid` if needed and runs it next.
    pub fn execute_attempt(&mut self, pid: Pid) -> Result<Option<Dispatch>, ProcessError> {
        let proc = self.lookup(pid)?;
        match proc.state() {
            ProcessState::Sleeping => {
                proc.set_state(ProcessState::Ready);
                proc.sleep_deadline = None;
            }
            ProcessState::Ready | ProcessState::Running => {}
            state => return Err(ProcessError::InvalidState { pid, state }),
        }
        if self.scheduler.current() == Some(pid) {
            return Ok(None);
        }
        let _ = self.scheduler.enqueue_front(pid);
        Ok(self.execute_next())
    }

    /// Timer tick at `now`: expires sleep deadlines, then reschedules.
    pub fn tick(&mut self, now: u64) -> Option<Dispatch> {
        self.expire(now);
        self.execute_next()
    }

    /// Posts wake-ups for every sleeper whose deadline is at or before `now`.
    pub fn expire(&mut self, now: u64) -> usize {
        let expired: Vec<Pid> = self
            .table
            .iter()
            .filter(|p| p.state() == ProcessState::Sleeping)
            .filter(|p| p.sleep_deadline.is_some_and(|d| d <= now))
            .map(Process::pid)
            .collect();
        for &pid in &expired {
            let _ = self.scheduler.post_wakeup(pid);
        }
        expired.len()
    }

    /// Routes interrupt `vector` to `pid`.
    pub fn watch_irq(&mut self, pid: Pid, vector: u32) -> Result<(), ProcessError> {
        self.lookup(pid)?;
        let watchers = self.irq_watch.entry(vector).or_default();
        if !watchers.contains(&pid) {
            watchers.push(pid);
        }
        Ok(())
    }

    /// Processes watching `vector`.
    pub fn irq_watchers(&self, vector: u32) -> &[Pid] {
        self.irq_watch.get(&vector).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Read-only snapshot of every process, in PID order.
    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        self.table.iter().map(Process::info).collect()
    }
}
