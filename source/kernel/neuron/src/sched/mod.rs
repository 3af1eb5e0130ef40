// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Round-robin scheduler with a wake-up list
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (enqueue/dequeue/post_wakeup/set_idle/execute_next), Dispatch, EnqueueOutcome
//! DEPENDS_ON: process::ProcessTable (state transitions)
//! INVARIANTS: A PID is in at most one of {ready queue, wake-up list, current};
//!             FIFO order without priorities; the idle process is never queued

extern crate alloc;

use alloc::collections::VecDeque;

use nexus_abi::{Pid, ProcessState};

use crate::process::ProcessTable;

/// Why an enqueue did not change the queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejectReason {
    /// Already queued, posted or current.
    AlreadyQueued,
    /// The idle process only runs when nothing else can.
    Idle,
}

#[must_use = "enqueue outcomes must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Rejected(EnqueueRejectReason),
}

/// Result of one scheduling pass.
#[must_use = "a dispatch tells the caller whether to switch context"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Process that ran before the pass.
    pub previous: Option<Pid>,
    /// Process now Running.
    pub next: Pid,
    /// `true` when `next` differs from `previous` and registers must be swapped.
    pub switched: bool,
}

/// Per-core scheduler. The process table owns states; the scheduler owns ordering.
#[derive(Debug, Default)]
pub struct Scheduler {
    ready: VecDeque<Pid>,
    wakeups: VecDeque<Pid>,
    current: Option<Pid>,
    previous: Option<Pid>,
    // Set when the current process blocks or stops outside a scheduling pass.
    outgoing: Option<Pid>,
    idle: Option<Pid>,
    switches: u64,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    fn tracked(&self, pid: Pid) -> bool {
        self.current == Some(pid) || self.ready.contains(&pid) || self.wakeups.contains(&pid)
    }

    /// Appends a Ready process to the tail of the ready queue.
    pub fn enqueue(&mut self, pid: Pid) -> EnqueueOutcome {
        if self.idle == Some(pid) {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::Idle);
        }
        if self.tracked(pid) {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::AlreadyQueued);
        }
        self.ready.push_back(pid);
        EnqueueOutcome::Enqueued
    }

    /// Places `pid` at the head of the ready queue, moving it if already queued.
    pub fn enqueue_front(&mut self, pid: Pid) -> EnqueueOutcome {
        if self.idle == Some(pid) {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::Idle);
        }
        if self.current == Some(pid) {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::AlreadyQueued);
        }
        self.ready.retain(|&p| p != pid);
        self.wakeups.retain(|&p| p != pid);
        self.ready.push_front(pid);
        EnqueueOutcome::Enqueued
    }

    /// Drops every reference to `pid`. A current process is remembered as outgoing so the
    /// next pass still reports it as `previous`.
    pub fn dequeue(&mut self, pid: Pid) -> bool {
        let before = self.ready.len() + self.wakeups.len();
        self.ready.retain(|&p| p != pid);
        self.wakeups.retain(|&p| p != pid);
        let mut removed = before != self.ready.len() + self.wakeups.len();
        if self.current == Some(pid) {
            self.current = None;
            self.outgoing = Some(pid);
            removed = true;
        }
        removed
    }

    /// Forgets `pid` entirely, including idle and history slots.
    pub fn purge(&mut self, pid: Pid) {
        let _ = self.dequeue(pid);
        if self.outgoing == Some(pid) {
            self.outgoing = None;
        }
        if self.previous == Some(pid) {
            self.previous = None;
        }
        if self.idle == Some(pid) {
            self.idle = None;
        }
    }

    /// Queues a Sleeping process for the Sleeping -> Ready transition of the next pass.
    pub fn post_wakeup(&mut self, pid: Pid) -> EnqueueOutcome {
        if self.tracked(pid) {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::AlreadyQueued);
        }
        self.wakeups.push_back(pid);
        EnqueueOutcome::Enqueued
    }

    /// Designates the process run when the ready queue is exhausted.
    pub fn set_idle(&mut self, pid: Pid) {
        self.ready.retain(|&p| p != pid);
        self.wakeups.retain(|&p| p != pid);
        self.idle = Some(pid);
    }

    /// Process currently Running.
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Process that ran before the last pass.
    pub fn previous(&self) -> Option<Pid> {
        self.previous
    }

    /// Idle process, if one was designated.
    pub fn idle(&self) -> Option<Pid> {
        self.idle
    }

    /// Ready queue in dispatch order.
    pub fn ready(&self) -> impl Iterator<Item = Pid> + '_ {
        self.ready.iter().copied()
    }

    /// Number of posted wake-ups not yet drained.
    pub fn pending_wakeups(&self) -> usize {
        self.wakeups.len()
    }

    /// Context switches performed so far.
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Runs one scheduling pass and marks the chosen process Running.
    ///
    /// 1. A Running current process goes back to the tail of the ready queue.
    /// 2. The wake-up list is drained; Sleeping entries become Ready.
    /// 3. The first Ready entry of the queue is chosen, stale entries are skipped, and the
    ///    idle process is the fallback.
    /// 4. `switched` reports whether the choice differs from the previous process.
    ///
    /// Returns `None` when nothing can run and no idle process exists.
    pub fn execute_next(&mut self, table: &mut ProcessTable) -> Option<Dispatch> {
        let previous = self.current.take().or(self.outgoing.take());
        self.outgoing = None;

        if let Some(pid) = previous {
            if let Some(proc) = table.get_mut(pid) {
                if proc.state() == ProcessState::Running {
                    proc.set_state(ProcessState::Ready);
                    if self.idle != Some(pid) {
                        self.ready.push_back(pid);
                    }
                }
            }
        }

        while let Some(pid) = self.wakeups.pop_front() {
            if let Some(proc) = table.get_mut(pid) {
                if proc.state() == ProcessState::Sleeping {
                    proc.set_state(ProcessState::Ready);
                    proc.sleep_deadline = None;
                    self.ready.push_back(pid);
                }
            }
        }

        let mut chosen = None;
        while let Some(pid) = self.ready.pop_front() {
            if table.state(pid) == Some(ProcessState::Ready) {
                chosen = Some(pid);
                break;
            }
            crate::log_debug!(target: "sched", "skipping stale ready entry pid={}", pid);
        }
        let next = match chosen {
            Some(pid) => pid,
            None => {
                let idle = self.idle.filter(|&pid| {
                    matches!(table.state(pid), Some(ProcessState::Ready | ProcessState::Running))
                });
                match idle {
                    Some(pid) => pid,
                    None => {
                        self.previous = previous;
                        return None;
                    }
                }
            }
        };

        if let Some(proc) = table.get_mut(next) {
            proc.set_state(ProcessState::Running);
        }
        self.current = Some(next);
        self.previous = previous;
        let switched = previous != Some(next);
        if switched {
            self.switches += 1;
        }
        Some(Dispatch { previous, next, switched })
    }
}
