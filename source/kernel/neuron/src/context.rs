// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-core kernel state passed explicitly to every subsystem
//! OWNERS: @kernel-team
//! PUBLIC API: KernelContext (spawn/kill/share_*/post_event/next_event/tick/raise_irq), Timer
//! DEPENDS_ON: manager::ProcessManager, shares::ShareTable, mm::PhysicalMemory, config
//! INVARIANTS: Killing a process tears down its shares and event queue before peers are told;
//!             every share creation and deletion notifies and wakes the peer

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};

use nexus_abi::{
    MemoryShare, Pid, ProcessEvent, ProcessInfo, ShareOutcome, SysError, TimerInfo,
    MAX_MESSAGE_SIZE, SHARE_PAGES,
};

use crate::config::KernelConfig;
use crate::manager::ProcessManager;
use crate::mm::{HostMemory, PhysicalMemory};
use crate::sched::Dispatch;
use crate::shares::ShareTable;

/// Tick counter driven by the timer interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    ticks: u64,
    frequency: u32,
}

impl Timer {
    /// Creates a timer at tick zero.
    pub fn new(frequency: u32) -> Self {
        Self { ticks: 0, frequency }
    }

    /// Current reading.
    pub fn info(&self) -> TimerInfo {
        TimerInfo { ticks: self.ticks, frequency: self.frequency }
    }
}

/// Everything one core's kernel owns.
pub struct KernelContext {
    config: KernelConfig,
    procs: ProcessManager,
    shares: ShareTable,
    memory: Box<dyn PhysicalMemory + Send>,
    timer: Timer,
    events: BTreeMap<Pid, VecDeque<ProcessEvent>>,
}

impl KernelContext {
    /// Creates a context using `memory` as the memory collaborator.
    pub fn new(config: KernelConfig, memory: Box<dyn PhysicalMemory + Send>) -> Self {
        Self {
            procs: ProcessManager::new(config.max_processes),
            shares: ShareTable::new(config.max_shares),
            timer: Timer::new(config.tick_hz),
            events: BTreeMap::new(),
            memory,
            config,
        }
    }

    /// Creates a context backed by [`HostMemory`] sized from the config.
    pub fn with_host_memory(config: KernelConfig) -> Self {
        let memory = Box::new(HostMemory::new(config.memory_pages));
        Self::new(config, memory)
    }

    /// Active configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Process manager.
    pub fn procs(&self) -> &ProcessManager {
        &self.procs
    }

    /// Process manager, mutably.
    pub fn procs_mut(&mut self) -> &mut ProcessManager {
        &mut self.procs
    }

    /// Memory collaborator.
    pub fn memory(&self) -> &dyn PhysicalMemory {
        self.memory.as_ref()
    }

    /// Live shares.
    pub fn shares(&self) -> &ShareTable {
        &self.shares
    }

    /// Timer reading.
    pub fn timer(&self) -> TimerInfo {
        self.timer.info()
    }

    /// Creates a process with an empty event queue.
    pub fn spawn(&mut self, parent: Pid, command: &str) -> Result<Pid, SysError> {
        let pid = self.procs.create(parent, command)?;
        self.events.insert(pid, VecDeque::new());
        Ok(pid)
    }

    /// Terminates `pid`: unmaps its shares, drops its events, removes it from the scheduler
    /// and tells every former peer with a [`ProcessEvent::ProcessTerminated`] plus a wake-up.
    pub fn kill(&mut self, pid: Pid, status: i32) -> Result<(), SysError> {
        if !self.procs.exists(pid) {
            return Err(SysError::NotFound);
        }
        let peers = self.shares.remove_all(self.memory.as_mut(), pid);
        self.events.remove(&pid);
        self.procs.remove(pid, status)?;
        for peer in peers {
            self.notify(peer, ProcessEvent::ProcessTerminated { pid });
        }
        crate::log_info!(target: "kernel", "pid {} terminated with status {}", pid, status);
        Ok(())
    }

    /// Queues `event` for `pid`. A full queue drops the event.
    pub fn post_event(&mut self, pid: Pid, event: ProcessEvent) -> Result<(), SysError> {
        let depth = self.config.event_queue_depth;
        let queue = self.events.get_mut(&pid).ok_or(SysError::NotFound)?;
        if queue.len() >= depth {
            crate::log_warn!(target: "kernel", "event queue of pid {} full, dropping {:?}", pid, event);
            return Err(SysError::OutOfMemory);
        }
        queue.push_back(event);
        Ok(())
    }

    fn notify(&mut self, pid: Pid, event: ProcessEvent) {
        if self.post_event(pid, event).is_ok() {
            if let Err(err) = self.procs.wakeup(pid) {
                crate::log_debug!(target: "kernel", "no wake-up for pid {}: {:?}", pid, err);
            }
        }
    }

    /// Pops the oldest event for `pid`.
    pub fn next_event(&mut self, pid: Pid) -> Option<ProcessEvent> {
        self.events.get_mut(&pid).and_then(VecDeque::pop_front)
    }

    /// Creates the channel share between `caller` and `peer`, or returns the existing one.
    ///
    /// A new share is announced to `peer` with [`ProcessEvent::ShareCreated`].
    pub fn share_create(
        &mut self,
        caller: Pid,
        peer: Pid,
        message_size: usize,
    ) -> Result<ShareOutcome, SysError> {
        if !self.procs.exists(caller) || !self.procs.exists(peer) {
            return Err(SysError::NotFound);
        }
        if message_size == 0 || message_size > MAX_MESSAGE_SIZE {
            return Err(SysError::InvalidArgument);
        }
        let outcome =
            self.shares.create(self.memory.as_mut(), caller, peer, SHARE_PAGES, message_size)?;
        if let ShareOutcome::Created(share) = &outcome {
            if let Some(view) = self.shares.view(share.tag, peer) {
                self.notify(peer, ProcessEvent::ShareCreated { pid: caller, share: view });
            }
        }
        Ok(outcome)
    }

    /// Returns `caller`'s view of its share with `peer`.
    pub fn share_read(&self, caller: Pid, peer: Pid) -> Result<MemoryShare, SysError> {
        Ok(self.shares.read(caller, peer)?)
    }

    /// Unmaps and releases the share between `caller` and `peer`.
    ///
    /// `peer` is told with [`ProcessEvent::ShareDeleted`] plus a wake-up.
    pub fn share_delete(&mut self, caller: Pid, peer: Pid) -> Result<(), SysError> {
        self.shares.remove(self.memory.as_mut(), caller, peer)?;
        if self.procs.exists(peer) {
            self.notify(peer, ProcessEvent::ShareDeleted { pid: caller });
        }
        Ok(())
    }

    /// Snapshot of `pid`.
    pub fn info(&self, pid: Pid) -> Result<ProcessInfo, SysError> {
        self.procs.get(pid).map(|p| p.info()).ok_or(SysError::NotFound)
    }

    /// Advances the timer by one tick and runs a scheduling pass.
    pub fn tick(&mut self) -> Option<Dispatch> {
        self.timer.ticks += 1;
        self.procs.tick(self.timer.ticks)
    }

    /// Moves the timer forward to `ticks`, expiring sleep deadlines; returns expirations.
    pub fn advance_to(&mut self, ticks: u64) -> usize {
        if ticks <= self.timer.ticks {
            return 0;
        }
        self.timer.ticks = ticks;
        self.procs.expire(ticks)
    }

    /// Delivers interrupt `vector` to every watcher.
    pub fn raise_irq(&mut self, vector: u32) -> usize {
        let watchers = self.procs.irq_watchers(vector).to_vec();
        for &pid in &watchers {
            self.notify(pid, ProcessEvent::Interrupt { vector });
        }
        watchers.len()
    }
}

impl core::fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelContext")
            .field("config", &self.config)
            .field("procs", &self.procs.len())
            .field("shares", &self.shares.len())
            .field("used_pages", &self.memory.used_pages())
            .field("timer", &self.timer)
            .finish()
    }
}
