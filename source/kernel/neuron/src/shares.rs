// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared-memory table backing channel pairs between processes
//! OWNERS: @kernel-mm-team
//! PUBLIC API: ShareTable (create/read/remove/remove_all), ShareError
//! DEPENDS_ON: mm::PhysicalMemory
//! INVARIANTS: At most one share per unordered process pair; at most `max_per_process` shares
//!             per process; removal unmaps both sides before releasing the frames

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use nexus_abi::{Access, MemoryShare, Pid, ShareOutcome, SharedRegion, SysError};

use crate::mm::{Frames, MemoryError, PhysicalMemory};

/// Errors raised by the share table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareError {
    /// A process cannot share with itself.
    InvalidArgument,
    /// No share between the two processes.
    NotFound,
    /// Frame allocation failed or the per-process limit was reached.
    OutOfMemory,
    /// Mapping the frames into an address space failed.
    MemoryMapError,
}

impl fmt::Display for ShareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid share request"),
            Self::NotFound => write!(f, "share not found"),
            Self::OutOfMemory => write!(f, "out of share memory"),
            Self::MemoryMapError => write!(f, "share mapping failed"),
        }
    }
}

impl From<ShareError> for SysError {
    fn from(err: ShareError) -> Self {
        match err {
            ShareError::InvalidArgument => SysError::InvalidArgument,
            ShareError::NotFound => SysError::NotFound,
            ShareError::OutOfMemory => SysError::OutOfMemory,
            ShareError::MemoryMapError => SysError::IoError,
        }
    }
}

impl From<MemoryError> for ShareError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfMemory => ShareError::OutOfMemory,
            MemoryError::InvalidArgument => ShareError::InvalidArgument,
            MemoryError::NotMapped => ShareError::MemoryMapError,
        }
    }
}

#[derive(Debug)]
struct ShareEntry {
    id: u32,
    creator: Pid,
    peer: Pid,
    message_size: usize,
    frames: Frames,
    creator_view: SharedRegion,
    peer_view: SharedRegion,
}

impl ShareEntry {
    fn involves(&self, pid: Pid) -> bool {
        self.creator == pid || self.peer == pid
    }

    fn joins(&self, a: Pid, b: Pid) -> bool {
        (self.creator == a && self.peer == b) || (self.creator == b && self.peer == a)
    }

    fn view_for(&self, pid: Pid) -> MemoryShare {
        let (other, region) = if pid == self.creator {
            (self.peer, &self.creator_view)
        } else {
            (self.creator, &self.peer_view)
        };
        MemoryShare {
            pid: other,
            creator: self.creator,
            core_id: 0,
            tag: self.id,
            region: region.clone(),
            message_size: self.message_size,
            attached: true,
        }
    }
}

/// All live shares of one core.
#[derive(Debug)]
pub struct ShareTable {
    entries: Vec<ShareEntry>,
    max_per_process: usize,
    next_id: u32,
}

impl ShareTable {
    /// Creates a table allowing `max_per_process` shares per process.
    pub fn new(max_per_process: usize) -> Self {
        Self { entries: Vec::new(), max_per_process, next_id: 1 }
    }

    fn count(&self, pid: Pid) -> usize {
        self.entries.iter().filter(|e| e.involves(pid)).count()
    }

    /// Creates a share of `pages` pages between `creator` and `peer`, or returns the one that
    /// already joins them.
    pub fn create(
        &mut self,
        memory: &mut dyn PhysicalMemory,
        creator: Pid,
        peer: Pid,
        pages: usize,
        message_size: usize,
    ) -> Result<ShareOutcome, ShareError> {
        if creator == peer {
            return Err(ShareError::InvalidArgument);
        }
        if let Some(entry) = self.entries.iter().find(|e| e.joins(creator, peer)) {
            return Ok(ShareOutcome::Existing(entry.view_for(creator)));
        }
        if self.count(creator) >= self.max_per_process || self.count(peer) >= self.max_per_process
        {
            return Err(ShareError::OutOfMemory);
        }

        let access = Access::READABLE | Access::WRITABLE | Access::USER | Access::UNCACHED;
        let frames = memory.allocate(pages)?;
        let creator_view = match memory.map(creator, &frames, access) {
            Ok(region) => region,
            Err(err) => {
                memory.release(frames);
                crate::log_error!(target: "shares", "map failed for pid={}: {}", creator, err);
                return Err(ShareError::MemoryMapError);
            }
        };
        let peer_view = match memory.map(peer, &frames, access) {
            Ok(region) => region,
            Err(err) => {
                let _ = memory.unmap(creator, &creator_view);
                memory.release(frames);
                crate::log_error!(target: "shares", "map failed for pid={}: {}", peer, err);
                return Err(ShareError::MemoryMapError);
            }
        };

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let entry = ShareEntry { id, creator, peer, message_size, frames, creator_view, peer_view };
        let view = entry.view_for(creator);
        self.entries.push(entry);
        crate::log_debug!(target: "shares", "share {} created {} <-> {}", id, creator, peer);
        Ok(ShareOutcome::Created(view))
    }

    /// Returns `caller`'s view of its share with `peer`.
    pub fn read(&self, caller: Pid, peer: Pid) -> Result<MemoryShare, ShareError> {
        self.entries
            .iter()
            .find(|e| e.joins(caller, peer))
            .map(|e| e.view_for(caller))
            .ok_or(ShareError::NotFound)
    }

    /// Returns `pid`'s view of `share`, used to notify the peer.
    pub fn view(&self, share: u32, pid: Pid) -> Option<MemoryShare> {
        self.entries.iter().find(|e| e.id == share && e.involves(pid)).map(|e| e.view_for(pid))
    }

    /// Unmaps and releases the share between `a` and `b`.
    pub fn remove(&mut self, memory: &mut dyn PhysicalMemory, a: Pid, b: Pid) -> Result<(), ShareError> {
        let index = self.entries.iter().position(|e| e.joins(a, b)).ok_or(ShareError::NotFound)?;
        let entry = self.entries.swap_remove(index);
        Self::release(memory, entry);
        Ok(())
    }

    /// Unmaps and releases every share involving `pid`; returns the peers.
    pub fn remove_all(&mut self, memory: &mut dyn PhysicalMemory, pid: Pid) -> Vec<Pid> {
        let mut peers = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.involves(pid) {
                peers.push(if entry.creator == pid { entry.peer } else { entry.creator });
                Self::release(memory, entry);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        peers
    }

    fn release(memory: &mut dyn PhysicalMemory, entry: ShareEntry) {
        if let Err(err) = memory.unmap(entry.creator, &entry.creator_view) {
            crate::log_warn!(target: "shares", "unmap pid={}: {}", entry.creator, err);
        }
        if let Err(err) = memory.unmap(entry.peer, &entry.peer_view) {
            crate::log_warn!(target: "shares", "unmap pid={}: {}", entry.peer, err);
        }
        memory.release(entry.frames);
    }

    /// Number of live shares.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no share exists.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
