// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shares and kernel events delivered to processes.

use crate::{Pid, SharedRegion};

/// One process's view of a memory share with a peer.
#[derive(Clone, Debug)]
pub struct MemoryShare {
    /// The peer on the other side of the share.
    pub pid: Pid,
    /// Process that allocated the share; it produces into the first half.
    pub creator: Pid,
    /// Core the peer runs on.
    pub core_id: u32,
    /// Distinguishes several shares with the same peer.
    pub tag: u32,
    /// The caller's mapping.
    pub region: SharedRegion,
    /// Message size recorded by the process that created the share.
    pub message_size: usize,
    /// Whether the share is still mapped on both sides.
    pub attached: bool,
}

/// Outcome of [`crate::VmShare::share_create`].
#[must_use = "the share must be attached or released"]
#[derive(Clone, Debug)]
pub enum ShareOutcome {
    /// A new share was allocated; the caller is its creator.
    Created(MemoryShare),
    /// A share joining the two processes already existed; see [`MemoryShare::creator`].
    Existing(MemoryShare),
}

impl ShareOutcome {
    /// Returns the share regardless of who created it.
    pub fn share(&self) -> &MemoryShare {
        match self {
            Self::Created(share) | Self::Existing(share) => share,
        }
    }

    /// Returns `true` if the caller created the share.
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Notification queued by the kernel for a process.
#[derive(Clone, Debug)]
pub enum ProcessEvent {
    /// `pid` created a share with the receiver; `share` is the receiver's view.
    ShareCreated {
        /// Creator of the share.
        pid: Pid,
        /// Receiver's view of the share.
        share: MemoryShare,
    },
    /// `pid` released its share with the receiver; the receiver's mapping is gone.
    ShareDeleted {
        /// Process that deleted the share.
        pid: Pid,
    },
    /// `pid` terminated; its shares are already unmapped.
    ProcessTerminated {
        /// The terminated process.
        pid: Pid,
    },
    /// A watched interrupt fired.
    Interrupt {
        /// Interrupt vector.
        vector: u32,
    },
}
