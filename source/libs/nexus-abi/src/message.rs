// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Channel message wire header.
//!
//! Every message starts with a 16-byte little-endian header followed by type-specific fields.
//! The total size is fixed per channel and negotiated when the channel pair is created.

use crate::{Pid, Result, SysError};

/// Size of [`ChannelMessage`] on the wire.
pub const HEADER_SIZE: usize = 16;

/// Distinguishes requests from the responses correlated to them.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Message expecting handling by the receiver.
    Request = 0,
    /// Reply to an earlier request carrying the same identifier.
    Response = 1,
}

impl MessageKind {
    /// Decodes a raw discriminant.
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Header shared by all channel messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Sender; overwritten by the receiving side with the channel's peer.
    pub from: Pid,
    /// Handler selector.
    pub action: u32,
    /// Request or response.
    pub kind: MessageKind,
    /// Protocol specific flags.
    pub flags: u16,
    /// Correlates asynchronous requests with their responses.
    pub identifier: u32,
}

impl ChannelMessage {
    /// Creates a request header for `action`.
    pub const fn request(action: u32) -> Self {
        Self { from: Pid::KERNEL, action, kind: MessageKind::Request, flags: 0, identifier: 0 }
    }

    /// Serialises the header to little-endian bytes.
    pub fn to_le_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.from.as_raw().to_le_bytes());
        bytes[4..8].copy_from_slice(&self.action.to_le_bytes());
        bytes[8..10].copy_from_slice(&(self.kind as u16).to_le_bytes());
        bytes[10..12].copy_from_slice(&self.flags.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.identifier.to_le_bytes());
        bytes
    }

    /// Deserialises a header, rejecting unknown message kinds.
    pub fn from_le_bytes(bytes: [u8; HEADER_SIZE]) -> Result<Self> {
        let kind = u16::from_le_bytes([bytes[8], bytes[9]]);
        Ok(Self {
            from: Pid::from_raw(le_u32(&bytes, 0)),
            action: le_u32(&bytes, 4),
            kind: MessageKind::from_raw(kind).ok_or(SysError::InvalidArgument)?,
            flags: u16::from_le_bytes([bytes[10], bytes[11]]),
            identifier: le_u32(&bytes, 12),
        })
    }

    /// Decodes the header at the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(bytes.get(..HEADER_SIZE).ok_or(SysError::InvalidArgument)?);
        Self::from_le_bytes(raw)
    }
}

/// Fixed-size message carried over a channel.
///
/// `encode` receives a buffer of exactly `SIZE` bytes; `decode` receives the same.
pub trait Message: Sized {
    /// Encoded size, including the header.
    const SIZE: usize;

    /// Header of the message.
    fn header(&self) -> &ChannelMessage;

    /// Mutable header of the message.
    fn header_mut(&mut self) -> &mut ChannelMessage;

    /// Writes the message into `out`.
    fn encode(&self, out: &mut [u8]);

    /// Parses a message, `InvalidArgument` when malformed.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Reads a little-endian `u32` at `offset`; missing bytes read as zero.
pub fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    for (dst, src) in raw.iter_mut().zip(bytes.iter().skip(offset)) {
        *dst = *src;
    }
    u32::from_le_bytes(raw)
}

/// Writes `value` little-endian at `offset`; bytes past the end are dropped.
pub fn put_le_u32(bytes: &mut [u8], offset: usize, value: u32) {
    for (dst, src) in bytes.iter_mut().skip(offset).zip(value.to_le_bytes()) {
        *dst = src;
    }
}
