// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process session layer over shared-memory channels
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: tests/session.rs (host kernel)
//!
//! A connection to a peer is one four-page share carrying two rings. The process that created
//! the share produces into pages 0-1 and consumes from pages 2-3; the peer mirrors this.
//! Blocking is done here, not in the rings: a full ring wakes the receiver and sleeps until the
//! next tick, an empty ring sleeps until the sender's wake-up arrives.
//!
//! A plain client drains its kernel event queue on every send and receive so the bounded queue
//! never fills. A peer's `ShareDeleted` drops the channels mapped on the released frames. A
//! `ProcessTerminated` drops them once nothing unread is left. [`crate::ChannelServer`] turns
//! draining off and handles the events itself.
//!
//! INVARIANTS:
//!   - every connected peer has exactly one producer and one consumer with the same size
//!   - a request identifier is live in the request table until answered or the peer is forgotten

use log::{debug, warn};
use nexus_abi::{
    ChannelMessage, MemoryShare, Message, MessageKind, Pid, ProcessCtl, ProcessEvent, ShareOutcome,
    SharedRegion, SysError, VmShare, CHANNEL_PAGES, HEADER_SIZE, MAX_MESSAGE_SIZE, PAGE_SIZE,
};

use crate::channel::{Channel, ChannelError, Mode, Reset};
use crate::registry::ChannelRegistry;
use crate::reqrep::RequestTable;
use crate::{IpcError, Result};

/// Times a full ring is retried by [`ChannelClient::send_request`] before giving up.
pub const MAX_SEND_RETRIES: usize = 1;

const HALF: usize = CHANNEL_PAGES * PAGE_SIZE;

fn decode_from<M: Message>(buf: &[u8], pid: Pid) -> Result<M> {
    let mut msg = M::decode(buf)?;
    msg.header_mut().from = pid;
    Ok(msg)
}

/// Session state of one process: its channels, pending requests and system-call handle.
pub struct ChannelClient<S> {
    sys: S,
    registry: ChannelRegistry,
    requests: RequestTable,
    drain_events: bool,
}

impl<S: ProcessCtl + VmShare> ChannelClient<S> {
    /// Creates a client without any connections.
    pub fn new(sys: S) -> Self {
        Self {
            sys,
            registry: ChannelRegistry::new(),
            requests: RequestTable::new(),
            drain_events: true,
        }
    }

    /// Turns automatic event draining on or off; a server loop reads the events itself.
    pub fn set_event_draining(&mut self, enabled: bool) {
        self.drain_events = enabled;
    }

    /// System-call handle.
    pub fn sys(&self) -> &S {
        &self.sys
    }

    /// Identifier of the owning process.
    pub fn pid(&self) -> Pid {
        self.sys.pid()
    }

    /// Channel table.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Channel table, mutably.
    pub fn registry_mut(&mut self) -> &mut ChannelRegistry {
        &mut self.registry
    }

    /// Asynchronous requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Establishes the channel pair to `pid` carrying `message_size`-byte messages.
    ///
    /// A size outside the message bounds is `InvalidArgument`. Any kernel or handshake failure,
    /// a missing peer included, is `IoError` with the cause logged.
    pub fn connect(&mut self, pid: Pid, message_size: usize) -> Result<()> {
        if !(HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&message_size) {
            return Err(IpcError::InvalidArgument);
        }
        if let Some(producer) = self.registry.producer(pid) {
            return if producer.message_size() == message_size {
                Ok(())
            } else {
                warn!("ipc: pid {} already connected with {} bytes", pid, producer.message_size());
                Err(IpcError::IoError)
            };
        }

        let outcome = self.sys.share_create(pid, message_size).map_err(|err| {
            warn!("ipc: share with pid {} failed: {}", pid, err);
            IpcError::IoError
        })?;
        match outcome {
            ShareOutcome::Created(share) => self.attach(pid, &share, message_size, Reset::Hard),
            ShareOutcome::Existing(share) => {
                if share.message_size != message_size {
                    warn!(
                        "ipc: pid {} negotiated {} bytes, caller wants {}",
                        pid, share.message_size, message_size
                    );
                    return Err(IpcError::IoError);
                }
                self.attach(pid, &share, message_size, Reset::Soft)
            }
        }
    }

    /// Attaches to a share announced by the kernel.
    pub fn accept(&mut self, pid: Pid, share: &MemoryShare, message_size: usize) -> Result<()> {
        if share.message_size != message_size {
            warn!(
                "ipc: rejecting share from pid {}: {} bytes, expected {}",
                pid, share.message_size, message_size
            );
            return Err(IpcError::IoError);
        }
        let mapped = self.registry.producer(pid).and_then(Channel::region);
        if let Some(region) = mapped {
            if region.same_frames(&share.region) {
                return Ok(());
            }
            debug!("ipc: pid {} re-shared with pid {}, replacing stale channels", pid, self.pid());
            self.forget(pid);
        }
        self.attach(pid, share, message_size, Reset::Soft)
    }

    fn attach(&mut self, pid: Pid, share: &MemoryShare, size: usize, reset: Reset) -> Result<()> {
        let first = share.region.subregion(0, HALF).ok_or(IpcError::IoError)?;
        let second = share.region.subregion(HALF, HALF).ok_or(IpcError::IoError)?;
        let (outgoing, incoming): (SharedRegion, SharedRegion) =
            if share.creator == self.pid() { (first, second) } else { (second, first) };

        let mut producer = Channel::new(Mode::Producer, size);
        producer.attach(&outgoing, reset)?;
        let mut consumer = Channel::new(Mode::Consumer, size);
        consumer.attach(&incoming, reset)?;

        self.registry.register_producer(pid, producer)?;
        if let Err(err) = self.registry.register_consumer(pid, consumer) {
            if let Err(undo) = self.registry.unregister_producer(pid) {
                warn!("ipc: cannot roll back producer for pid {}: {}", pid, undo);
            }
            return Err(err);
        }
        debug!("ipc: pid {} connected to pid {} ({} bytes, {:?})", self.pid(), pid, size, reset);
        Ok(())
    }

    /// Drops the local channels and pending requests for `pid`; the share is left alone.
    pub fn forget(&mut self, pid: Pid) -> bool {
        let dropped = self.requests.cancel_for(pid);
        if dropped > 0 {
            debug!("ipc: dropped {} pending requests to pid {}", dropped, pid);
        }
        self.registry.remove_process(pid)
    }

    /// Drops the channels to `pid` if they no longer sit on the share the kernel reports.
    ///
    /// Returns `true` when channels were dropped. Channels on the live share are kept.
    pub fn drop_if_stale(&mut self, pid: Pid) -> bool {
        let Some(region) = self.registry.producer(pid).and_then(Channel::region) else {
            return false;
        };
        let live = match self.sys.share_read(pid) {
            Ok(share) => region.same_frames(&share.region),
            Err(_) => false,
        };
        if live {
            return false;
        }
        debug!("ipc: share between pid {} and pid {} is gone", self.pid(), pid);
        self.forget(pid)
    }

    /// Handles every queued kernel event the way a plain client needs; returns how many.
    pub fn drain_events(&mut self) -> usize {
        let mut drained = 0;
        while let Some(event) = self.sys.next_event() {
            drained += 1;
            match event {
                ProcessEvent::ShareDeleted { pid } => {
                    self.drop_if_stale(pid);
                }
                ProcessEvent::ProcessTerminated { pid } => {
                    let unread = self.registry.consumer(pid).map_or(0, Channel::pending);
                    if unread == 0 {
                        self.forget(pid);
                    } else {
                        debug!("ipc: pid {} terminated with {} unread messages", pid, unread);
                    }
                }
                ProcessEvent::ShareCreated { pid, .. } => {
                    debug!("ipc: share from pid {} attaches on first use", pid);
                }
                ProcessEvent::Interrupt { vector } => {
                    debug!("ipc: pid {} ignores interrupt {}", self.pid(), vector);
                }
            }
        }
        drained
    }

    /// Drops the channels to `pid` and releases the share.
    pub fn disconnect(&mut self, pid: Pid) -> Result<()> {
        if !self.forget(pid) {
            return Err(IpcError::NotFound);
        }
        match self.sys.share_delete(pid) {
            Ok(()) | Err(SysError::NotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Connects on first use. A peer that does not exist is `NotFound`; any other connect
    /// failure keeps its own kind.
    fn ensure_connected(&mut self, pid: Pid, message_size: usize) -> Result<()> {
        if self.drain_events {
            self.drain_events();
        }
        if self.registry.is_connected(pid) {
            return Ok(());
        }
        self.connect(pid, message_size).map_err(|err| {
            debug!("ipc: auto-connect to pid {} failed: {}", pid, err);
            match self.sys.info(pid) {
                Err(_) => IpcError::NotFound,
                Ok(_) => err,
            }
        })
    }

    fn producer(&mut self, pid: Pid) -> Result<&mut Channel> {
        self.registry.producer_mut(pid).ok_or(IpcError::NotFound)
    }

    fn consumer(&mut self, pid: Pid) -> Result<&mut Channel> {
        self.registry.consumer_mut(pid).ok_or(IpcError::NotFound)
    }

    fn sleep_one_tick(&self) -> Result<()> {
        let deadline = self.sys.timer()?.ticks.saturating_add(1);
        Ok(self.sys.enter_sleep(Some(deadline))?)
    }

    /// Writes `bytes` to `pid` once; `Ok(false)` when the ring is full.
    ///
    /// The receiver is woken either way so a full ring gets drained.
    pub fn try_send_bytes(&mut self, pid: Pid, bytes: &[u8]) -> Result<bool> {
        self.ensure_connected(pid, bytes.len())?;
        let status = {
            let producer = self.producer(pid)?;
            producer.write(bytes).and_then(|()| producer.flush())
        };
        match status {
            Ok(()) => {
                self.sys.wakeup(pid)?;
                Ok(true)
            }
            Err(ChannelError::Full) => {
                self.sys.wakeup(pid)?;
                Ok(false)
            }
            Err(ChannelError::InvalidSize) => Err(IpcError::InvalidArgument),
            Err(err) => {
                warn!("ipc: write to pid {} failed: {}", pid, err);
                Err(IpcError::IoError)
            }
        }
    }

    /// Writes `bytes` to `pid`, sleeping while the ring is full.
    pub fn send_bytes(&mut self, pid: Pid, bytes: &[u8]) -> Result<()> {
        while !self.try_send_bytes(pid, bytes)? {
            self.sleep_one_tick()?;
        }
        Ok(())
    }

    /// Sends `msg` to `pid`, blocking while the ring is full.
    pub fn sync_send_to<M: Message>(&mut self, msg: &M, pid: Pid) -> Result<()> {
        let mut buf = vec![0u8; M::SIZE];
        msg.encode(&mut buf);
        self.send_bytes(pid, &buf)
    }

    /// Writes `msg` to `pid` if there is room; `Ok(false)` when the ring is full.
    pub fn try_send_to<M: Message>(&mut self, msg: &M, pid: Pid) -> Result<bool> {
        let mut buf = vec![0u8; M::SIZE];
        msg.encode(&mut buf);
        self.try_send_bytes(pid, &buf)
    }

    /// Reads one raw message from `pid` into `buf`; `Ok(false)` when nothing is queued.
    pub fn read_bytes(&mut self, pid: Pid, buf: &mut [u8]) -> Result<bool> {
        match self.consumer(pid)?.read(buf) {
            Ok(()) => Ok(true),
            Err(ChannelError::Empty) => Ok(false),
            Err(ChannelError::InvalidSize) => Err(IpcError::InvalidArgument),
            Err(err) => {
                warn!("ipc: read from pid {} failed: {}", pid, err);
                Err(IpcError::IoError)
            }
        }
    }

    /// Reads the next message from `pid` if one is queued.
    pub fn try_receive_from<M: Message>(&mut self, msg: &mut M, pid: Pid) -> Result<bool> {
        self.ensure_connected(pid, M::SIZE)?;
        let mut buf = vec![0u8; M::SIZE];
        if !self.read_bytes(pid, &mut buf)? {
            return Ok(false);
        }
        *msg = decode_from(&buf, pid)?;
        Ok(true)
    }

    /// Receives the next message from `pid`, sleeping while its ring is empty.
    ///
    /// Returns `NotFound` once the peer has exited or released the share and everything it
    /// sent has been read.
    pub fn sync_receive_from<M: Message>(&mut self, msg: &mut M, pid: Pid) -> Result<()> {
        self.ensure_connected(pid, M::SIZE)?;
        let mut buf = vec![0u8; M::SIZE];
        loop {
            if self.read_bytes(pid, &mut buf)? {
                *msg = decode_from(&buf, pid)?;
                return Ok(());
            }
            if self.sys.info(pid).is_err() {
                debug!("ipc: pid {} went away while pid {} waited", pid, self.pid());
                self.forget(pid);
                return Err(IpcError::NotFound);
            }
            if self.drain_events && self.drain_events() > 0 {
                continue;
            }
            self.sys.enter_sleep(None)?;
        }
    }

    /// Sends `msg` to `pid` and waits for the reply, which overwrites `msg`.
    pub fn sync_send_receive<M: Message>(&mut self, msg: &mut M, pid: Pid) -> Result<()> {
        self.sync_send_to(msg, pid)?;
        self.sync_receive_from(msg, pid)
    }

    /// Polls every consumer once and returns the sender of the first message found.
    pub fn receive_any<M: Message>(&mut self, msg: &mut M) -> Result<Pid> {
        let mut buf = vec![0u8; M::SIZE];
        for pid in self.registry.consumer_pids() {
            if self.registry.consumer(pid).map(Channel::message_size) != Some(M::SIZE) {
                continue;
            }
            if self.read_bytes(pid, &mut buf)? {
                *msg = decode_from(&buf, pid)?;
                return Ok(pid);
            }
        }
        Err(IpcError::NotFound)
    }

    /// Sends `msg` as an asynchronous request; `callback` runs when the response is processed.
    ///
    /// Returns the identifier placed in the header. Never blocks: a full ring is an `IoError`.
    pub fn send_request<M, F>(&mut self, pid: Pid, msg: &mut M, mut callback: F) -> Result<u32>
    where
        M: Message + 'static,
        F: FnMut(M) + Send + 'static,
    {
        self.ensure_connected(pid, M::SIZE)?;
        let identifier = self.requests.insert(
            pid,
            Box::new(move |bytes: &[u8]| match decode_from::<M>(bytes, pid) {
                Ok(response) => callback(response),
                Err(err) => warn!("ipc: malformed response from pid {}: {}", pid, err),
            }),
        )?;
        {
            let header: &mut ChannelMessage = msg.header_mut();
            header.kind = MessageKind::Request;
            header.identifier = identifier;
        }
        let mut buf = vec![0u8; M::SIZE];
        msg.encode(&mut buf);

        let mut attempts = 0;
        loop {
            match self.producer(pid)?.write(&buf) {
                Ok(()) => break,
                Err(ChannelError::Full) if attempts < MAX_SEND_RETRIES => {
                    attempts += 1;
                    self.sys.wakeup(pid)?;
                    if let Err(err) = self.sys.yield_now() {
                        debug!("ipc: pid {} cannot yield: {}", self.pid(), err);
                    }
                }
                Err(err) => {
                    if let Err(undo) = self.requests.cancel(pid, identifier) {
                        debug!("ipc: request {} to pid {} already gone: {}", identifier, pid, undo);
                    }
                    warn!("ipc: request to pid {} not sent: {}", pid, err);
                    return Err(match err {
                        ChannelError::InvalidSize => IpcError::InvalidArgument,
                        _ => IpcError::IoError,
                    });
                }
            }
        }
        self.sys.wakeup(pid)?;
        debug!("ipc: request {} sent to pid {}", identifier, pid);
        Ok(identifier)
    }

    /// Matches a raw response from `pid` against the request table and runs its callback.
    pub fn process_response(&mut self, pid: Pid, bytes: &[u8]) -> Result<()> {
        let header = ChannelMessage::decode(bytes)?;
        if header.kind != MessageKind::Response {
            return Err(IpcError::InvalidArgument);
        }
        self.requests.complete(pid, header.identifier, bytes).inspect_err(|_| {
            warn!("ipc: unexpected response {} from pid {}", header.identifier, pid);
        })
    }
}

impl<S> core::fmt::Debug for ChannelClient<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("registry", &self.registry)
            .field("requests", &self.requests)
            .field("drain_events", &self.drain_events)
            .finish()
    }
}
