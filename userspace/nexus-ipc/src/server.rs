// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Action-dispatching server loop over the channels of one process
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: tests/session.rs (host kernel)
//!
//! PUBLIC API:
//!   - ServerInstance: hooks the loop calls on the server object
//!   - ChannelServer: handler tables, kernel event intake, channel draining, timeouts
//!
//! One pass of the loop drains the kernel event queue, then every consumer channel. A request
//! is routed by its `action` to a handler that may rewrite the message in place; when the
//! handler was registered with `send_reply` the rewritten message goes back as a response.
//! A reply that finds the client's ring full is dropped and logged; the loop never waits on
//! one client. The process sleeps once a pass finds nothing to do.

use std::collections::BTreeMap;

use log::{debug, error, warn};
use nexus_abi::{
    ChannelMessage, MemoryShare, Message, MessageKind, Pid, ProcessCtl, ProcessEvent, SysError, VmShare,
};

use crate::client::ChannelClient;
use crate::{IpcError, Result};

/// Callbacks a server object exposes to its loop.
pub trait ServerInstance {
    /// Called when the timeout set with [`ChannelServer::set_timeout`] expires.
    fn timeout(&mut self) {}

    /// Retries deferred work; return `true` while progress is being made.
    fn retry_requests(&mut self) -> bool {
        false
    }

    /// Ends [`ChannelServer::run`] once it returns `true`.
    fn should_exit(&self) -> bool {
        false
    }
}

type IpcHandlerFn<T, M> = Box<dyn FnMut(&mut T, &mut M) + Send>;
type IrqHandlerFn<T> = Box<dyn FnMut(&mut T, u32) + Send>;

struct IpcHandler<T, M> {
    handler: IpcHandlerFn<T, M>,
    send_reply: bool,
}

/// Server loop for messages of type `M` handled by the instance `T`.
pub struct ChannelServer<S, M, T> {
    client: ChannelClient<S>,
    instance: T,
    ipc_handlers: BTreeMap<u32, IpcHandler<T, M>>,
    irq_handlers: BTreeMap<u32, IrqHandlerFn<T>>,
    timeout_msec: Option<u64>,
    deadline: Option<u64>,
}

impl<S, M, T> ChannelServer<S, M, T>
where
    S: ProcessCtl + VmShare,
    M: Message,
    T: ServerInstance,
{
    /// Creates a server without handlers.
    pub fn new(sys: S, instance: T) -> Self {
        let mut client = ChannelClient::new(sys);
        client.set_event_draining(false);
        Self {
            client,
            instance,
            ipc_handlers: BTreeMap::new(),
            irq_handlers: BTreeMap::new(),
            timeout_msec: None,
            deadline: None,
        }
    }

    /// Server object.
    pub fn instance(&self) -> &T {
        &self.instance
    }

    /// Server object, mutably.
    pub fn instance_mut(&mut self) -> &mut T {
        &mut self.instance
    }

    /// Session layer used for replies and outgoing requests.
    pub fn client(&self) -> &ChannelClient<S> {
        &self.client
    }

    /// Session layer, mutably.
    pub fn client_mut(&mut self) -> &mut ChannelClient<S> {
        &mut self.client
    }

    /// Routes requests carrying `action` to `handler`; replaces an earlier handler.
    pub fn add_ipc_handler<F>(&mut self, action: u32, handler: F, send_reply: bool)
    where
        F: FnMut(&mut T, &mut M) + Send + 'static,
    {
        self.ipc_handlers.insert(action, IpcHandler { handler: Box::new(handler), send_reply });
    }

    /// Subscribes to interrupt `vector` and routes it to `handler`.
    pub fn add_irq_handler<F>(&mut self, vector: u32, handler: F) -> Result<()>
    where
        F: FnMut(&mut T, u32) + Send + 'static,
    {
        self.client.sys().watch_irq(vector)?;
        self.irq_handlers.insert(vector, Box::new(handler));
        Ok(())
    }

    /// Calls [`ServerInstance::timeout`] every `msec` milliseconds of idleness.
    pub fn set_timeout(&mut self, msec: u64) -> Result<()> {
        let timer = self.client.sys().timer()?;
        self.timeout_msec = Some(msec);
        self.deadline = Some(timer.deadline_after_ms(msec));
        Ok(())
    }

    /// Attaches to a share created by `pid`, rejecting a different message size.
    pub fn accept(&mut self, pid: Pid, share: &MemoryShare) -> Result<()> {
        self.client.accept(pid, share, M::SIZE)
    }

    /// Handles every queued kernel event; returns how many were handled.
    pub fn read_kernel_events(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.client.sys().next_event() {
            handled += 1;
            match event {
                ProcessEvent::ShareCreated { pid, share } => {
                    if let Err(err) = self.accept(pid, &share) {
                        error!("ipc: cannot accept share from pid {}: {}", pid, err);
                        self.release_share(pid);
                    }
                }
                ProcessEvent::ShareDeleted { pid } => {
                    if self.client.drop_if_stale(pid) {
                        debug!("ipc: pid {} disconnected, channels released", pid);
                    }
                }
                ProcessEvent::ProcessTerminated { pid } => {
                    if self.client.forget(pid) {
                        debug!("ipc: pid {} terminated, channels released", pid);
                    }
                    self.release_share(pid);
                }
                ProcessEvent::Interrupt { vector } => match self.irq_handlers.get_mut(&vector) {
                    Some(handler) => handler(&mut self.instance, vector),
                    None => warn!("ipc: interrupt {} without handler", vector),
                },
            }
        }
        handled
    }

    fn release_share(&self, pid: Pid) {
        match self.client.sys().share_delete(pid) {
            Ok(()) | Err(SysError::NotFound) => {}
            Err(err) => warn!("ipc: cannot release share with pid {}: {}", pid, err),
        }
    }

    /// Drains every consumer channel; returns the number of messages handled.
    pub fn read_channels(&mut self) -> usize {
        let mut buf = vec![0u8; M::SIZE];
        let mut handled = 0;
        for pid in self.client.registry().consumer_pids() {
            if self.client.registry().consumer(pid).map(|c| c.message_size()) != Some(M::SIZE) {
                continue;
            }
            loop {
                match self.client.read_bytes(pid, &mut buf) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        warn!("ipc: dropping channel from pid {}: {}", pid, err);
                        break;
                    }
                }
                handled += 1;
                self.dispatch(pid, &buf);
            }
        }
        handled
    }

    fn dispatch(&mut self, pid: Pid, buf: &[u8]) {
        let header = match ChannelMessage::decode(buf) {
            Ok(header) => header,
            Err(err) => {
                warn!("ipc: malformed message from pid {}: {}", pid, err);
                return;
            }
        };
        if header.kind == MessageKind::Response {
            if let Err(err) = self.client.process_response(pid, buf) {
                debug!("ipc: response {} from pid {} dropped: {}", header.identifier, pid, err);
            }
            return;
        }
        let mut msg = match M::decode(buf) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("ipc: undecodable action {} from pid {}: {}", header.action, pid, err);
                return;
            }
        };
        msg.header_mut().from = pid;

        let Some(entry) = self.ipc_handlers.get_mut(&header.action) else {
            warn!("ipc: unknown action {} from pid {}", header.action, pid);
            return;
        };
        (entry.handler)(&mut self.instance, &mut msg);
        if !entry.send_reply {
            return;
        }

        msg.header_mut().kind = MessageKind::Response;
        let mut out = vec![0u8; M::SIZE];
        msg.encode(&mut out);
        match self.client.try_send_bytes(pid, &out) {
            Ok(true) => {}
            Ok(false) => {
                error!("ipc: reply to pid {} for action {} dropped: ring full", pid, header.action);
            }
            Err(err) => warn!("ipc: reply to pid {} for action {} lost: {}", pid, header.action, err),
        }
    }

    /// Lets the instance retry deferred work until it reports no progress.
    pub fn retry_all_requests(&mut self) -> usize {
        let mut rounds = 0;
        while self.instance.retry_requests() {
            rounds += 1;
        }
        rounds
    }

    /// Fires the timeout callback if its deadline passed; returns `true` when it fired.
    pub fn check_timeout(&mut self) -> Result<bool> {
        let (Some(deadline), Some(msec)) = (self.deadline, self.timeout_msec) else {
            return Ok(false);
        };
        let timer = self.client.sys().timer()?;
        if timer.ticks < deadline {
            return Ok(false);
        }
        self.instance.timeout();
        self.deadline = Some(timer.deadline_after_ms(msec));
        Ok(true)
    }

    /// One pass over kernel events and channels; returns the amount of work done.
    pub fn run_once(&mut self) -> Result<usize> {
        let events = self.read_kernel_events();
        let messages = self.read_channels();
        self.retry_all_requests();
        let fired = self.check_timeout()?;
        Ok(events + messages + usize::from(fired))
    }

    /// Serves until the instance asks to exit, sleeping whenever a pass was idle.
    pub fn run(&mut self) -> Result<()> {
        while !self.instance.should_exit() {
            if self.run_once()? == 0 {
                if let Err(err) = self.client.sys().enter_sleep(self.deadline) {
                    error!("ipc: server pid {} cannot sleep: {}", self.client.pid(), err);
                    return Err(IpcError::from(err));
                }
            }
        }
        debug!("ipc: server pid {} exiting", self.client.pid());
        Ok(())
    }
}

impl<S, M, T: core::fmt::Debug> core::fmt::Debug for ChannelServer<S, M, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelServer")
            .field("instance", &self.instance)
            .field("ipc_handlers", &self.ipc_handlers.keys().collect::<Vec<_>>())
            .field("irq_handlers", &self.irq_handlers.keys().collect::<Vec<_>>())
            .field("timeout_msec", &self.timeout_msec)
            .finish()
    }
}
