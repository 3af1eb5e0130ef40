// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared fixtures for end-to-end channel tests on the host kernel
//!
//! Every process is a thread holding a `HostProcess`; the server runs a `ChannelServer`
//! answering echo and increment requests until it has served a quota.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;
use neuron::{HostKernel, HostProcess, KernelConfig};
use nexus_abi::{le_u32, put_le_u32, ChannelMessage, Message, Pid, ProcessCtl, SysError, HEADER_SIZE};
use nexus_ipc::{ChannelServer, IpcError, ServerInstance};

/// Reply carries the request unchanged.
pub const ACTION_ECHO: u32 = 1;
/// Reply carries `value + 1`.
pub const ACTION_INCREMENT: u32 = 2;
/// Handled without a reply.
pub const ACTION_NOTE: u32 = 3;

/// Request/reply message with a sequence number and a 64-bit value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EchoMessage {
    pub header: ChannelMessage,
    pub seq: u32,
    pub value: u64,
}

impl EchoMessage {
    pub fn new(action: u32, seq: u32, value: u64) -> Self {
        Self { header: ChannelMessage::request(action), seq, value }
    }
}

impl Message for EchoMessage {
    const SIZE: usize = HEADER_SIZE + 16;

    fn header(&self) -> &ChannelMessage {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ChannelMessage {
        &mut self.header
    }

    fn encode(&self, out: &mut [u8]) {
        out[..HEADER_SIZE].copy_from_slice(&self.header.to_le_bytes());
        put_le_u32(out, HEADER_SIZE, self.seq);
        put_le_u32(out, HEADER_SIZE + 4, 0);
        out[HEADER_SIZE + 8..HEADER_SIZE + 16].copy_from_slice(&self.value.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> nexus_abi::Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(SysError::InvalidArgument);
        }
        let mut value = [0u8; 8];
        value.copy_from_slice(&bytes[HEADER_SIZE + 8..HEADER_SIZE + 16]);
        Ok(Self {
            header: ChannelMessage::decode(bytes)?,
            seq: le_u32(bytes, HEADER_SIZE),
            value: u64::from_le_bytes(value),
        })
    }
}

/// Server object counting what it handled.
#[derive(Debug, Default)]
pub struct Counter {
    pub served: u32,
    pub notes: u32,
    pub quota: u32,
    /// Sender and sequence number of every request, in handling order.
    pub log: Vec<(Pid, u32)>,
}

impl Counter {
    fn record(&mut self, msg: &EchoMessage) {
        self.served += 1;
        self.log.push((msg.header.from, msg.seq));
    }
}

impl ServerInstance for Counter {
    fn should_exit(&self) -> bool {
        self.quota > 0 && self.served >= self.quota
    }
}

/// Echo server over a host process.
pub type EchoServer = ChannelServer<HostProcess, EchoMessage, Counter>;

/// Kernel with default limits.
pub fn boot() -> Arc<HostKernel> {
    HostKernel::from_config(KernelConfig::default())
}

/// Server with echo, increment and note handlers; exits after `quota` requests (0: never).
pub fn echo_server(sys: HostProcess, quota: u32) -> EchoServer {
    let mut server = ChannelServer::new(sys, Counter { quota, ..Counter::default() });
    server.add_ipc_handler(ACTION_ECHO, |inst: &mut Counter, msg: &mut EchoMessage| inst.record(msg), true);
    server.add_ipc_handler(
        ACTION_INCREMENT,
        |inst: &mut Counter, msg: &mut EchoMessage| {
            inst.record(msg);
            msg.value = msg.value.wrapping_add(1);
        },
        true,
    );
    server.add_ipc_handler(
        ACTION_NOTE,
        |inst: &mut Counter, msg: &mut EchoMessage| {
            inst.record(msg);
            inst.notes += 1;
        },
        false,
    );
    server
}

/// Spawns a server process named `command` and runs it on its own thread.
///
/// The thread hands the server back once the quota is met so tests can inspect it.
pub fn spawn_echo_server(
    kernel: &Arc<HostKernel>,
    command: &str,
    quota: u32,
) -> (Pid, JoinHandle<Result<EchoServer, IpcError>>) {
    let sys = kernel.spawn(Pid::KERNEL, command).expect("spawn server process");
    let pid = sys.pid();
    let handle = thread::spawn(move || {
        let mut server = echo_server(sys, quota);
        server.run()?;
        debug!("e2e: server {} done after {} requests", pid, server.instance().served);
        Ok(server)
    });
    (pid, handle)
}
