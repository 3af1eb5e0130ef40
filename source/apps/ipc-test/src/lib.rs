// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: IPC test application (client and server halves) over the host kernel
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/cli.rs
//!
//! PUBLIC API:
//!   - TestMessage / TestAction: wire message carried between the two halves
//!   - IpcTestServer + build_server(): server object with its action handlers
//!   - find_server(): locate the server process by its command line
//!   - run_client() / run(): the client flow and the whole test on a fresh kernel
//!   - AppError: failures mapped to the process exit code
//!
//! DEPENDENCIES:
//!   - neuron: host kernel (threads as processes)
//!   - nexus-ipc: channel client and server
//!   - log: progress markers

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info};
use neuron::{ConfigError, HostKernel, HostProcess, KernelConfig};
use nexus_abi::{le_u32, put_le_u32, ChannelMessage, Message, Pid, ProcessCtl, SysError, VmShare, HEADER_SIZE};
use nexus_ipc::{ChannelClient, ChannelServer, IpcError, ServerInstance};
use thiserror::Error;

/// Command line the server process is spawned with; the client looks for it.
pub const SERVER_COMMAND: &str = "/server/ipctest/server";
/// Command line of the client process.
pub const CLIENT_COMMAND: &str = "/bin/ipctest";
/// Payload the client puts into every request.
pub const REQUEST_DATA: u32 = 0x1234_5678;

/// Actions understood by the server.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestAction {
    /// Answered with `0xaaaaaaaa`.
    A = 0,
    /// Answered with `0xbbbbbbbb`.
    B = 1,
}

impl TestAction {
    /// Decodes a wire action.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::A),
            1 => Some(Self::B),
            _ => None,
        }
    }

    /// Data the server writes into the reply.
    pub const fn reply_data(self) -> u32 {
        match self {
            Self::A => 0xaaaa_aaaa,
            Self::B => 0xbbbb_bbbb,
        }
    }

    /// Action used in round `round`; rounds start with `B` and alternate.
    pub const fn for_round(round: u32) -> Self {
        if round % 2 == 0 {
            Self::B
        } else {
            Self::A
        }
    }
}

/// Header plus one data word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestMessage {
    /// Channel header.
    pub header: ChannelMessage,
    /// Request payload, replaced by the server's answer.
    pub data: u32,
}

impl TestMessage {
    /// Request for `action` carrying `data`.
    pub fn request(action: TestAction, data: u32) -> Self {
        Self { header: ChannelMessage::request(action as u32), data }
    }
}

impl Message for TestMessage {
    const SIZE: usize = HEADER_SIZE + 4;

    fn header(&self) -> &ChannelMessage {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ChannelMessage {
        &mut self.header
    }

    fn encode(&self, out: &mut [u8]) {
        out[..HEADER_SIZE].copy_from_slice(&self.header.to_le_bytes());
        put_le_u32(out, HEADER_SIZE, self.data);
    }

    fn decode(bytes: &[u8]) -> nexus_abi::Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(SysError::InvalidArgument);
        }
        Ok(Self { header: ChannelMessage::decode(bytes)?, data: le_u32(bytes, HEADER_SIZE) })
    }
}

/// Errors that end the test with a nonzero exit code.
#[derive(Debug, Error)]
pub enum AppError {
    /// `--config` could not be loaded.
    #[error("kernel config: {0}")]
    Config(#[from] ConfigError),
    /// No process runs [`SERVER_COMMAND`].
    #[error("failed to find PID for ipctest server")]
    ServerNotFound,
    /// The connect handshake failed.
    #[error("failed to connect to ipctest server: {0}")]
    Connect(#[source] IpcError),
    /// The request could not be written.
    #[error("failed to send message to PID {pid}: {source}")]
    Send {
        /// Server process.
        pid: Pid,
        /// Transport error.
        source: IpcError,
    },
    /// The reply could not be read.
    #[error("failed to receive message from PID {pid}: {source}")]
    Receive {
        /// Server process.
        pid: Pid,
        /// Transport error.
        source: IpcError,
    },
    /// The server answered with the wrong data.
    #[error("reply carried {actual:#010x}, expected {expected:#010x}")]
    UnexpectedReply {
        /// Data the action should produce.
        expected: u32,
        /// Data received.
        actual: u32,
    },
    /// A process could not be spawned or the server loop failed.
    #[error("kernel: {0}")]
    Kernel(#[source] IpcError),
}

impl From<SysError> for AppError {
    fn from(err: SysError) -> Self {
        Self::Kernel(err.into())
    }
}

/// Server object: counts served requests and stops after a quota.
#[derive(Debug, Default)]
pub struct IpcTestServer {
    served: u32,
    quota: Option<u32>,
}

impl IpcTestServer {
    /// Server that exits after `quota` requests; `None` serves forever.
    pub fn new(quota: Option<u32>) -> Self {
        Self { served: 0, quota }
    }

    /// Requests answered so far.
    pub fn served(&self) -> u32 {
        self.served
    }

    fn handle(&mut self, msg: &mut TestMessage) {
        // Handlers are only registered for known actions.
        let Some(action) = TestAction::from_raw(msg.header.action) else {
            return;
        };
        debug!("ipctest: action {:?} from pid {} data={:#010x}", action, msg.header.from, msg.data);
        msg.data = action.reply_data();
        self.served += 1;
    }
}

impl ServerInstance for IpcTestServer {
    fn should_exit(&self) -> bool {
        self.quota.is_some_and(|quota| self.served >= quota)
    }
}

/// Server with the action A and B handlers installed; both reply.
pub fn build_server<S>(sys: S, quota: Option<u32>) -> ChannelServer<S, TestMessage, IpcTestServer>
where
    S: ProcessCtl + VmShare,
{
    let mut server = ChannelServer::new(sys, IpcTestServer::new(quota));
    for action in [TestAction::A, TestAction::B] {
        server.add_ipc_handler(action as u32, IpcTestServer::handle, true);
    }
    server
}

/// Scans PIDs `1..=max_pid` for the process running [`SERVER_COMMAND`].
pub fn find_server<S: ProcessCtl>(sys: &S, max_pid: u32) -> Result<Pid, AppError> {
    (1..=max_pid)
        .map(Pid::from_raw)
        .find(|&pid| sys.info(pid).is_ok_and(|info| info.command.starts_with(SERVER_COMMAND)))
        .ok_or(AppError::ServerNotFound)
}

/// Connects to the server and completes `rounds` request/reply exchanges.
pub fn run_client<S>(sys: S, max_pid: u32, rounds: u32) -> Result<(), AppError>
where
    S: ProcessCtl + VmShare,
{
    let pid = find_server(&sys, max_pid)?;
    info!("ipctest: found ipctest server at PID {}", pid);

    let mut client = ChannelClient::new(sys);
    client.connect(pid, TestMessage::SIZE).map_err(AppError::Connect)?;

    for round in 0..rounds {
        let action = TestAction::for_round(round);
        let mut msg = TestMessage::request(action, REQUEST_DATA);
        info!("ipctest: sending {:?} with data = {:#010x}", action, msg.data);
        client.sync_send_to(&msg, pid).map_err(|source| AppError::Send { pid, source })?;
        client
            .sync_receive_from(&mut msg, pid)
            .map_err(|source| AppError::Receive { pid, source })?;
        info!("ipctest: reply received with data = {:#010x}", msg.data);
        if msg.data != action.reply_data() {
            return Err(AppError::UnexpectedReply { expected: action.reply_data(), actual: msg.data });
        }
    }
    Ok(())
}

/// Spawns the server process and runs its loop on a new thread until `quota` requests are
/// served. The thread yields the number of requests answered.
pub fn spawn_server(
    kernel: &Arc<HostKernel>,
    quota: u32,
) -> Result<(Pid, JoinHandle<Result<u32, IpcError>>), AppError> {
    let sys = kernel.spawn(Pid::KERNEL, SERVER_COMMAND)?;
    let pid = sys.pid();
    let handle = thread::spawn(move || {
        let mut server = build_server(sys, Some(quota));
        server.run()?;
        Ok(server.instance().served())
    });
    Ok((pid, handle))
}

/// Boots a kernel from `config`, runs server and client, and tears both down.
pub fn run(config: KernelConfig, rounds: u32) -> Result<(), AppError> {
    let max_pid = u32::try_from(config.max_processes).unwrap_or(u32::MAX);
    let kernel = HostKernel::from_config(config);
    let client: HostProcess = kernel.spawn(Pid::KERNEL, CLIENT_COMMAND)?;
    let (server_pid, server) = spawn_server(&kernel, rounds)?;

    let outcome = run_client(client.clone(), max_pid, rounds);
    if outcome.is_err() {
        // Releases the server from its sleep so the thread can be joined.
        if let Err(err) = kernel.kill(server_pid, 1) {
            debug!("ipctest: server pid {} already gone: {}", server_pid, err);
        }
    }
    let served = server.join().map_err(|_| AppError::Kernel(IpcError::IoError))?;
    outcome?;

    let served = served.map_err(|err| {
        error!("ipctest: server loop failed: {}", err);
        AppError::Kernel(err)
    })?;
    info!("ipctest: server answered {} request(s)", served);
    client.exit(0)?;
    Ok(())
}
