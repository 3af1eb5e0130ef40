// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Session layer tests on the host kernel (threads as processes)
//!
//! TEST_SCOPE:
//!   - connect handshake (sizes, soft attach to an existing share)
//!   - blocking send/receive across threads, including a full ring
//!   - server dispatch, replies, unknown actions, interrupts and timeouts
//!   - asynchronous requests and peer termination
//!   - reconnect after disconnect, replies to a client that never reads
//!   - kernel event draining and auto-connect error kinds

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use neuron::{HostKernel, HostProcess, KernelConfig};
use nexus_abi::{
    le_u32, put_le_u32, ChannelMessage, Message, MessageKind, Pid, ProcessCtl, ProcessState,
    SysError, HEADER_SIZE, MAX_MESSAGE_SIZE,
};
use nexus_ipc::budget::{retry_budgeted, SysClock};
use nexus_ipc::{ChannelClient, ChannelServer, IpcError, ServerInstance};

const ACTION_A: u32 = 0;
const ACTION_B: u32 = 1;
const ACTION_UNKNOWN: u32 = 99;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TestMessage {
    header: ChannelMessage,
    data: u32,
}

impl TestMessage {
    fn new(action: u32, data: u32) -> Self {
        Self { header: ChannelMessage::request(action), data }
    }
}

impl Message for TestMessage {
    const SIZE: usize = HEADER_SIZE + 8;

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

/// Largest message the rings carry; two fit in a data page.
#[derive(Clone, Debug)]
struct BulkMessage {
    header: ChannelMessage,
    seq: u32,
}

impl Message for BulkMessage {
    const SIZE: usize = MAX_MESSAGE_SIZE;

    fn header(&self) -> &ChannelMessage {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ChannelMessage {
        &mut self.header
    }

    fn encode(&self, out: &mut [u8]) {
        out[..HEADER_SIZE].copy_from_slice(&self.header.to_le_bytes());
        put_le_u32(out, HEADER_SIZE, self.seq);
        put_le_u32(out, Self::SIZE - 4, !self.seq);
    }

    fn decode(bytes: &[u8]) -> nexus_abi::Result<Self> {
        let seq = le_u32(bytes, HEADER_SIZE);
        if bytes.len() != Self::SIZE || le_u32(bytes, Self::SIZE - 4) != !seq {
            return Err(SysError::InvalidArgument);
        }
        Ok(Self { header: ChannelMessage::decode(bytes)?, seq })
    }
}

#[derive(Debug, Default)]
struct TestServer {
    served: u32,
    exit_after: u32,
    irqs: u32,
    timeouts: u32,
}

impl ServerInstance for TestServer {
    fn timeout(&mut self) {
        self.timeouts += 1;
    }

    fn should_exit(&self) -> bool {
        self.exit_after > 0 && (self.served >= self.exit_after || self.timeouts >= self.exit_after)
    }
}

fn test_server(sys: HostProcess, exit_after: u32) -> ChannelServer<HostProcess, TestMessage, TestServer> {
    let mut server = ChannelServer::new(sys, TestServer { exit_after, ..TestServer::default() });
    server.add_ipc_handler(
        ACTION_A,
        |inst: &mut TestServer, msg: &mut TestMessage| {
            inst.served += 1;
            msg.data = 0xaaaa_aaaa;
        },
        true,
    );
    server.add_ipc_handler(
        ACTION_B,
        |inst: &mut TestServer, msg: &mut TestMessage| {
            inst.served += 1;
            msg.data = 0xbbbb_bbbb;
        },
        true,
    );
    server
}

fn kernel() -> Arc<HostKernel> {
    HostKernel::from_config(KernelConfig::default())
}

fn wait_for_state(kernel: &HostKernel, pid: Pid, state: ProcessState) {
    while !kernel.snapshot().iter().any(|p| p.pid == pid && p.state == state) {
        thread::yield_now();
    }
}

#[test]
fn ipctest_action_b_round_trip() {
    let kernel = kernel();
    let server_proc = kernel.spawn(Pid::KERNEL, "/server/ipctest/server").unwrap();
    let server_pid = server_proc.pid();
    let handle = thread::spawn(move || {
        let mut server = test_server(server_proc, 1);
        server.run().map(|()| server.instance().served)
    });

    let mut client = ChannelClient::new(kernel.spawn(Pid::KERNEL, "/bin/ipctest").unwrap());
    client.connect(server_pid, TestMessage::SIZE).unwrap();
    let mut msg = TestMessage::new(ACTION_B, 0x1234_5678);
    client.sync_send_to(&msg, server_pid).unwrap();
    client.sync_receive_from(&mut msg, server_pid).unwrap();

    assert_eq!(msg.data, 0xbbbb_bbbb);
    assert_eq!(msg.header.from, server_pid);
    assert_eq!(msg.header.kind, MessageKind::Response);
    assert_eq!(handle.join().unwrap(), Ok(1));
}

#[test]
fn send_receive_serves_many_clients() {
    let kernel = kernel();
    let server_proc = kernel.spawn(Pid::KERNEL, "server").unwrap();
    let server_pid = server_proc.pid();
    let handle = thread::spawn(move || test_server(server_proc, 6).run());

    let clients: Vec<_> = (0..3)
        .map(|i| {
            let sys = kernel.spawn(Pid::KERNEL, &format!("client{i}")).unwrap();
            thread::spawn(move || {
                let mut client = ChannelClient::new(sys);
                let mut results = Vec::new();
                for action in [ACTION_A, ACTION_B] {
                    let mut msg = TestMessage::new(action, i);
                    client.sync_send_receive(&mut msg, server_pid).unwrap();
                    results.push(msg.data);
                }
                results
            })
        })
        .collect();

    for client in clients {
        assert_eq!(client.join().unwrap(), [0xaaaa_aaaa, 0xbbbb_bbbb]);
    }
    assert_eq!(handle.join().unwrap(), Ok(()));
}

#[test]
fn connect_validates_message_size() {
    let kernel = kernel();
    let a = kernel.spawn(Pid::KERNEL, "a").unwrap();
    let b = kernel.spawn(Pid::KERNEL, "b").unwrap();
    let (a_pid, b_pid) = (a.pid(), b.pid());
    let mut a = ChannelClient::new(a);
    let mut b = ChannelClient::new(b);

    assert_eq!(a.connect(b_pid, 4), Err(IpcError::InvalidArgument));
    assert_eq!(a.connect(b_pid, MAX_MESSAGE_SIZE + 1), Err(IpcError::InvalidArgument));

    a.connect(b_pid, 24).unwrap();
    a.connect(b_pid, 24).unwrap();
    assert_eq!(a.connect(b_pid, 32), Err(IpcError::IoError));
    assert_eq!(b.connect(a_pid, 32), Err(IpcError::IoError), "share carries 24 bytes");
    b.connect(a_pid, 24).unwrap();
    assert_eq!(a.connect(Pid::from_raw(500), 24), Err(IpcError::IoError));
}

#[test]
fn late_peer_recovers_queued_messages() {
    let kernel = kernel();
    let a = kernel.spawn(Pid::KERNEL, "a").unwrap();
    let b = kernel.spawn(Pid::KERNEL, "b").unwrap();
    let (a_pid, b_pid) = (a.pid(), b.pid());
    let mut a = ChannelClient::new(a);
    let mut b = ChannelClient::new(b);

    for data in 1..=3 {
        a.sync_send_to(&TestMessage::new(ACTION_A, data), b_pid).unwrap();
    }
    let mut msg = TestMessage::new(0, 0);
    let mut seen = Vec::new();
    while b.try_receive_from(&mut msg, a_pid).unwrap() {
        assert_eq!(msg.header.from, a_pid);
        seen.push(msg.data);
    }
    assert_eq!(seen, [1, 2, 3]);

    b.sync_send_to(&TestMessage::new(ACTION_B, 9), a_pid).unwrap();
    a.sync_receive_from(&mut msg, b_pid).unwrap();
    assert_eq!(msg.data, 9);
}

#[test]
fn full_ring_blocks_sender_until_drained() {
    let kernel = kernel();
    let tx = kernel.spawn(Pid::KERNEL, "tx").unwrap();
    let rx = kernel.spawn(Pid::KERNEL, "rx").unwrap();
    let (tx_pid, rx_pid) = (tx.pid(), rx.pid());
    let mut receiver = ChannelClient::new(rx);
    receiver.connect(tx_pid, BulkMessage::SIZE).unwrap();

    let sender = thread::spawn(move || {
        let mut client = ChannelClient::new(tx);
        for seq in 0..16 {
            let msg = BulkMessage { header: ChannelMessage::request(ACTION_A), seq };
            client.sync_send_to(&msg, rx_pid).unwrap();
        }
    });

    let mut msg = BulkMessage { header: ChannelMessage::request(0), seq: u32::MAX };
    for seq in 0..16 {
        receiver.sync_receive_from(&mut msg, tx_pid).unwrap();
        assert_eq!(msg.seq, seq);
    }
    sender.join().unwrap();
}

#[test]
fn receiver_of_killed_peer_gets_not_found() {
    let kernel = kernel();
    let a = kernel.spawn(Pid::KERNEL, "a").unwrap();
    let b = kernel.spawn(Pid::KERNEL, "b").unwrap();
    let (a_pid, b_pid) = (a.pid(), b.pid());
    let mut client = ChannelClient::new(a);
    client.connect(b_pid, TestMessage::SIZE).unwrap();

    let handle = thread::spawn(move || {
        let mut msg = TestMessage::new(0, 0);
        client.sync_receive_from(&mut msg, b_pid)
    });
    wait_for_state(&kernel, a_pid, ProcessState::Sleeping);
    b.exit(-1).unwrap();
    assert_eq!(handle.join().unwrap(), Err(IpcError::NotFound));
    assert_eq!(kernel.used_pages(), 0);
}

#[test]
fn send_to_missing_process_is_not_found() {
    let kernel = kernel();
    let mut client = ChannelClient::new(kernel.spawn(Pid::KERNEL, "a").unwrap());
    let msg = TestMessage::new(ACTION_A, 1);
    assert_eq!(client.sync_send_to(&msg, Pid::from_raw(40)), Err(IpcError::NotFound));
}

#[test]
fn unknown_action_is_dropped_without_reply() {
    let kernel = kernel();
    let server_proc = kernel.spawn(Pid::KERNEL, "server").unwrap();
    let server_pid = server_proc.pid();
    let mut server = test_server(server_proc, 0);
    let mut client = ChannelClient::new(kernel.spawn(Pid::KERNEL, "client").unwrap());

    client.sync_send_to(&TestMessage::new(ACTION_UNKNOWN, 5), server_pid).unwrap();
    assert_eq!(server.run_once(), Ok(2), "share event plus one message");
    assert_eq!(server.instance().served, 0);

    let mut msg = TestMessage::new(0, 0);
    assert!(!client.try_receive_from(&mut msg, server_pid).unwrap());
}

#[test]
fn asynchronous_request_runs_callback() {
    let kernel = kernel();
    let server_proc = kernel.spawn(Pid::KERNEL, "server").unwrap();
    let server_pid = server_proc.pid();
    let mut server = test_server(server_proc, 0);
    let mut client = ChannelClient::new(kernel.spawn(Pid::KERNEL, "client").unwrap());

    let seen = Arc::new(AtomicU32::new(0));
    let sink = Arc::clone(&seen);
    let mut msg = TestMessage::new(ACTION_A, 0);
    let id = client
        .send_request(server_pid, &mut msg, move |reply: TestMessage| {
            assert_eq!(reply.header.from, server_pid);
            sink.store(reply.data, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(msg.header.identifier, id);
    assert_eq!(client.pending_requests(), 1);

    server.run_once().unwrap();

    let mut raw = vec![0u8; TestMessage::SIZE];
    assert!(client.read_bytes(server_pid, &mut raw).unwrap());
    client.process_response(server_pid, &raw).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 0xaaaa_aaaa);
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.process_response(server_pid, &raw), Err(IpcError::NotFound));
}

#[test]
fn interrupts_reach_irq_handlers() {
    let kernel = kernel();
    let server_proc = kernel.spawn(Pid::KERNEL, "driver").unwrap();
    let mut server = test_server(server_proc, 0);
    server.add_irq_handler(33, |inst: &mut TestServer, vector| {
        assert_eq!(vector, 33);
        inst.irqs += 1;
    })
    .unwrap();

    assert_eq!(kernel.raise_irq(33), 1);
    assert_eq!(kernel.raise_irq(34), 0);
    assert_eq!(server.run_once(), Ok(1));
    assert_eq!(server.instance().irqs, 1);
}

#[test]
fn idle_server_fires_timeouts() {
    let kernel = kernel();
    let mut server = test_server(kernel.spawn(Pid::KERNEL, "server").unwrap(), 2);
    server.set_timeout(10).unwrap();
    server.run().unwrap();
    assert_eq!(server.instance().timeouts, 2);
}

#[test]
fn budgeted_receive_times_out() {
    let kernel = kernel();
    let a = kernel.spawn(Pid::KERNEL, "a").unwrap();
    let b = kernel.spawn(Pid::KERNEL, "b").unwrap();
    let clock = a.clone();
    let mut client = ChannelClient::new(a);
    let mut msg = TestMessage::new(0, 0);

    let err = retry_budgeted(&SysClock(&clock), 20, || {
        client.try_receive_from(&mut msg, b.pid()).map(|got| got.then_some(()))
    })
    .unwrap_err();
    assert_eq!(err, IpcError::Timeout);
}

#[test]
fn disconnect_releases_share() {
    let kernel = kernel();
    let a = kernel.spawn(Pid::KERNEL, "a").unwrap();
    let b = kernel.spawn(Pid::KERNEL, "b").unwrap();
    let mut client = ChannelClient::new(a);
    client.connect(b.pid(), TestMessage::SIZE).unwrap();
    assert!(kernel.used_pages() > 0);

    client.disconnect(b.pid()).unwrap();
    assert_eq!(kernel.used_pages(), 0);
    assert_eq!(client.disconnect(b.pid()), Err(IpcError::NotFound));
}

#[test]
fn reconnect_after_disconnect_reaches_server() {
    let kernel = kernel();
    let server_proc = kernel.spawn(Pid::KERNEL, "server").unwrap();
    let server_pid = server_proc.pid();
    let mut server = test_server(server_proc, 0);
    let mut client = ChannelClient::new(kernel.spawn(Pid::KERNEL, "client").unwrap());
    let mut msg = TestMessage::new(ACTION_A, 0);

    client.connect(server_pid, TestMessage::SIZE).unwrap();
    client.sync_send_to(&msg, server_pid).unwrap();
    assert_eq!(server.run_once(), Ok(2));
    assert!(client.try_receive_from(&mut msg, server_pid).unwrap());
    assert_eq!(msg.data, 0xaaaa_aaaa);

    client.disconnect(server_pid).unwrap();
    assert_eq!(kernel.used_pages(), 0);

    client.sync_send_to(&TestMessage::new(ACTION_B, 0), server_pid).unwrap();
    assert_eq!(server.run_once(), Ok(3), "deleted and created events plus one message");
    assert!(client.try_receive_from(&mut msg, server_pid).unwrap());
    assert_eq!(msg.data, 0xbbbb_bbbb);
    assert_eq!(server.instance().served, 2);
}

#[test]
fn full_reply_ring_does_not_stall_other_clients() {
    // (4096 - 8) / 24 slots per ring
    const CAPACITY: u32 = 170;
    let kernel = kernel();
    let server_proc = kernel.spawn(Pid::KERNEL, "server").unwrap();
    let server_pid = server_proc.pid();
    let mut server = test_server(server_proc, 0);
    let mut lazy = ChannelClient::new(kernel.spawn(Pid::KERNEL, "lazy").unwrap());
    let mut other = ChannelClient::new(kernel.spawn(Pid::KERNEL, "other").unwrap());

    for data in 0..CAPACITY {
        assert!(lazy.try_send_to(&TestMessage::new(ACTION_A, data), server_pid).unwrap());
    }
    server.run_once().unwrap();
    assert_eq!(server.instance().served, CAPACITY);

    assert!(lazy.try_send_to(&TestMessage::new(ACTION_A, CAPACITY), server_pid).unwrap());
    other.sync_send_to(&TestMessage::new(ACTION_B, 1), server_pid).unwrap();
    server.run_once().unwrap();
    assert_eq!(server.instance().served, CAPACITY + 2);

    let mut msg = TestMessage::new(0, 0);
    assert!(other.try_receive_from(&mut msg, server_pid).unwrap());
    assert_eq!(msg.data, 0xbbbb_bbbb);

    let mut replies = 0;
    while lazy.try_receive_from(&mut msg, server_pid).unwrap() {
        replies += 1;
    }
    assert_eq!(replies, CAPACITY, "the reply that found the ring full was dropped");
}

#[test]
fn plain_client_drains_kernel_events() {
    let kernel = kernel();
    let a = kernel.spawn(Pid::KERNEL, "a").unwrap();
    let b = kernel.spawn(Pid::KERNEL, "b").unwrap();
    let (a_pid, b_pid) = (a.pid(), b.pid());
    let mut a = ChannelClient::new(a);
    let mut b = ChannelClient::new(b);
    let mut msg = TestMessage::new(0, 0);

    a.sync_send_to(&TestMessage::new(ACTION_A, 7), b_pid).unwrap();
    b.sync_receive_from(&mut msg, a_pid).unwrap();
    assert_eq!(msg.data, 7);
    assert!(b.sys().next_event().is_none(), "share announcement was consumed");

    a.disconnect(b_pid).unwrap();
    assert_eq!(b.drain_events(), 1);
    assert!(!b.registry().is_connected(a_pid), "channels on released frames are dropped");
    assert!(b.sys().next_event().is_none());
}

#[test]
fn auto_connect_keeps_handshake_error() {
    let kernel = kernel();
    let a = kernel.spawn(Pid::KERNEL, "a").unwrap();
    let b = kernel.spawn(Pid::KERNEL, "b").unwrap();
    let (a_pid, b_pid) = (a.pid(), b.pid());
    let mut a = ChannelClient::new(a);
    let mut b = ChannelClient::new(b);
    a.connect(b_pid, TestMessage::SIZE).unwrap();

    let bulk = BulkMessage { header: ChannelMessage::request(ACTION_A), seq: 0 };
    assert_eq!(b.sync_send_to(&bulk, a_pid), Err(IpcError::IoError), "share carries 24 bytes");
    assert_eq!(b.sync_send_to(&bulk, Pid::from_raw(77)), Err(IpcError::NotFound));
}
