// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Many client processes against one server process
//!
//! TEST_SCENARIOS:
//!   - concurrent synchronous clients keep per-channel order
//!   - pipelined requests are served in send order
//!   - one-way notes are handled without replies
//!   - a terminated client does not disturb the others
//!   - asynchronous requests complete through callbacks

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use nexus_abi::{Message, MessageKind, Pid, ProcessCtl};
use nexus_ipc::ChannelClient;
use nexus_ipc_e2e::{
    boot, spawn_echo_server, EchoMessage, ACTION_ECHO, ACTION_INCREMENT, ACTION_NOTE,
};

#[test]
fn concurrent_clients_keep_per_channel_order() {
    const CLIENTS: u32 = 4;
    const REQUESTS: u32 = 50;
    let kernel = boot();
    let (server_pid, server) = spawn_echo_server(&kernel, "/server/echo", CLIENTS * REQUESTS);

    let clients: Vec<_> = (0..CLIENTS)
        .map(|c| {
            let sys = kernel.spawn(Pid::KERNEL, &format!("/bin/client{c}")).unwrap();
            let pid = sys.pid();
            let handle = thread::spawn(move || {
                let mut client = ChannelClient::new(sys);
                for seq in 0..REQUESTS {
                    let value = (u64::from(c) << 32) | u64::from(seq);
                    let mut msg = EchoMessage::new(ACTION_INCREMENT, seq, value);
                    client.sync_send_receive(&mut msg, server_pid).unwrap();
                    assert_eq!(msg.header.kind, MessageKind::Response);
                    assert_eq!(msg.header.from, server_pid);
                    assert_eq!((msg.seq, msg.value), (seq, value + 1));
                }
            });
            (pid, handle)
        })
        .collect();

    let pids: Vec<Pid> = clients.iter().map(|(pid, _)| *pid).collect();
    for (_, handle) in clients {
        handle.join().unwrap();
    }
    let server = server.join().unwrap().unwrap();
    let counter = server.instance();
    assert_eq!(counter.served, CLIENTS * REQUESTS);

    let mut per_client: BTreeMap<Pid, Vec<u32>> = BTreeMap::new();
    for &(pid, seq) in &counter.log {
        per_client.entry(pid).or_default().push(seq);
    }
    assert_eq!(per_client.keys().copied().collect::<Vec<_>>(), pids);
    for seqs in per_client.values() {
        assert_eq!(*seqs, (0..REQUESTS).collect::<Vec<_>>());
    }
}

#[test]
fn pipelined_requests_are_served_in_send_order() {
    const DEPTH: u32 = 64;
    let kernel = boot();
    let (server_pid, server) = spawn_echo_server(&kernel, "/server/echo", DEPTH);
    let mut client = ChannelClient::new(kernel.spawn(Pid::KERNEL, "/bin/pipeline").unwrap());

    for seq in 0..DEPTH {
        assert!(client.try_send_to(&EchoMessage::new(ACTION_ECHO, seq, 7), server_pid).unwrap());
    }
    let mut msg = EchoMessage::new(0, 0, 0);
    for seq in 0..DEPTH {
        client.sync_receive_from(&mut msg, server_pid).unwrap();
        assert_eq!((msg.seq, msg.value), (seq, 7));
    }
    server.join().unwrap().unwrap();
}

#[test]
fn notes_are_handled_without_replies() {
    let kernel = boot();
    let (server_pid, server) = spawn_echo_server(&kernel, "/server/echo", 4);
    let mut client = ChannelClient::new(kernel.spawn(Pid::KERNEL, "/bin/notes").unwrap());

    for seq in 0..3 {
        client.sync_send_to(&EchoMessage::new(ACTION_NOTE, seq, 0), server_pid).unwrap();
    }
    let mut msg = EchoMessage::new(ACTION_ECHO, 3, 42);
    client.sync_send_receive(&mut msg, server_pid).unwrap();
    assert_eq!(msg.seq, 3, "the first reply answers the echo, not a note");

    let server = server.join().unwrap().unwrap();
    assert_eq!(server.instance().notes, 3);
    assert!(!client.try_receive_from(&mut msg, server_pid).unwrap());
}

#[test]
fn terminated_client_does_not_disturb_others() {
    let kernel = boot();
    let (server_pid, server) = spawn_echo_server(&kernel, "/server/echo", 2);

    let short_lived = kernel.spawn(Pid::KERNEL, "/bin/short").unwrap();
    let short_pid = short_lived.pid();
    let mut client = ChannelClient::new(short_lived.clone());
    let mut msg = EchoMessage::new(ACTION_ECHO, 0, 1);
    client.sync_send_receive(&mut msg, server_pid).unwrap();
    drop(client);
    short_lived.exit(0).unwrap();
    assert_eq!(kernel.used_pages(), 0, "kill releases the share");

    let mut survivor = ChannelClient::new(kernel.spawn(Pid::KERNEL, "/bin/long").unwrap());
    let mut msg = EchoMessage::new(ACTION_INCREMENT, 1, 1);
    survivor.sync_send_receive(&mut msg, server_pid).unwrap();
    assert_eq!(msg.value, 2);

    let server = server.join().unwrap().unwrap();
    let senders: Vec<Pid> = server.instance().log.iter().map(|(pid, _)| *pid).collect();
    assert_eq!(senders, [short_pid, survivor.pid()]);
}

#[test]
fn asynchronous_requests_complete_through_callbacks() {
    const REQUESTS: u32 = 8;
    let kernel = boot();
    let (server_pid, server) = spawn_echo_server(&kernel, "/server/echo", REQUESTS);
    let mut client = ChannelClient::new(kernel.spawn(Pid::KERNEL, "/bin/async").unwrap());

    let total = Arc::new(AtomicU64::new(0));
    for seq in 0..REQUESTS {
        let sink = Arc::clone(&total);
        let mut msg = EchoMessage::new(ACTION_INCREMENT, seq, u64::from(seq));
        client
            .send_request(server_pid, &mut msg, move |reply: EchoMessage| {
                sink.fetch_add(reply.value, Ordering::SeqCst);
            })
            .unwrap();
    }
    assert_eq!(client.pending_requests(), REQUESTS as usize);

    let mut raw = vec![0u8; EchoMessage::SIZE];
    while client.pending_requests() > 0 {
        if client.read_bytes(server_pid, &mut raw).unwrap() {
            client.process_response(server_pid, &raw).unwrap();
        } else {
            client.sys().enter_sleep(None).unwrap();
        }
    }
    // sum of (seq + 1) for seq in 0..8
    assert_eq!(total.load(Ordering::SeqCst), 36);
    server.join().unwrap().unwrap();
}
