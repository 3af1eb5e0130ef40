// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Randomised workloads and kernel limits seen through the session layer

use std::thread;

use neuron::{HostKernel, KernelConfig};
use nexus_abi::{Message, Pid, ProcessCtl, ProcessState};
use nexus_ipc::{ChannelClient, IpcError};
use nexus_ipc_e2e::{boot, spawn_echo_server, EchoMessage, ACTION_ECHO, ACTION_INCREMENT};
use proptest::prelude::*;

fn expected(action: u32, value: u64) -> u64 {
    if action == ACTION_INCREMENT {
        value.wrapping_add(1)
    } else {
        value
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn every_request_gets_its_own_answer(
        workloads in prop::collection::vec(
            prop::collection::vec((prop_oneof![Just(ACTION_ECHO), Just(ACTION_INCREMENT)], any::<u64>()), 1..24),
            1..4,
        )
    ) {
        let kernel = boot();
        let total: usize = workloads.iter().map(Vec::len).sum();
        let quota = u32::try_from(total).unwrap();
        let (server_pid, server) = spawn_echo_server(&kernel, "/server/echo", quota);

        let handles: Vec<_> = workloads
            .into_iter()
            .enumerate()
            .map(|(i, work)| {
                let sys = kernel.spawn(Pid::KERNEL, &format!("/bin/w{i}")).unwrap();
                thread::spawn(move || {
                    let mut client = ChannelClient::new(sys);
                    work.into_iter()
                        .enumerate()
                        .map(|(seq, (action, value))| {
                            let seq = u32::try_from(seq).unwrap();
                            let mut msg = EchoMessage::new(action, seq, value);
                            client.sync_send_receive(&mut msg, server_pid).unwrap();
                            (msg.seq == seq, msg.value == expected(action, value))
                        })
                        .all(|(seq_ok, value_ok)| seq_ok && value_ok)
                })
            })
            .collect();

        for handle in handles {
            prop_assert!(handle.join().unwrap());
        }
        let server = server.join().unwrap().unwrap();
        prop_assert_eq!(server.instance().served, quota);
    }
}

#[test]
fn share_limit_rejects_extra_clients() {
    let config = KernelConfig::from_toml_str("max_shares = 1\n").unwrap();
    let kernel = HostKernel::from_config(config);
    let (server_pid, server) = spawn_echo_server(&kernel, "/server/echo", 1);

    let mut first = ChannelClient::new(kernel.spawn(Pid::KERNEL, "/bin/first").unwrap());
    let mut second = ChannelClient::new(kernel.spawn(Pid::KERNEL, "/bin/second").unwrap());
    first.connect(server_pid, EchoMessage::SIZE).unwrap();
    assert_eq!(second.connect(server_pid, EchoMessage::SIZE), Err(IpcError::IoError));
    assert_eq!(
        second.sync_send_to(&EchoMessage::new(ACTION_ECHO, 0, 0), server_pid),
        Err(IpcError::IoError),
        "the server exists, so the refused share is not reported as a missing peer"
    );

    let mut msg = EchoMessage::new(ACTION_ECHO, 0, 9);
    first.sync_send_receive(&mut msg, server_pid).unwrap();
    assert_eq!(msg.value, 9);
    server.join().unwrap().unwrap();
}

#[test]
fn server_exit_wakes_blocked_client() {
    let kernel = boot();
    let server_sys = kernel.spawn(Pid::KERNEL, "/server/silent").unwrap();
    let server_pid = server_sys.pid();
    let client_sys = kernel.spawn(Pid::KERNEL, "/bin/waiter").unwrap();
    let client_pid = client_sys.pid();

    let waiter = thread::spawn(move || {
        let mut client = ChannelClient::new(client_sys);
        let mut msg = EchoMessage::new(ACTION_ECHO, 0, 0);
        client.sync_send_receive(&mut msg, server_pid)
    });
    while !kernel
        .snapshot()
        .iter()
        .any(|p| p.pid == client_pid && p.state == ProcessState::Sleeping)
    {
        thread::yield_now();
    }
    server_sys.exit(3).unwrap();
    assert_eq!(waiter.join().unwrap(), Err(IpcError::NotFound));
}
