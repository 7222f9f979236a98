mod common;

use std::net::IpAddr;

use common::{data_packet, node, pattern, pump, segment, test_config};
use srpt_rpc::socket::RecvFlags;
use srpt_rpc::wire::PacketBody;

/// A 1 MB transfer with a 60 kB window and 10 kB grants produces exactly
/// (1000000 - 60000) / 10000 = 94 grants, with strictly increasing
/// offsets 70000, 80000, ..., 1000000.
#[test]
fn test_large_message_grant_sequence() {
    let client = node(test_config(), "10.0.0.1");
    let server = node(test_config(), "10.0.0.2");
    let server_socket = server.transport.open_socket().unwrap();
    server_socket.bind(77).unwrap();
    let client_socket = client.transport.open_socket().unwrap();

    let request = pattern(0, 1_000_000);
    client_socket
        .send_request("10.0.0.2:77".parse().unwrap(), request.clone())
        .unwrap();
    let log = pump(&client, &server);

    let grant_offsets: Vec<u32> = log
        .iter()
        .filter_map(|(from_client, _, body)| match body {
            PacketBody::Grant { offset, .. } if !from_client => Some(*offset),
            _ => None,
        })
        .collect();
    let expected: Vec<u32> = (1..=94).map(|i| 60_000 + i * 10_000).collect();
    assert_eq!(grant_offsets, expected);

    let message = server_socket.recv(RecvFlags::REQUEST, None).unwrap();
    assert_eq!(message.data, request);
}

/// Grant offsets for one RPC form a strictly increasing sequence even
/// when data arrives out of order.
#[test]
fn test_grant_monotonicity() {
    let server = node(test_config(), "10.0.0.2");
    let socket = server.transport.open_socket().unwrap();
    socket.bind(77).unwrap();
    let peer: IpAddr = "10.0.0.9".parse().unwrap();

    // First packet opens the message; later ones arrive shuffled.
    server
        .transport
        .deliver(peer, &data_packet(0x9000, 77, 42, 300_000, 60_000, vec![segment(0, 10_000)]));
    for offset in [30_000u32, 10_000, 50_000, 20_000, 40_000] {
        server.transport.deliver(
            peer,
            &data_packet(0x9000, 77, 42, 300_000, 60_000, vec![segment(offset, 10_000)]),
        );
    }
    let grants: Vec<u32> = server
        .drain()
        .into_iter()
        .filter_map(|(_, _, body)| match body {
            PacketBody::Grant { offset, .. } => Some(offset),
            _ => None,
        })
        .collect();
    assert!(!grants.is_empty());
    assert!(
        grants.windows(2).all(|pair| pair[1] > pair[0]),
        "offsets must strictly increase: {grants:?}"
    );
}

/// With eight equal senders and max_overcommit = 4, exactly four are
/// granted; the rest see nothing until one of the four finishes.
#[test]
fn test_overcommit_window() {
    let mut config = test_config();
    config.max_overcommit = 4;
    let server = node(config, "10.0.0.2");
    let socket = server.transport.open_socket().unwrap();
    socket.bind(77).unwrap();

    let peers: Vec<IpAddr> = (0..8).map(|i| format!("10.0.1.{i}").parse().unwrap()).collect();
    for (i, peer) in peers.iter().enumerate() {
        server.transport.deliver(
            *peer,
            &data_packet(
                0x9000,
                77,
                100 + i as u64,
                500_000,
                60_000,
                vec![segment(0, 10_000)],
            ),
        );
    }
    let granted_now: Vec<IpAddr> = server
        .drain()
        .into_iter()
        .filter_map(|(dst, _, body)| matches!(body, PacketBody::Grant { .. }).then_some(dst))
        .collect();
    let granted_set: std::collections::HashSet<IpAddr> = granted_now.iter().copied().collect();
    assert_eq!(granted_set.len(), 4, "exactly four senders granted");
    for peer in &peers[..4] {
        assert!(granted_set.contains(peer), "{peer} arrived first, must be granted");
    }
    for peer in &peers[4..] {
        assert!(!granted_set.contains(peer), "{peer} must wait its turn");
    }

    // Drive the first sender to completion; no grants may leak to the
    // waiting four until it finishes, and its completion must admit the
    // fifth sender.
    let mut admitted = Vec::new();
    let mut offset = 10_000u32;
    while offset < 500_000 {
        server.transport.deliver(
            peers[0],
            &data_packet(0x9000, 77, 100, 500_000, 60_000, vec![segment(offset, 10_000)]),
        );
        offset += 10_000;
        let finished = offset >= 500_000;
        for (dst, _, body) in server.drain() {
            if matches!(body, PacketBody::Grant { .. }) {
                if finished {
                    admitted.push(dst);
                } else {
                    assert!(
                        peers[..4].contains(&dst),
                        "grant to {dst} while the window is full"
                    );
                }
            }
        }
    }
    assert!(
        admitted.contains(&peers[4]),
        "the fifth sender must be admitted after a completion: {admitted:?}"
    );
}

/// Scheduled priorities descend with SRPT position: the shortest
/// remaining message gets max_sched_prio, the next one less, and the
/// level floors at zero.
#[test]
fn test_priority_tracks_srpt_position() {
    let config = test_config();
    let max_sched = config.max_sched_prio;
    let server = node(config, "10.0.0.2");
    let socket = server.transport.open_socket().unwrap();
    socket.bind(77).unwrap();

    // Three messages with distinct sizes; smallest remaining first.
    let sizes = [100_000u32, 200_000, 300_000];
    for (i, size) in sizes.iter().enumerate() {
        let peer: IpAddr = format!("10.0.2.{i}").parse().unwrap();
        server.transport.deliver(
            peer,
            &data_packet(0x9000, 77, 200 + i as u64, *size, 60_000, vec![segment(0, 10_000)]),
        );
    }
    // Trigger another pass with fresh progress on the smallest.
    server.transport.deliver(
        "10.0.2.0".parse().unwrap(),
        &data_packet(0x9000, 77, 200, 100_000, 60_000, vec![segment(10_000, 10_000)]),
    );
    let mut priority_by_peer = std::collections::HashMap::new();
    for (dst, _, body) in server.drain() {
        if let PacketBody::Grant { priority, .. } = body {
            priority_by_peer.insert(dst, priority);
        }
    }
    let p0 = priority_by_peer[&"10.0.2.0".parse::<IpAddr>().unwrap()];
    let p1 = priority_by_peer[&"10.0.2.1".parse::<IpAddr>().unwrap()];
    let p2 = priority_by_peer[&"10.0.2.2".parse::<IpAddr>().unwrap()];
    assert_eq!(p0, max_sched);
    assert_eq!(p1, max_sched - 1);
    assert_eq!(p2, max_sched - 2);
}
