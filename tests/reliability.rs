//! Delivery guarantees over a lossy in-memory network.

mod common;

use common::{Peer, addr, establish, step};
use tether_net::prelude::*;

fn numbered(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

fn number(payload: &[u8]) -> u32 {
    u32::from_be_bytes(payload.try_into().expect("4-byte payload"))
}

#[test]
fn test_reliable_delivery_under_loss() {
    const COUNT: u32 = 1000;

    let net = SimNetwork::new(0x7e7e);
    let clock = ManualClock::new();
    let mut server = Peer::new(&net, &clock, addr(1, 1000), TransportConfig::default());
    let mut client = Peer::new(&net, &clock, addr(2, 2000), TransportConfig::default());
    let (_, server_id) = establish(&mut client, &mut server, &clock);

    net.set_loss(0.05);
    for i in 0..COUNT {
        server
            .transport
            .send(server_id, numbered(i), Reliability::Reliable)
            .unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..20_000 {
        step(&mut [&mut server, &mut client], &clock);
        received.extend(client.payloads().into_iter().map(|e| number(&e.payload)));
        if received.len() >= COUNT as usize {
            break;
        }
    }

    assert!(net.stats().lost > 0);
    assert_eq!(received, (0..COUNT).collect::<Vec<_>>());

    let info = server.transport.connection_info(server_id).unwrap();
    assert!(info.stats.retransmits > 0);
    assert_eq!(info.phase, ConnectionPhase::Connected);
    assert!(
        !client
            .lifecycle()
            .iter()
            .any(|e| matches!(e, TransportEvent::Disconnected { .. }))
    );
}

#[test]
fn test_duplicated_packets_are_delivered_once() {
    let net = SimNetwork::new(99);
    let clock = ManualClock::new();
    let mut server = Peer::new(&net, &clock, addr(1, 1000), TransportConfig::default());
    let mut client = Peer::new(&net, &clock, addr(2, 2000), TransportConfig::default());
    let (client_id, _) = establish(&mut client, &mut server, &clock);

    net.set_duplicate(0.5);
    for i in 0..200 {
        client
            .transport
            .send(client_id, numbered(i), Reliability::Reliable)
            .unwrap();
    }
    let mut received = Vec::new();
    for _ in 0..200 {
        step(&mut [&mut client, &mut server], &clock);
        received.extend(server.payloads().into_iter().map(|e| number(&e.payload)));
    }

    assert!(net.stats().duplicated > 0);
    assert_eq!(received, (0..200).collect::<Vec<_>>());
}

#[test]
fn test_reordered_reliable_packets_arrive_in_order() {
    let net = SimNetwork::new(5);
    let clock = ManualClock::new();
    let mut server = Peer::new(&net, &clock, addr(1, 1000), TransportConfig::default());
    let mut client = Peer::new(&net, &clock, addr(2, 2000), TransportConfig::default());
    let (client_id, _) = establish(&mut client, &mut server, &clock);

    net.set_reorder(0.5);
    for i in 0..50 {
        client
            .transport
            .send(client_id, numbered(i), Reliability::Reliable)
            .unwrap();
    }
    let mut received = Vec::new();
    for _ in 0..100 {
        step(&mut [&mut client, &mut server], &clock);
        received.extend(server.payloads().into_iter().map(|e| number(&e.payload)));
    }
    assert_eq!(received, (0..50).collect::<Vec<_>>());
}

#[test]
fn test_unreliable_never_delivers_stale() {
    let net = SimNetwork::new(11);
    let clock = ManualClock::new();
    let mut server = Peer::new(&net, &clock, addr(1, 1000), TransportConfig::default());
    let mut client = Peer::new(&net, &clock, addr(2, 2000), TransportConfig::default());
    let (client_id, server_id) = establish(&mut client, &mut server, &clock);

    net.set_reorder(1.0);
    for i in 0..20 {
        client
            .transport
            .send(client_id, numbered(i), Reliability::Unreliable)
            .unwrap();
    }
    for _ in 0..3 {
        step(&mut [&mut client, &mut server], &clock);
    }

    let received: Vec<u32> = server
        .payloads()
        .into_iter()
        .map(|e| number(&e.payload))
        .collect();
    assert!(!received.is_empty());
    assert!(received.windows(2).all(|w| w[0] < w[1]), "{received:?}");

    let info = server.transport.connection_info(server_id).unwrap();
    assert_eq!(
        info.stats.delivered + info.stats.duplicates,
        20,
        "every datagram is either delivered or counted as stale"
    );
}

#[test]
fn test_send_queue_limit() {
    let net = SimNetwork::new(1);
    let clock = ManualClock::new();
    let config = TransportConfig::builder()
        .reorder_window(4)
        .send_queue_limit(2)
        .build()
        .unwrap();
    let mut server = Peer::new(&net, &clock, addr(1, 1000), TransportConfig::default());
    let mut client = Peer::new(&net, &clock, addr(2, 2000), config);
    let (client_id, _) = establish(&mut client, &mut server, &clock);

    for i in 0..6 {
        client
            .transport
            .send(client_id, numbered(i), Reliability::Reliable)
            .unwrap();
    }
    assert_eq!(
        client
            .transport
            .send(client_id, numbered(6), Reliability::Reliable),
        Err(SendError::QueueFull { limit: 2 })
    );

    let info = client.transport.connection_info(client_id).unwrap();
    assert_eq!(info.in_flight, 4);
    assert_eq!(info.queued, 2);

    let mut received = Vec::new();
    for _ in 0..10 {
        step(&mut [&mut client, &mut server], &clock);
        received.extend(server.payloads().into_iter().map(|e| number(&e.payload)));
    }
    assert_eq!(received, (0..6).collect::<Vec<_>>());
}
