//! Real sockets on the loopback interface.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use tether_net::codec::PacketFlags;
use tether_net::codec::packet::handshake_payload;
use tether_net::prelude::*;
use tether_net::transport::TransportEvents;

const DEADLINE: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn transport() -> (Transport, TransportEvents) {
    Transport::new(TransportConfig::default()).unwrap()
}

/// Poll both sides until `done` returns true or the deadline passes.
fn pump_until(
    a: &mut Transport,
    b: &mut Transport,
    mut done: impl FnMut() -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        a.poll(Duration::from_millis(5)).unwrap();
        b.poll(Duration::from_millis(5)).unwrap();
        if done() {
            return true;
        }
    }
    false
}

fn echo_roundtrip(kind: SocketKind) {
    let (mut server, mut server_events) = transport();
    let (mut client, mut client_events) = transport();
    let listener = server.listen(loopback(), kind).unwrap();
    assert_ne!(listener.local_addr().port(), 0);

    let id = client.connect(listener.local_addr(), kind).unwrap();
    let mut connected = false;
    assert!(pump_until(&mut client, &mut server, || {
        while let Ok(event) = client_events.lifecycle.try_recv() {
            if matches!(event, TransportEvent::Connected { id: up, .. } if up == id) {
                connected = true;
            }
        }
        connected
    }));

    client.send(id, &b"ping"[..], Reliability::Reliable).unwrap();
    let mut inbound = None;
    assert!(pump_until(&mut client, &mut server, || {
        if let Ok(event) = server_events.payloads.try_recv() {
            inbound = Some(event);
        }
        inbound.is_some()
    }));
    let inbound = inbound.unwrap();
    assert_eq!(&inbound.payload[..], b"ping");

    server
        .send(inbound.id, &b"pong"[..], Reliability::Reliable)
        .unwrap();
    let mut reply = None;
    assert!(pump_until(&mut client, &mut server, || {
        if let Ok(event) = client_events.payloads.try_recv() {
            reply = Some(event);
        }
        reply.is_some()
    }));
    assert_eq!(&reply.unwrap().payload[..], b"pong");

    // Graceful close reaches the server.
    assert!(client.disconnect(id, DisconnectReason::Requested));
    let mut closed = false;
    assert!(pump_until(&mut client, &mut server, || {
        while let Ok(event) = server_events.lifecycle.try_recv() {
            if matches!(event, TransportEvent::Disconnected { id, .. } if id == inbound.id) {
                closed = true;
            }
        }
        closed
    }));
    assert_eq!(client.connection_count(), 0);
}

#[test]
fn test_udp_echo() {
    echo_roundtrip(SocketKind::Udp);
}

#[test]
fn test_tcp_echo() {
    echo_roundtrip(SocketKind::Tcp);
}

#[test]
fn test_many_unreliable_over_tcp_keep_framing() {
    let (mut server, mut server_events) = transport();
    let (mut client, mut client_events) = transport();
    let listener = server.listen(loopback(), SocketKind::Tcp).unwrap();
    let id = client.connect(listener.local_addr(), SocketKind::Tcp).unwrap();

    let mut connected = false;
    assert!(pump_until(&mut client, &mut server, || {
        while let Ok(event) = client_events.lifecycle.try_recv() {
            connected |= matches!(event, TransportEvent::Connected { .. });
        }
        connected
    }));

    // TCP never drops or reorders, so even the unreliable channel sees all.
    for i in 0..200u32 {
        client
            .send(id, i.to_be_bytes().to_vec(), Reliability::Unreliable)
            .unwrap();
    }
    let mut received = Vec::new();
    assert!(pump_until(&mut client, &mut server, || {
        while let Ok(event) = server_events.payloads.try_recv() {
            received.push(u32::from_be_bytes(event.payload[..].try_into().unwrap()));
        }
        received.len() == 200
    }));
    assert_eq!(received, (0..200).collect::<Vec<_>>());
}

#[test]
fn test_listen_on_taken_port_fails() {
    let (mut first, _events) = transport();
    let (mut second, _other) = transport();
    let listener = first.listen(loopback(), SocketKind::Udp).unwrap();

    let err = second
        .listen(listener.local_addr(), SocketKind::Udp)
        .unwrap_err();
    assert!(matches!(err, BindError::Bind { addr, .. } if addr == listener.local_addr()));
}

/// A bare TCP client that has written one frame.
fn raw_stream(to: SocketAddr, header: Option<(PacketHeader, &[u8])>) -> TcpStream {
    let mut stream = TcpStream::connect(to).unwrap();
    if let Some((header, payload)) = header {
        let codec = PacketCodec::from_config(&TransportConfig::default());
        stream.write_all(&codec.encode(&header, payload).unwrap()).unwrap();
    }
    stream
        .set_read_timeout(Some(Duration::from_millis(5)))
        .unwrap();
    stream
}

/// Poll `server` until it closes `stream`; returns what it wrote first.
fn read_until_closed(server: &mut Transport, stream: &mut TcpStream) -> Option<Vec<u8>> {
    let start = Instant::now();
    let mut bytes = Vec::new();
    let mut buf = [0u8; 256];
    while start.elapsed() < DEADLINE {
        server.poll(Duration::from_millis(5)).unwrap();
        match stream.read(&mut buf) {
            Ok(0) => return Some(bytes),
            Ok(n) => bytes.extend_from_slice(&buf[..n]),
            Err(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(_) => return Some(bytes),
        }
    }
    None
}

/// A server limited to one connection, already serving one over TCP.
fn full_server() -> (Transport, TransportEvents, ListenHandle, Transport) {
    let config = TransportConfig::builder().max_connections(1).build().unwrap();
    let (mut server, server_events) = Transport::new(config).unwrap();
    let (mut client, mut client_events) = transport();
    let listener = server.listen(loopback(), SocketKind::Tcp).unwrap();

    client.connect(listener.local_addr(), SocketKind::Tcp).unwrap();
    let mut connected = false;
    assert!(pump_until(&mut client, &mut server, || {
        while let Ok(event) = client_events.lifecycle.try_recv() {
            connected |= matches!(event, TransportEvent::Connected { .. });
        }
        connected
    }));
    (server, server_events, listener, client)
}

#[test]
fn test_rejected_tcp_handshake_closes_stream() {
    let (mut server, mut server_events, _, _client) = full_server();
    let second = server.listen(loopback(), SocketKind::Tcp).unwrap();

    let version = TransportConfig::default().protocol_version;
    let payload = handshake_payload(version);
    let mut stream = raw_stream(
        second.local_addr(),
        Some((PacketHeader::handshake(1), &payload[..])),
    );
    let written = read_until_closed(&mut server, &mut stream).expect("stream left open");

    let codec = PacketCodec::from_config(&TransportConfig::default());
    let (header, _) = codec.decode(&written).unwrap();
    assert_eq!(header.packet_type, PacketType::Disconnect);
    assert_eq!(header.flags, PacketFlags::disconnect(DisconnectReason::Rejected));

    assert_eq!(server.stats().rejected_handshakes, 1);
    assert_eq!(server.connection_count(), 1);
    let mut rejected = false;
    while let Ok(event) = server_events.lifecycle.try_recv() {
        rejected |= matches!(event, TransportEvent::HandshakeRejected { .. });
    }
    assert!(rejected);
}

#[test]
fn test_tcp_streams_beyond_connection_limit_are_refused() {
    let (mut server, _events, listener, _client) = full_server();

    let mut stream = raw_stream(listener.local_addr(), None);
    let written = read_until_closed(&mut server, &mut stream).expect("stream left open");

    assert!(written.is_empty());
    assert_eq!(server.connection_count(), 1);
}

#[test]
fn test_tcp_data_from_unknown_peer_closes_stream() {
    let (mut server, _events) = transport();
    let listener = server.listen(loopback(), SocketKind::Tcp).unwrap();

    let mut stream = raw_stream(listener.local_addr(), Some((PacketHeader::keep_alive(), &b""[..])));
    let written = read_until_closed(&mut server, &mut stream).expect("stream left open");

    assert!(written.is_empty());
    assert_eq!(server.stats().unknown_peer_packets, 1);
}

#[test]
fn test_silent_tcp_stream_is_closed() {
    let config = TransportConfig::builder()
        .keep_alive_interval(Duration::from_millis(50))
        .inactivity_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let (mut server, _events) = Transport::new(config).unwrap();
    let listener = server.listen(loopback(), SocketKind::Tcp).unwrap();

    let started = Instant::now();
    let mut stream = raw_stream(listener.local_addr(), None);
    let written = read_until_closed(&mut server, &mut stream).expect("stream left open");

    assert!(written.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(server.stats().idle_streams_closed, 1);
    assert_eq!(server.connection_count(), 0);
}
