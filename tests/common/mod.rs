//! Shared harness: transports on an in-memory network with a manual clock.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tether_net::prelude::*;
use tether_net::transport::TransportEvents;

/// Simulated time per step.
pub const STEP: Duration = Duration::from_millis(10);

pub fn addr(host: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, host], port))
}

/// A transport with one sim socket bound.
pub struct Peer {
    pub transport: Transport,
    pub events: TransportEvents,
    pub listener: ListenHandle,
}

impl Peer {
    pub fn new(net: &SimNetwork, clock: &ManualClock, at: SocketAddr, config: TransportConfig) -> Self {
        let (mut transport, events) =
            Transport::with_clock(config, Arc::new(clock.clone())).expect("transport");
        let socket = net.bind(at).expect("bind");
        let listener = transport.add_socket(Box::new(socket)).expect("add socket");
        Self {
            transport,
            events,
            listener,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn connect(&mut self, to: SocketAddr) -> ConnectionId {
        self.transport
            .connect_via(&self.listener, to)
            .expect("connect")
    }

    pub fn poll(&mut self) {
        self.transport.poll(Duration::ZERO).expect("poll");
    }

    pub fn lifecycle(&mut self) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.lifecycle.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn payloads(&mut self) -> Vec<PayloadEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.payloads.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Poll every peer once, then advance the clock by [`STEP`].
pub fn step(peers: &mut [&mut Peer], clock: &ManualClock) {
    for peer in peers.iter_mut() {
        peer.poll();
    }
    clock.advance(STEP);
}

/// Connect `client` to `server` and return both connection ids.
pub fn establish(client: &mut Peer, server: &mut Peer, clock: &ManualClock) -> (ConnectionId, ConnectionId) {
    let client_id = client.connect(server.addr());
    let mut server_id = None;
    let mut client_up = false;
    for _ in 0..1000 {
        step(&mut [&mut *client, &mut *server], clock);
        for event in server.lifecycle() {
            if let TransportEvent::Connected { id, .. } = event {
                server_id = Some(id);
            }
        }
        for event in client.lifecycle() {
            if let TransportEvent::Connected { id, .. } = event {
                assert_eq!(id, client_id);
                client_up = true;
            }
        }
        if client_up {
            if let Some(server_id) = server_id {
                return (client_id, server_id);
            }
        }
    }
    panic!("connection not established");
}
