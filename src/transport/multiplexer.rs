//! The reactor tick.
//!
//! One [`Multiplexer::tick`] call:
//!
//! 1. waits on the mio poll until the soonest connection deadline, the
//!    configured maximum, or a wake from another thread;
//! 2. drains every socket until it has nothing more, decoding each datagram
//!    (or re-framing each stream) and dispatching it to its connection;
//! 3. runs every connection's timers;
//! 4. applies queued commands from [`TransportHandle`](super::TransportHandle)s;
//! 5. publishes events, writes every connection's outbox, and finally removes
//!    connections that closed, after their `Disconnected` event.
//!
//! Nothing else ever touches a [`ConnectionState`]; removal only happens at
//! the end of a tick, so no handler can observe a dangling id.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::{Events, Poll, Token, Waker};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};

use super::connection::{ConnectionState, Reliability};
use super::interface::{Command, ConnectTarget, PayloadEvent, TransportEvent, TransportStats};
use super::socket::{SocketError, SocketId, SocketKind, SocketMode, TransportSocket};
use super::table::{ConnectionId, ConnectionIdAllocator, ConnectionTable};
use crate::codec::{FrameAssembler, PacketCodec, PacketHeader, PacketType};
use crate::core::error::{BindError, ConnectError, DecodeError, DisconnectReason, SendError};
use crate::core::{Clock, TransportConfig};

/// Token reserved for the cross-thread waker.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
struct SocketEntry {
    socket: Box<dyn TransportSocket>,
    /// Opened for exactly one outbound connection; dropped with it.
    dedicated: bool,
    /// Stream re-framing state, per peer.
    assemblers: HashMap<SocketAddr, FrameAssembler>,
    /// Open streams with no connection yet, and when they were first seen.
    unclaimed: HashMap<SocketAddr, Instant>,
}

/// Single-threaded reactor owning every socket and the connection table.
pub(crate) struct Multiplexer {
    config: Arc<TransportConfig>,
    clock: Arc<dyn Clock>,
    codec: PacketCodec,
    poll: Poll,
    events: Events,
    sockets: HashMap<SocketId, SocketEntry>,
    next_socket: usize,
    table: ConnectionTable,
    commands: UnboundedReceiver<Command>,
    payloads: UnboundedSender<PayloadEvent>,
    lifecycle: UnboundedSender<TransportEvent>,
    stats: TransportStats,
    shutdown_requested: bool,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("sockets", &self.sockets.len())
            .field("connections", &self.table.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Multiplexer {
    pub(crate) fn new(
        config: Arc<TransportConfig>,
        clock: Arc<dyn Clock>,
        ids: ConnectionIdAllocator,
        commands: UnboundedReceiver<Command>,
        payloads: UnboundedSender<PayloadEvent>,
        lifecycle: UnboundedSender<TransportEvent>,
    ) -> io::Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let mux = Self {
            codec: PacketCodec::from_config(&config),
            table: ConnectionTable::new(config.max_connections, ids),
            config,
            clock,
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            sockets: HashMap::new(),
            next_socket: 0,
            commands,
            payloads,
            lifecycle,
            stats: TransportStats::default(),
            shutdown_requested: false,
        };
        Ok((mux, waker))
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub(crate) fn stats(&self) -> TransportStats {
        self.stats
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub(crate) fn socket_local_addr(&self, socket: SocketId) -> Option<SocketAddr> {
        self.sockets.get(&socket).map(|e| e.socket.local_addr())
    }

    // =========================================================================
    // Sockets
    // =========================================================================

    /// Register a socket and start draining it.
    pub(crate) fn add_socket(
        &mut self,
        mut socket: Box<dyn TransportSocket>,
        dedicated: bool,
    ) -> Result<SocketId, BindError> {
        let id = SocketId(self.next_socket);
        self.next_socket += 1;
        socket
            .register(self.poll.registry(), id.token())
            .map_err(BindError::Register)?;
        socket.limit_peers(self.config.max_connections);
        info!(socket = %id, local_addr = %socket.local_addr(), mode = ?socket.mode(), dedicated, "socket added");
        self.sockets.insert(
            id,
            SocketEntry {
                socket,
                dedicated,
                assemblers: HashMap::new(),
                unclaimed: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn drop_socket(&mut self, id: SocketId) {
        if let Some(mut entry) = self.sockets.remove(&id) {
            if let Err(err) = entry.socket.deregister(self.poll.registry()) {
                debug!(socket = %id, ?err, "deregister failed");
            }
            debug!(socket = %id, "socket removed");
        }
    }

    /// Close every connection on `socket` with `Shutdown`, then drop it.
    pub(crate) fn remove_socket(&mut self, socket: SocketId) {
        for id in self.table.ids_on_socket(socket) {
            if let Some(conn) = self.table.find_mut(id) {
                conn.disconnect(DisconnectReason::Shutdown);
            }
        }
        self.flush_connections();
        self.reap_closed();
        self.drop_socket(socket);
    }

    /// Fatal error: everything on the socket fails with `TransportFailure`.
    fn fail_socket(&mut self, socket: SocketId, error: SocketError) {
        warn!(socket = %socket, %error, "socket failed");
        for id in self.table.ids_on_socket(socket) {
            if let Some(conn) = self.table.find_mut(id) {
                conn.close(DisconnectReason::TransportFailure);
            }
        }
        self.drop_socket(socket);
        self.stats.socket_failures += 1;
        let _ = self
            .lifecycle
            .send(TransportEvent::SocketFailed { socket, error });
    }

    /// Reset or unreachable: close only the connection it belongs to.
    fn on_peer_error(&mut self, socket: SocketId, error: SocketError) {
        let reason = match error {
            SocketError::ConnectionReset { .. } => DisconnectReason::ConnectionReset,
            SocketError::AddressUnreachable { .. } => DisconnectReason::AddressUnreachable,
            SocketError::WouldBlock | SocketError::Fatal(_) => return,
        };
        let target = match error.peer() {
            Some(peer) => {
                if let Some(entry) = self.sockets.get_mut(&socket) {
                    entry.assemblers.remove(&peer);
                }
                self.table.find_by_address(socket, peer)
            }
            None => match self.table.ids_on_socket(socket).as_slice() {
                [only] => Some(*only),
                _ => None,
            },
        };
        match target.and_then(|id| self.table.find_mut(id)) {
            Some(conn) => {
                info!(id = %conn.id(), peer = %conn.peer(), %error, "peer unreachable");
                conn.close(reason);
            }
            None => debug!(socket = %socket, %error, "unattributed socket error"),
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Open an outbound connection with a freshly allocated id.
    pub(crate) fn connect(
        &mut self,
        peer: SocketAddr,
        target: ConnectTarget,
    ) -> Result<ConnectionId, ConnectError> {
        let id = self.table.allocator().allocate();
        self.connect_reserved(id, peer, target)?;
        Ok(id)
    }

    /// Open an outbound connection under an id reserved by a handle.
    pub(crate) fn connect_reserved(
        &mut self,
        id: ConnectionId,
        peer: SocketAddr,
        target: ConnectTarget,
    ) -> Result<(), ConnectError> {
        let (socket, dedicated) = match target {
            ConnectTarget::Socket(socket) => {
                if !self.sockets.contains_key(&socket) {
                    return Err(ConnectError::UnknownSocket);
                }
                (socket, false)
            }
            ConnectTarget::Dedicated(kind) => {
                if self.table.is_full() {
                    return Err(ConnectError::Table(
                        crate::core::error::TableError::Full {
                            max: self.table.capacity(),
                        },
                    ));
                }
                let socket = open_dedicated(kind, peer)?;
                let socket = self.add_socket(socket, true).map_err(|err| match err {
                    BindError::Register(err) | BindError::Bind { source: err, .. } => {
                        ConnectError::Io(err)
                    }
                    BindError::Unsupported => {
                        ConnectError::Io(io::ErrorKind::Unsupported.into())
                    }
                })?;
                (socket, true)
            }
        };

        let now = self.clock.now();
        let state = ConnectionState::outbound(id, socket, peer, self.config.clone(), now);
        if let Err(err) = self.table.insert_reserved(state) {
            if dedicated {
                self.drop_socket(socket);
            }
            return Err(err.into());
        }
        info!(%id, %peer, socket = %socket, "connecting");
        Ok(())
    }

    /// Queue a payload on a connection.
    pub(crate) fn send(
        &mut self,
        id: ConnectionId,
        payload: Bytes,
        reliability: Reliability,
    ) -> Result<(), SendError> {
        let now = self.clock.now();
        let conn = self
            .table
            .find_mut(id)
            .ok_or(SendError::UnknownConnection)?;
        conn.send(now, payload, reliability)
    }

    /// Request a disconnect; the goodbye goes out on the next flush.
    pub(crate) fn disconnect(&mut self, id: ConnectionId, reason: DisconnectReason) -> bool {
        match self.table.find_mut(id) {
            Some(conn) => {
                conn.disconnect(reason);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// Run one reactor iteration, waiting at most `max_wait` for I/O.
    pub(crate) fn tick(&mut self, max_wait: Duration) -> io::Result<()> {
        let timeout = self.poll_timeout(max_wait);
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
        trace!(events = self.events.iter().count(), "poll returned");

        let now = self.clock.now();
        self.receive_all(now);
        for (_, conn) in self.table.iter_mut() {
            conn.tick(now);
        }
        self.drain_commands();
        self.flush_connections();
        self.reap_closed();
        self.sweep_unclaimed(now);
        Ok(())
    }

    fn poll_timeout(&self, max_wait: Duration) -> Duration {
        if !self.commands.is_empty() {
            return Duration::ZERO;
        }
        let now = self.clock.now();
        let mut timeout = max_wait.min(self.config.max_poll_interval);
        for (_, conn) in self.table.iter() {
            if let Some(deadline) = conn.next_deadline() {
                timeout = timeout.min(deadline.saturating_duration_since(now));
            }
        }
        timeout
    }

    fn receive_all(&mut self, now: Instant) {
        let ids: Vec<SocketId> = self.sockets.keys().copied().collect();
        for socket in ids {
            self.drain_socket(socket, now);
        }
    }

    fn drain_socket(&mut self, socket: SocketId, now: Instant) {
        loop {
            let Some(entry) = self.sockets.get_mut(&socket) else {
                return;
            };
            let mode = entry.socket.mode();
            match entry.socket.try_receive() {
                Ok(Some(received)) => match mode {
                    SocketMode::Datagram => {
                        self.on_datagram(socket, received.peer, received.data, now)
                    }
                    SocketMode::Stream => {
                        self.on_stream_bytes(socket, received.peer, &received.data, now)
                    }
                },
                Ok(None) | Err(SocketError::WouldBlock) => return,
                Err(err) if err.is_fatal() => {
                    self.fail_socket(socket, err);
                    return;
                }
                Err(err) => self.on_peer_error(socket, err),
            }
        }
    }

    fn on_datagram(
        &mut self,
        socket: SocketId,
        peer: SocketAddr,
        data: Bytes,
        now: Instant,
    ) {
        match self.codec.decode(&data) {
            Ok((header, payload)) => {
                let payload = data.slice_ref(payload);
                self.dispatch(socket, peer, header, payload, now);
            }
            Err(err) => self.on_decode_error(socket, peer, err),
        }
    }

    fn on_stream_bytes(
        &mut self,
        socket: SocketId,
        peer: SocketAddr,
        data: &[u8],
        now: Instant,
    ) {
        let codec = self.codec;
        let Some(entry) = self.sockets.get_mut(&socket) else {
            return;
        };
        let assembler = entry
            .assemblers
            .entry(peer)
            .or_insert_with(|| FrameAssembler::new(codec));
        assembler.push(data);

        let mut frames = Vec::new();
        let mut failure = None;
        while let Some(next) = assembler.next_frame() {
            match next {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        for frame in frames {
            self.on_datagram(socket, peer, frame, now);
            let open = self
                .sockets
                .get(&socket)
                .is_some_and(|entry| entry.assemblers.contains_key(&peer));
            if !open {
                // Dispatch closed the stream; the rest of the bytes go with it.
                return;
            }
        }

        if let Some(err) = failure {
            // A stream with a bad header can't be re-synchronised.
            warn!(socket = %socket, %peer, %err, "stream framing error");
            if let Some(entry) = self.sockets.get_mut(&socket) {
                entry.assemblers.remove(&peer);
            }
            match self
                .table
                .find_by_address(socket, peer)
                .and_then(|id| self.table.find_mut(id))
            {
                Some(conn) => conn.disconnect(DisconnectReason::ProtocolViolation),
                None => {
                    self.stats.unknown_peer_malformed += 1;
                    if let Some(entry) = self.sockets.get_mut(&socket) {
                        entry.socket.close_peer(peer);
                    }
                }
            }
        }
    }

    fn on_decode_error(&mut self, socket: SocketId, peer: SocketAddr, err: DecodeError) {
        match self
            .table
            .find_by_address(socket, peer)
            .and_then(|id| self.table.find_mut(id))
        {
            Some(conn) => {
                debug!(id = %conn.id(), %peer, %err, "dropping malformed packet");
                conn.on_malformed();
            }
            None => {
                trace!(%peer, %err, "dropping malformed packet from unknown peer");
                self.stats.unknown_peer_malformed += 1;
            }
        }
    }

    fn dispatch(
        &mut self,
        socket: SocketId,
        peer: SocketAddr,
        header: PacketHeader,
        payload: Bytes,
        now: Instant,
    ) {
        if let Some(id) = self.table.find_by_address(socket, peer) {
            if let Some(conn) = self.table.find_mut(id) {
                conn.receive(now, header, payload);
            }
            return;
        }

        let accepts = self.sockets.get(&socket).is_some_and(|e| !e.dedicated);
        if header.packet_type != PacketType::Handshake || !accepts {
            trace!(%peer, packet_type = ?header.packet_type, "dropping packet from unknown peer");
            self.stats.unknown_peer_packets += 1;
            self.close_stream(socket, peer);
            return;
        }

        let config = self.config.clone();
        match self.table.create(socket, peer, |id| {
            ConnectionState::inbound(id, socket, peer, config, now)
        }) {
            Ok(id) => {
                debug!(%id, %peer, socket = %socket, "inbound handshake");
                if let Some(conn) = self.table.find_mut(id) {
                    conn.receive(now, header, payload);
                }
            }
            Err(error) => {
                warn!(%peer, %error, "rejecting handshake");
                self.stats.rejected_handshakes += 1;
                let reject = PacketHeader::disconnect(DisconnectReason::Rejected);
                if let Err(err) = self.write(socket, peer, &reject, &[]) {
                    debug!(%peer, %err, "failed to send rejection");
                }
                self.close_stream(socket, peer);
                let _ = self
                    .lifecycle
                    .send(TransportEvent::HandshakeRejected { socket, peer, error });
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Connect { id, peer, target } => {
                    if let Err(error) = self.connect_reserved(id, peer, target) {
                        warn!(%id, %peer, %error, "connect failed");
                        let reason = match error {
                            ConnectError::Table(_) => DisconnectReason::Rejected,
                            _ => DisconnectReason::TransportFailure,
                        };
                        let _ = self.lifecycle.send(TransportEvent::Disconnected {
                            id,
                            peer,
                            reason,
                            error: Some(error),
                        });
                    }
                }
                Command::Send {
                    id,
                    payload,
                    reliability,
                } => {
                    if let Err(error) = self.send(id, payload, reliability) {
                        debug!(%id, %error, "queued send failed");
                        let _ = self
                            .lifecycle
                            .send(TransportEvent::SendFailed { id, error });
                    }
                }
                Command::Disconnect { id, reason } => {
                    self.disconnect(id, reason);
                }
                Command::Shutdown => self.shutdown_requested = true,
            }
        }
    }

    /// Refuse new commands and fail the queued ones.
    fn close_commands(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Connect { id, peer, .. } => {
                    let _ = self.lifecycle.send(TransportEvent::Disconnected {
                        id,
                        peer,
                        reason: DisconnectReason::Shutdown,
                        error: Some(ConnectError::Shutdown),
                    });
                }
                Command::Send { id, .. } => {
                    let _ = self.lifecycle.send(TransportEvent::SendFailed {
                        id,
                        error: SendError::Shutdown,
                    });
                }
                Command::Disconnect { .. } | Command::Shutdown => {}
            }
        }
    }

    fn write(
        &mut self,
        socket: SocketId,
        peer: SocketAddr,
        header: &PacketHeader,
        payload: &[u8],
    ) -> Result<(), SocketError> {
        let Some(entry) = self.sockets.get_mut(&socket) else {
            return Err(SocketError::ConnectionReset { peer: Some(peer) });
        };
        let frame = match self.codec.encode(header, payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%peer, %err, "dropping unencodable packet");
                return Ok(());
            }
        };
        entry.socket.try_send(peer, &frame).map(|_| ())
    }

    /// Publish events and write every outbox.
    fn flush_connections(&mut self) {
        let mut writes = Vec::new();
        for (id, conn) in self.table.iter_mut() {
            if conn.take_connected() {
                let _ = self.lifecycle.send(TransportEvent::Connected {
                    id: *id,
                    peer: conn.peer(),
                });
            }
            for payload in conn.take_delivered() {
                let _ = self.payloads.send(PayloadEvent { id: *id, payload });
            }
            let outbox = conn.take_outbox();
            if !outbox.is_empty() {
                writes.push((conn.socket(), conn.peer(), outbox));
            }
        }

        for (socket, peer, outbox) in writes {
            for packet in outbox {
                match self.write(socket, peer, &packet.header, &packet.payload) {
                    Ok(()) => {}
                    Err(SocketError::WouldBlock) => {
                        self.stats.dropped_writes += 1;
                        debug!(%peer, "socket buffer full, packet dropped");
                    }
                    Err(err) if err.is_fatal() => {
                        self.fail_socket(socket, err);
                        break;
                    }
                    Err(err) => {
                        self.on_peer_error(socket, err);
                        break;
                    }
                }
            }
        }

        for entry in self.sockets.values_mut() {
            entry.socket.flush();
        }
    }

    /// Remove closed connections after announcing them.
    fn reap_closed(&mut self) {
        let closed: Vec<ConnectionId> = self
            .table
            .iter()
            .filter(|(_, conn)| conn.is_closed())
            .map(|(id, _)| *id)
            .collect();

        for id in closed {
            let Some(mut conn) = self.table.remove(id) else {
                continue;
            };
            let reason = conn
                .close_reason()
                .unwrap_or(DisconnectReason::TransportFailure);
            let peer = conn.peer();
            info!(%id, %peer, %reason, "connection removed");
            let _ = self.lifecycle.send(TransportEvent::Disconnected {
                id,
                peer,
                reason,
                error: conn.take_close_error(),
            });
            self.release_peer(conn.socket(), peer);
        }
    }

    fn release_peer(&mut self, socket: SocketId, peer: SocketAddr) {
        self.close_stream(socket, peer);
        if self.sockets.get(&socket).is_some_and(|entry| entry.dedicated) {
            self.drop_socket(socket);
        }
    }

    /// Forget a peer's re-framing state and close its stream, if any.
    fn close_stream(&mut self, socket: SocketId, peer: SocketAddr) {
        let Some(entry) = self.sockets.get_mut(&socket) else {
            return;
        };
        entry.assemblers.remove(&peer);
        entry.unclaimed.remove(&peer);
        if entry.socket.mode() == SocketMode::Stream {
            entry.socket.close_peer(peer);
        }
    }

    /// Close accepted streams that never produced a connection within the
    /// inactivity timeout.
    fn sweep_unclaimed(&mut self, now: Instant) {
        let timeout = self.config.inactivity_timeout;
        let mut expired = Vec::new();
        for (socket, entry) in &mut self.sockets {
            if entry.socket.mode() != SocketMode::Stream {
                continue;
            }
            let open: HashSet<SocketAddr> = entry.socket.open_peers().into_iter().collect();
            entry.unclaimed.retain(|peer, _| open.contains(peer));
            for peer in open {
                if self.table.find_by_address(*socket, peer).is_some() {
                    entry.unclaimed.remove(&peer);
                    continue;
                }
                let since = *entry.unclaimed.entry(peer).or_insert(now);
                if now.saturating_duration_since(since) >= timeout {
                    expired.push((*socket, peer));
                }
            }
        }
        for (socket, peer) in expired {
            debug!(socket = %socket, %peer, "closing stream without a connection");
            self.stats.idle_streams_closed += 1;
            self.close_stream(socket, peer);
        }
    }

    /// Best-effort goodbye to every peer, then drop all state.
    ///
    /// Handles are refused from here on; commands they already queued are
    /// answered with shutdown failures.
    pub(crate) fn shutdown(&mut self) {
        self.close_commands();
        let ids = self.table.ids();
        if !ids.is_empty() {
            info!(connections = ids.len(), "shutting down");
        }
        for id in ids {
            if let Some(conn) = self.table.find_mut(id) {
                conn.disconnect(DisconnectReason::Shutdown);
            }
        }
        self.flush_connections();
        self.reap_closed();
        let sockets: Vec<SocketId> = self.sockets.keys().copied().collect();
        for socket in sockets {
            self.drop_socket(socket);
        }
    }
}

fn open_dedicated(kind: SocketKind, peer: SocketAddr) -> Result<Box<dyn TransportSocket>, ConnectError> {
    match kind {
        #[cfg(feature = "udp")]
        SocketKind::Udp => Ok(Box::new(super::udp::UdpTransportSocket::bind_for(peer)?)),
        #[cfg(feature = "tcp")]
        SocketKind::Tcp => Ok(Box::new(super::tcp::TcpTransportSocket::connect(peer)?)),
        #[allow(unreachable_patterns)]
        _ => Err(ConnectError::Io(io::ErrorKind::Unsupported.into())),
    }
}
