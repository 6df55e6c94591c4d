//! Public transport surface.
//!
//! [`Transport`] owns the reactor and must stay on one thread. Everything a
//! different thread needs goes through a cloneable [`TransportHandle`], which
//! queues a [`Command`] and wakes the reactor. Inbound payloads and lifecycle
//! changes come out of the two receivers in [`TransportEvents`].
//!
//! ```no_run
//! use std::time::Duration;
//! use tether_net::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (mut transport, mut events) = Transport::new(TransportConfig::default())?;
//! let server = transport.listen("127.0.0.1:7000".parse()?, SocketKind::Udp)?;
//! println!("listening on {}", server.local_addr());
//!
//! loop {
//!     transport.poll(Duration::from_millis(10))?;
//!     while let Ok(event) = events.payloads.try_recv() {
//!         transport.send(event.id, event.payload, Reliability::Reliable)?;
//!     }
//! }
//! # }
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mio::Waker;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use super::connection::{ConnectionInfo, Reliability};
use super::multiplexer::Multiplexer;
use super::socket::{SocketError, SocketId, SocketKind, TransportSocket};
use super::table::{ConnectionId, ConnectionIdAllocator};
use crate::core::error::{
    BindError, ConnectError, DisconnectReason, SendError, TableError, TransportResult,
};
use crate::core::{Clock, SystemClock, TransportConfig};

/// A payload delivered on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEvent {
    /// Connection it arrived on.
    pub id: ConnectionId,
    /// Application bytes.
    pub payload: Bytes,
}

/// Connection lifecycle and socket notifications.
#[derive(Debug)]
pub enum TransportEvent {
    /// Handshake completed; the connection accepts sends.
    Connected {
        /// Connection id.
        id: ConnectionId,
        /// Remote address.
        peer: SocketAddr,
    },

    /// The connection is gone. Emitted exactly once per connection, after
    /// every payload it delivered.
    Disconnected {
        /// Connection id.
        id: ConnectionId,
        /// Remote address.
        peer: SocketAddr,
        /// Why it closed.
        reason: DisconnectReason,
        /// Detail for failed connects (timeout, version mismatch).
        error: Option<ConnectError>,
    },

    /// An inbound handshake was refused.
    HandshakeRejected {
        /// Socket it arrived on.
        socket: SocketId,
        /// Remote address.
        peer: SocketAddr,
        /// Why the table refused it.
        error: TableError,
    },

    /// A socket failed and was removed with all its connections.
    SocketFailed {
        /// The failed socket.
        socket: SocketId,
        /// OS error.
        error: SocketError,
    },

    /// A send queued through a [`TransportHandle`] was refused.
    SendFailed {
        /// Target connection.
        id: ConnectionId,
        /// Why.
        error: SendError,
    },
}

/// Receiving ends of the transport's event streams.
#[derive(Debug)]
pub struct TransportEvents {
    /// Inbound application payloads, in delivery order per connection.
    pub payloads: UnboundedReceiver<PayloadEvent>,
    /// Connection lifecycle and socket failures.
    pub lifecycle: UnboundedReceiver<TransportEvent>,
}

/// Transport-wide counters for traffic that belongs to no connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Well-formed packets from unknown peers that were not handshakes.
    pub unknown_peer_packets: u64,
    /// Malformed packets from unknown peers.
    pub unknown_peer_malformed: u64,
    /// Handshakes refused because the table was full.
    pub rejected_handshakes: u64,
    /// Sockets torn down after a fatal error.
    pub socket_failures: u64,
    /// Frames dropped because a socket buffer was full.
    pub dropped_writes: u64,
    /// Accepted streams closed for never completing a handshake.
    pub idle_streams_closed: u64,
}

/// A bound socket that accepts inbound connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenHandle {
    socket: SocketId,
    local_addr: SocketAddr,
}

impl ListenHandle {
    /// Reactor socket id.
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// Bound address; resolves port 0 to the real port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Where an outbound connection sends from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectTarget {
    /// An existing listening socket.
    Socket(SocketId),
    /// A new socket owned by the connection.
    Dedicated(SocketKind),
}

/// Work queued for the reactor by a [`TransportHandle`].
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        id: ConnectionId,
        peer: SocketAddr,
        target: ConnectTarget,
    },
    Send {
        id: ConnectionId,
        payload: Bytes,
        reliability: Reliability,
    },
    Disconnect {
        id: ConnectionId,
        reason: DisconnectReason,
    },
    Shutdown,
}

/// Thread-safe handle to a [`Transport`].
///
/// Calls are queued and applied at the next reactor tick. Failures that can
/// only be known there come back as [`TransportEvent`]s.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: UnboundedSender<Command>,
    waker: Arc<Waker>,
    ids: ConnectionIdAllocator,
    max_payload: usize,
}

impl TransportHandle {
    fn submit(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            return false;
        }
        if let Err(err) = self.waker.wake() {
            debug!(?err, "failed to wake reactor");
        }
        true
    }

    /// Open a connection on a new socket of `kind`.
    ///
    /// The id is reserved immediately; watch for `Connected` or
    /// `Disconnected` with that id.
    pub fn connect(&self, peer: SocketAddr, kind: SocketKind) -> Result<ConnectionId, ConnectError> {
        self.connect_to(peer, ConnectTarget::Dedicated(kind))
    }

    /// Open a connection from an existing listening socket.
    pub fn connect_via(
        &self,
        listener: &ListenHandle,
        peer: SocketAddr,
    ) -> Result<ConnectionId, ConnectError> {
        self.connect_to(peer, ConnectTarget::Socket(listener.socket))
    }

    fn connect_to(&self, peer: SocketAddr, target: ConnectTarget) -> Result<ConnectionId, ConnectError> {
        let id = self.ids.allocate();
        if self.submit(Command::Connect { id, peer, target }) {
            Ok(id)
        } else {
            Err(ConnectError::Shutdown)
        }
    }

    /// Queue a payload. Size is checked here; everything else at the tick.
    pub fn send(
        &self,
        id: ConnectionId,
        payload: impl Into<Bytes>,
        reliability: Reliability,
    ) -> Result<(), SendError> {
        let payload = payload.into();
        if payload.len() > self.max_payload {
            return Err(SendError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        let command = Command::Send {
            id,
            payload,
            reliability,
        };
        if self.submit(command) {
            Ok(())
        } else {
            Err(SendError::Shutdown)
        }
    }

    /// Queue a disconnect. Unknown ids are ignored.
    pub fn disconnect(&self, id: ConnectionId, reason: DisconnectReason) {
        self.submit(Command::Disconnect { id, reason });
    }

    /// Ask [`Transport::run`] to shut down and return.
    pub fn shutdown(&self) {
        self.submit(Command::Shutdown);
    }
}

/// Connection-oriented packet transport.
///
/// Owns every socket and connection. Drive it with [`poll`](Self::poll) or
/// [`run`](Self::run) from the thread that created it.
#[derive(Debug)]
pub struct Transport {
    mux: Multiplexer,
    handle: TransportHandle,
    shut_down: bool,
}

impl Transport {
    /// Create a transport on the system clock.
    pub fn new(config: TransportConfig) -> TransportResult<(Self, TransportEvents)> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a transport reading time from `clock`.
    pub fn with_clock(
        config: TransportConfig,
        clock: Arc<dyn Clock>,
    ) -> TransportResult<(Self, TransportEvents)> {
        config.validate()?;
        let config = Arc::new(config);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (payload_tx, payload_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let ids = ConnectionIdAllocator::new();

        let (mux, waker) = Multiplexer::new(
            config.clone(),
            clock,
            ids.clone(),
            command_rx,
            payload_tx,
            lifecycle_tx,
        )?;

        let handle = TransportHandle {
            commands: command_tx,
            waker,
            ids,
            max_payload: config.max_payload_size(),
        };
        let transport = Self {
            mux,
            handle,
            shut_down: false,
        };
        let events = TransportEvents {
            payloads: payload_rx,
            lifecycle: lifecycle_rx,
        };
        Ok((transport, events))
    }

    /// Thread-safe handle for use from other threads.
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &TransportConfig {
        self.mux.config()
    }

    /// Bind a socket of `kind` on `addr` and accept connections on it.
    pub fn listen(&mut self, addr: SocketAddr, kind: SocketKind) -> Result<ListenHandle, BindError> {
        let socket: Box<dyn TransportSocket> = match kind {
            #[cfg(feature = "udp")]
            SocketKind::Udp => Box::new(
                super::udp::UdpTransportSocket::bind(addr)
                    .map_err(|source| BindError::Bind { addr, source })?,
            ),
            #[cfg(feature = "tcp")]
            SocketKind::Tcp => Box::new(
                super::tcp::TcpTransportSocket::bind(addr)
                    .map_err(|source| BindError::Bind { addr, source })?,
            ),
            #[allow(unreachable_patterns)]
            _ => return Err(BindError::Unsupported),
        };
        self.add_socket(socket)
    }

    /// Accept connections on a caller-built socket.
    pub fn add_socket(&mut self, socket: Box<dyn TransportSocket>) -> Result<ListenHandle, BindError> {
        let local_addr = socket.local_addr();
        let socket = self.mux.add_socket(socket, false)?;
        info!(socket = %socket, %local_addr, "listening");
        Ok(ListenHandle { socket, local_addr })
    }

    /// Disconnect everything on a listening socket and close it.
    pub fn stop_listening(&mut self, listener: ListenHandle) {
        self.mux.remove_socket(listener.socket);
    }

    /// Open a connection on a new socket of `kind`.
    ///
    /// Returns once the handshake is queued; `Connected` follows on the
    /// lifecycle stream.
    pub fn connect(&mut self, peer: SocketAddr, kind: SocketKind) -> Result<ConnectionId, ConnectError> {
        self.mux.connect(peer, ConnectTarget::Dedicated(kind))
    }

    /// Open a connection from an existing listening socket.
    pub fn connect_via(
        &mut self,
        listener: &ListenHandle,
        peer: SocketAddr,
    ) -> Result<ConnectionId, ConnectError> {
        self.mux.connect(peer, ConnectTarget::Socket(listener.socket))
    }

    /// Queue a payload on a connected connection.
    pub fn send(
        &mut self,
        id: ConnectionId,
        payload: impl Into<Bytes>,
        reliability: Reliability,
    ) -> Result<(), SendError> {
        self.mux.send(id, payload.into(), reliability)
    }

    /// Start a graceful disconnect. Returns `false` for unknown ids.
    ///
    /// The goodbye is sent and `Disconnected` emitted on the next tick.
    pub fn disconnect(&mut self, id: ConnectionId, reason: DisconnectReason) -> bool {
        self.mux.disconnect(id, reason)
    }

    /// Run one reactor tick, waiting at most `max_wait` for I/O.
    pub fn poll(&mut self, max_wait: Duration) -> io::Result<()> {
        self.mux.tick(max_wait)
    }

    /// Tick until a handle requests shutdown, then shut down.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.mux.shutdown_requested() {
            let max_wait = self.mux.config().max_poll_interval;
            self.mux.tick(max_wait)?;
        }
        self.shutdown();
        Ok(())
    }

    /// Disconnect every connection with `Shutdown` and close every socket.
    ///
    /// Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.mux.shutdown();
    }

    /// Snapshot of one connection.
    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.mux.table().find(id).map(|conn| conn.info())
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.mux.table().len()
    }

    /// Bound address of a socket.
    pub fn local_addr(&self, socket: SocketId) -> Option<SocketAddr> {
        self.mux.socket_local_addr(socket)
    }

    /// Transport-wide counters.
    pub fn stats(&self) -> TransportStats {
        self.mux.stats()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
