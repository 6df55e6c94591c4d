//! Non-blocking socket abstraction.
//!
//! Every socket the reactor drives implements [`TransportSocket`]. UDP and
//! TCP live next to this module; the `sim` module provides an in-memory
//! implementation for tests.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use mio::{Registry, Token};
use thiserror::Error;
use tracing::debug;

/// Identifies a socket registered with a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) usize);

impl SocketId {
    /// Raw index.
    pub fn get(self) -> usize {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket-{}", self.0)
    }
}

/// How a socket delimits packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// Each receive returns exactly one packet.
    Datagram,
    /// Receives return arbitrary byte runs that must be re-framed.
    Stream,
}

/// Socket implementations the transport can create itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// UDP datagram socket.
    Udp,
    /// TCP listener and streams.
    Tcp,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::Udp => f.write_str("udp"),
            SocketKind::Tcp => f.write_str("tcp"),
        }
    }
}

/// Socket-level failures.
///
/// "Nothing ready" is not an error: [`TransportSocket::try_receive`] returns
/// `Ok(None)` and [`TransportSocket::try_send`] returns
/// [`SocketError::WouldBlock`] only so the caller can count the drop.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The OS buffer is full; try again later.
    #[error("operation would block")]
    WouldBlock,

    /// The peer reset the connection (or ICMP port unreachable on UDP).
    #[error("connection reset{}", fmt_peer(.peer))]
    ConnectionReset {
        /// Peer the error belongs to, when the OS tells us.
        peer: Option<SocketAddr>,
    },

    /// No route to the peer.
    #[error("address unreachable{}", fmt_peer(.peer))]
    AddressUnreachable {
        /// Peer the error belongs to, when the OS tells us.
        peer: Option<SocketAddr>,
    },

    /// The socket is unusable and must be recreated.
    #[error("fatal socket error: {0}")]
    Fatal(io::Error),
}

fn fmt_peer(peer: &Option<SocketAddr>) -> String {
    peer.map(|p| format!(" ({p})")).unwrap_or_default()
}

impl SocketError {
    /// Classify an I/O error from a send or receive involving `peer`.
    pub fn from_io(err: io::Error, peer: Option<SocketAddr>) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => SocketError::WouldBlock,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => SocketError::ConnectionReset { peer },
            io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable => SocketError::AddressUnreachable { peer },
            _ => SocketError::Fatal(err),
        }
    }

    /// Classify an I/O error on a path that only involves `peer`: a stream's
    /// read, write, or connect, or a datagram sent to it.
    ///
    /// Such an error never condemns the socket, so anything that is not a
    /// would-block or unreachable becomes a reset of that peer.
    pub fn from_peer_io(err: io::Error, peer: SocketAddr) -> Self {
        match Self::from_io(err, Some(peer)) {
            SocketError::Fatal(err) => {
                debug!(%peer, ?err, "peer i/o error");
                SocketError::ConnectionReset { peer: Some(peer) }
            }
            other => other,
        }
    }

    /// Check if the socket must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SocketError::Fatal(_))
    }

    /// Peer the error is attributed to, if any.
    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            SocketError::ConnectionReset { peer } | SocketError::AddressUnreachable { peer } => {
                *peer
            }
            _ => None,
        }
    }
}

/// One receive result: a datagram, or a run of stream bytes from one peer.
#[derive(Debug, Clone)]
pub struct Received {
    /// Sender address.
    pub peer: SocketAddr,
    /// Received bytes.
    pub data: Bytes,
}

/// Non-blocking socket driven by the transport reactor.
///
/// Implementations never block. The reactor calls [`try_receive`] until it
/// returns `Ok(None)` on every tick, so readiness notifications are only a
/// hint to wake up early.
///
/// [`try_receive`]: TransportSocket::try_receive
pub trait TransportSocket: Send + fmt::Debug {
    /// Packet delimiting mode.
    fn mode(&self) -> SocketMode;

    /// Bound local address.
    fn local_addr(&self) -> SocketAddr;

    /// Send one encoded frame to `peer`.
    fn try_send(&mut self, peer: SocketAddr, frame: &[u8]) -> Result<usize, SocketError>;

    /// Receive the next datagram or stream chunk, `Ok(None)` when drained.
    fn try_receive(&mut self) -> Result<Option<Received>, SocketError>;

    /// Register with the reactor. Sockets without OS handles need not.
    fn register(&mut self, _registry: &Registry, _token: Token) -> io::Result<()> {
        Ok(())
    }

    /// Deregister from the reactor.
    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        Ok(())
    }

    /// Push out any buffered writes.
    fn flush(&mut self) {}

    /// Forget per-peer resources (stream sockets close the stream).
    fn close_peer(&mut self, _peer: SocketAddr) {}

    /// Peers holding an open stream. Datagram sockets have none.
    fn open_peers(&self) -> Vec<SocketAddr> {
        Vec::new()
    }

    /// Refuse new inbound streams while `max` are open.
    fn limit_peers(&mut self, _max: usize) {}
}
