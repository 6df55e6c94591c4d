//! Transport layer: sockets, connections, and the reactor that drives them.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Transport / TransportHandle           │  public surface, events
//! ├─────────────────────────────────────────┤
//! │   Multiplexer                           │  one tick: poll, drain, timers
//! ├─────────────────────────────────────────┤
//! │   ConnectionTable → ConnectionState     │  handshake, acks, keep-alive
//! ├─────────────────────────────────────────┤
//! │   PacketCodec / FrameAssembler          │  wire format
//! ├─────────────────────────────────────────┤
//! │   TransportSocket (UDP, TCP, sim)       │  non-blocking I/O
//! └─────────────────────────────────────────┘
//! ```

pub mod connection;
pub mod interface;
mod multiplexer;
pub mod reliable;
pub mod socket;
pub mod table;
pub mod timing;

#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "udp")]
pub mod udp;

pub use connection::{
    ConnectionInfo, ConnectionPhase, ConnectionState, ConnectionStats, Reliability, Role,
};
pub use interface::{
    ListenHandle, PayloadEvent, Transport, TransportEvent, TransportEvents, TransportHandle,
    TransportStats,
};
pub use reliable::{ReorderBuffer, RetransmitQueue};
pub use socket::{Received, SocketError, SocketId, SocketKind, SocketMode, TransportSocket};
pub use table::{ConnectionId, ConnectionIdAllocator, ConnectionTable};
pub use timing::RttEstimator;

#[cfg(feature = "tcp")]
pub use tcp::TcpTransportSocket;
#[cfg(feature = "udp")]
pub use udp::UdpTransportSocket;
