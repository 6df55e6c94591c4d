//! # Tether
//!
//! A connection-oriented packet transport core.
//!
//! Tether moves framed, sequenced packets between peers over UDP or TCP.
//! Each connection gets:
//!
//! - **Handshake**: protocol-version agreement before any data flows
//! - **Two channels**: unreliable (newest wins) and reliable (exactly once,
//!   in order, with selective acks and adaptive retransmission)
//! - **Liveness**: keep-alives and an inactivity timeout
//! - **Bounded resources**: a fixed connection limit and per-connection
//!   send queue
//!
//! A single-threaded reactor ([`Transport`]) owns every socket and
//! connection. Other threads talk to it through a [`TransportHandle`].
//!
//! ## Feature Flags
//!
//! - `udp` (default): non-blocking UDP sockets
//! - `tcp` (default): non-blocking TCP sockets with stream re-framing
//! - `sim` (default): in-memory lossy network for tests
//!
//! ## Modules
//!
//! - [`core`]: constants, configuration, clock, and error types
//! - [`codec`]: wire format
//! - [`transport`]: sockets, connection state, and the reactor
//! - [`sim`]: simulated network (requires `sim` feature)
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tether_net::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (mut transport, mut events) = Transport::new(TransportConfig::default())?;
//! let id = transport.connect("127.0.0.1:7000".parse()?, SocketKind::Udp)?;
//!
//! loop {
//!     transport.poll(Duration::from_millis(10))?;
//!     while let Ok(event) = events.lifecycle.try_recv() {
//!         if let TransportEvent::Connected { .. } = event {
//!             transport.send(id, &b"hello"[..], Reliability::Reliable)?;
//!         }
//!     }
//! }
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod codec;
pub mod core;
pub mod transport;

// In-memory network (feature-gated)
#[cfg(feature = "sim")]
#[cfg_attr(docsrs, doc(cfg(feature = "sim")))]
pub mod sim;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::codec::{PacketCodec, PacketHeader, PacketType};

    pub use crate::transport::{
        ConnectionId, ConnectionInfo, ConnectionPhase, ListenHandle, PayloadEvent, Reliability,
        SocketKind, Transport, TransportEvent, TransportEvents, TransportHandle,
        TransportSocket,
    };

    #[cfg(feature = "sim")]
    pub use crate::sim::{SimNetwork, SimSocket};
}

// Re-export commonly used items at crate root
pub use crate::core::{DisconnectReason, TransportConfig, TransportError, TransportResult};
pub use crate::transport::{ConnectionId, Reliability, Transport, TransportEvent, TransportHandle};
