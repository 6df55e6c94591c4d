//! Error types for the transport core.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can occur when encoding a packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Payload does not fit in the configured frame limit.
    #[error("payload too large: {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Maximum payload size allowed by the frame limit.
        max: usize,
    },
}

/// Errors that can occur when decoding a packet.
///
/// Decoding never panics: every malformed input maps to one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ends before the packet does.
    #[error("truncated packet: need {needed} bytes, have {actual}")]
    Truncated {
        /// Bytes the packet requires.
        needed: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Magic byte does not match.
    #[error("bad magic: 0x{0:02x}")]
    BadMagic(u8),

    /// Wire version is not supported.
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    /// Header fields are inconsistent.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl DecodeError {
    /// Check if the packet might still be completed by more bytes (stream mode).
    pub fn is_truncation(&self) -> bool {
        matches!(self, DecodeError::Truncated { .. })
    }
}

/// Errors from the connection table.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// The configured connection limit has been reached.
    #[error("connection table full ({max} connections)")]
    Full {
        /// Configured maximum.
        max: usize,
    },

    /// A connection for this peer already exists on this socket.
    #[error("connection to {0} already exists")]
    AddressInUse(SocketAddr),
}

/// Errors returned by `send`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No live connection has this id.
    #[error("unknown connection")]
    UnknownConnection,

    /// Payload does not fit in a single frame.
    #[error("payload too large: {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Maximum payload size.
        max: usize,
    },

    /// Connection exists but is not in the connected state.
    #[error("connection is not connected")]
    NotConnected,

    /// Too many reliable payloads are waiting for window space.
    #[error("send queue full ({limit} payloads)")]
    QueueFull {
        /// Configured queue limit.
        limit: usize,
    },

    /// The transport is gone.
    #[error("transport shut down")]
    Shutdown,
}

impl From<EncodeError> for SendError {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::PayloadTooLarge { size, max } => SendError::PayloadTooLarge { size, max },
        }
    }
}

/// Errors returned when opening a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Peer speaks a different protocol version.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        /// Local protocol version.
        local: u32,
        /// Remote protocol version.
        remote: u32,
    },

    /// Handshake or retransmission timed out.
    #[error("connection timed out")]
    Timeout,

    /// Connection table refused the entry.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// The socket handle does not name a live socket.
    #[error("unknown socket")]
    UnknownSocket,

    /// The transport is gone.
    #[error("transport shut down")]
    Shutdown,

    /// Could not create the socket for the connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Errors returned when binding a listening socket.
#[derive(Debug, Error)]
pub enum BindError {
    /// Address could not be bound.
    #[error("bind to {addr} failed: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying OS error.
        source: io::Error,
    },

    /// Socket could not be registered with the reactor.
    #[error("reactor registration failed: {0}")]
    Register(io::Error),

    /// Socket kind is not compiled in.
    #[error("socket kind not supported by this build")]
    Unsupported,
}

/// Configuration validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric option is out of range.
    #[error("{field} out of range: {reason}")]
    OutOfRange {
        /// Option name.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Why a connection ended.
///
/// Carried in `Disconnected` lifecycle events and, as a one-byte code, in the
/// flags field of Disconnect packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    /// The local application asked to disconnect.
    Requested = 1,
    /// The peer sent a Disconnect.
    Remote = 2,
    /// Handshake, retransmission, or inactivity timeout.
    Timeout = 3,
    /// Peers speak different protocol versions.
    VersionMismatch = 4,
    /// Peer sent too many malformed packets or broke stream framing.
    ProtocolViolation = 5,
    /// The underlying socket failed fatally.
    TransportFailure = 6,
    /// The OS reported the peer reset the connection.
    ConnectionReset = 7,
    /// The OS reported the peer is unreachable.
    AddressUnreachable = 8,
    /// The peer refused the handshake (its table is full).
    Rejected = 9,
    /// The local transport shut down.
    Shutdown = 10,
}

impl DisconnectReason {
    /// Wire code for Disconnect packets.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Requested),
            2 => Some(Self::Remote),
            3 => Some(Self::Timeout),
            4 => Some(Self::VersionMismatch),
            5 => Some(Self::ProtocolViolation),
            6 => Some(Self::TransportFailure),
            7 => Some(Self::ConnectionReset),
            8 => Some(Self::AddressUnreachable),
            9 => Some(Self::Rejected),
            10 => Some(Self::Shutdown),
            _ => None,
        }
    }

    /// Local reason for a Disconnect received with `code`.
    ///
    /// Only reasons that describe the local side of the exchange pass
    /// through; the rest collapse into [`DisconnectReason::Remote`].
    pub fn from_remote_code(code: u8) -> Self {
        match Self::from_code(code) {
            Some(Self::VersionMismatch) => Self::VersionMismatch,
            Some(Self::Rejected) => Self::Rejected,
            _ => Self::Remote,
        }
    }

    /// Check if this reason indicates a failure rather than an orderly close.
    pub fn is_error(self) -> bool {
        !matches!(self, Self::Requested | Self::Remote | Self::Shutdown)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Remote => "remote",
            Self::Timeout => "timeout",
            Self::VersionMismatch => "version mismatch",
            Self::ProtocolViolation => "protocol violation",
            Self::TransportFailure => "transport failure",
            Self::ConnectionReset => "connection reset",
            Self::AddressUnreachable => "address unreachable",
            Self::Rejected => "rejected",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Top-level transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Bind error.
    #[error("bind error: {0}")]
    Bind(#[from] BindError),

    /// Connect error.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Send error.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_codes() {
        for code in 1..=10u8 {
            let reason = DisconnectReason::from_code(code).unwrap();
            assert_eq!(reason.code(), code);
        }
        assert_eq!(DisconnectReason::from_code(0), None);
        assert_eq!(DisconnectReason::from_code(11), None);
    }

    #[test]
    fn test_remote_code_mapping() {
        assert_eq!(
            DisconnectReason::from_remote_code(DisconnectReason::Requested.code()),
            DisconnectReason::Remote
        );
        assert_eq!(
            DisconnectReason::from_remote_code(DisconnectReason::Shutdown.code()),
            DisconnectReason::Remote
        );
        assert_eq!(
            DisconnectReason::from_remote_code(DisconnectReason::VersionMismatch.code()),
            DisconnectReason::VersionMismatch
        );
        assert_eq!(
            DisconnectReason::from_remote_code(DisconnectReason::Rejected.code()),
            DisconnectReason::Rejected
        );
        assert_eq!(DisconnectReason::from_remote_code(0xEE), DisconnectReason::Remote);
    }

    #[test]
    fn test_error_reasons() {
        assert!(DisconnectReason::Timeout.is_error());
        assert!(DisconnectReason::TransportFailure.is_error());
        assert!(!DisconnectReason::Requested.is_error());
        assert!(!DisconnectReason::Shutdown.is_error());
    }

    #[test]
    fn test_send_error_from_encode() {
        let err: SendError = EncodeError::PayloadTooLarge { size: 10, max: 5 }.into();
        assert_eq!(err, SendError::PayloadTooLarge { size: 10, max: 5 });
    }

    #[test]
    fn test_truncation_classification() {
        assert!(DecodeError::Truncated { needed: 12, actual: 3 }.is_truncation());
        assert!(!DecodeError::Malformed("length").is_truncation());
    }
}
