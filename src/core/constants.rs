//! Wire constants and default tunables.
//!
//! Wire values are fixed by the packet format and MUST NOT be changed
//! without bumping [`WIRE_VERSION`].

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Magic byte carried in the high byte of the magic/version tag.
pub const PACKET_MAGIC: u8 = 0xA5;

/// Wire format version carried in the low byte of the magic/version tag.
pub const WIRE_VERSION: u8 = 0x01;

/// Fixed packet header size (tag + type + flags + sequence + length).
pub const HEADER_SIZE: usize = 2 + 1 + 1 + 4 + 4;

/// Size of the handshake payload (big-endian protocol version).
pub const HANDSHAKE_PAYLOAD_SIZE: usize = 4;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

// =============================================================================
// PACKET FLAGS
// =============================================================================

/// Data packet belongs to the reliable channel.
pub const FLAG_RELIABLE: u8 = 0x01;

/// Flag bits defined for Data packets. Anything else is reserved.
pub const DATA_FLAGS_MASK: u8 = FLAG_RELIABLE;

// =============================================================================
// DEFAULT TUNABLES
// =============================================================================

/// Default maximum number of live connections per transport.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default maximum encoded frame size (header + payload).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1400;

/// Default reliable reorder window, in packets.
pub const DEFAULT_REORDER_WINDOW: u32 = 64;

/// Largest reorder window accepted (must stay well below half the sequence space).
pub const MAX_REORDER_WINDOW: u32 = 32_768;

/// Send a keep-alive after this long without hearing from the peer.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Consider the peer dead after this long without any packet.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default retransmissions of a single packet before the connection is dropped.
pub const DEFAULT_MAX_RETRANSMIT_ATTEMPTS: u32 = 10;

/// Default malformed packets tolerated from a connected peer.
pub const DEFAULT_MAX_MALFORMED_PACKETS: u32 = 16;

/// Default upper bound on how long a reactor tick waits for I/O.
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default application protocol version exchanged during the handshake.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

/// Default number of reliable payloads queued behind a full window.
pub const DEFAULT_SEND_QUEUE_LIMIT: usize = 4096;

// =============================================================================
// RETRANSMISSION TIMING (RFC 6298)
// =============================================================================

/// Initial retransmission timeout before the first RTT sample.
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(100);

/// Maximum retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_millis(60_000);

/// Retransmission backoff multiplier.
pub const RTO_BACKOFF: u32 = 2;
