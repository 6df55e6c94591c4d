//! Packet encoding and decoding.
//!
//! Wire format (network byte order):
//!
//! ```text
//! +--------+--------+--------+--------+----------------+----------------+-------------+
//! | Magic  | Version| Type   | Flags  | Sequence       | Payload Length | Payload     |
//! | 1 byte | 1 byte | 1 byte | 1 byte | 4 bytes (BE32) | 4 bytes (BE32) | N bytes     |
//! +--------+--------+--------+--------+----------------+----------------+-------------+
//! ```
//!
//! Magic and version together form the 16-bit magic/version tag. Ack,
//! KeepAlive and Disconnect carry no payload; Handshake and HandshakeAck
//! carry the 4-byte application protocol version.

use bytes::{BufMut, Bytes, BytesMut};

use super::sequence::SequenceNumber;
use crate::core::TransportConfig;
use crate::core::constants::{
    DATA_FLAGS_MASK, FLAG_RELIABLE, HANDSHAKE_PAYLOAD_SIZE, HEADER_SIZE, PACKET_MAGIC, WIRE_VERSION,
};
use crate::core::error::{DecodeError, DisconnectReason, EncodeError};

/// Packet type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Connection request carrying the initiator's protocol version.
    Handshake = 0,
    /// Connection accept carrying the responder's protocol version.
    HandshakeAck = 1,
    /// Application payload.
    Data = 2,
    /// Acknowledges one reliable Data packet.
    Ack = 3,
    /// Liveness probe.
    KeepAlive = 4,
    /// Connection teardown; flags carry the reason code.
    Disconnect = 5,
}

impl PacketType {
    /// Parse packet type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Handshake),
            1 => Some(Self::HandshakeAck),
            2 => Some(Self::Data),
            3 => Some(Self::Ack),
            4 => Some(Self::KeepAlive),
            5 => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// Convert packet type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether packets of this type may carry a payload.
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Handshake | Self::HandshakeAck | Self::Data)
    }
}

/// Packet flags byte.
///
/// For Data packets bit 0 selects the reliable channel and the remaining
/// bits are reserved. For Disconnect packets the whole byte is the reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Data packet on the reliable channel.
    pub const RELIABLE: Self = Self(FLAG_RELIABLE);

    /// Create flags from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if the reliable bit is set.
    pub fn is_reliable(self) -> bool {
        self.0 & FLAG_RELIABLE != 0
    }

    /// Flags carrying a disconnect reason code.
    pub fn disconnect(reason: DisconnectReason) -> Self {
        Self(reason.code())
    }

    /// Check that the flags are legal for `packet_type`.
    pub fn is_valid_for(self, packet_type: PacketType) -> bool {
        match packet_type {
            PacketType::Data => self.0 & !DATA_FLAGS_MASK == 0,
            PacketType::Disconnect => true,
            _ => self.0 == 0,
        }
    }
}

/// Fixed 12-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type.
    pub packet_type: PacketType,
    /// Flags byte.
    pub flags: PacketFlags,
    /// Sequence number (meaning depends on the packet type).
    pub sequence: SequenceNumber,
    /// Length of the payload that follows the header.
    pub payload_len: u32,
}

impl PacketHeader {
    /// Create a header with no flags.
    pub fn new(packet_type: PacketType, sequence: SequenceNumber, payload_len: u32) -> Self {
        Self {
            packet_type,
            flags: PacketFlags::NONE,
            sequence,
            payload_len,
        }
    }

    /// Handshake header; `attempt` numbers the transmission.
    pub fn handshake(attempt: u32) -> Self {
        Self::new(
            PacketType::Handshake,
            SequenceNumber::new(attempt),
            HANDSHAKE_PAYLOAD_SIZE as u32,
        )
    }

    /// Handshake acknowledgment header echoing the handshake's sequence.
    pub fn handshake_ack(sequence: SequenceNumber) -> Self {
        Self::new(PacketType::HandshakeAck, sequence, HANDSHAKE_PAYLOAD_SIZE as u32)
    }

    /// Data header.
    pub fn data(sequence: SequenceNumber, reliable: bool, payload_len: u32) -> Self {
        Self {
            packet_type: PacketType::Data,
            flags: if reliable {
                PacketFlags::RELIABLE
            } else {
                PacketFlags::NONE
            },
            sequence,
            payload_len,
        }
    }

    /// Ack header for reliable sequence `sequence`.
    pub fn ack(sequence: SequenceNumber) -> Self {
        Self::new(PacketType::Ack, sequence, 0)
    }

    /// Keep-alive header.
    pub fn keep_alive() -> Self {
        Self::new(PacketType::KeepAlive, SequenceNumber::ZERO, 0)
    }

    /// Disconnect header carrying `reason`.
    pub fn disconnect(reason: DisconnectReason) -> Self {
        Self {
            packet_type: PacketType::Disconnect,
            flags: PacketFlags::disconnect(reason),
            sequence: SequenceNumber::ZERO,
            payload_len: 0,
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = PACKET_MAGIC;
        buf[1] = WIRE_VERSION;
        buf[2] = self.packet_type.as_byte();
        buf[3] = self.flags.as_byte();
        buf[4..8].copy_from_slice(&self.sequence.get().to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Parse and validate the fixed header fields.
    ///
    /// Does not check the payload length against the buffer; see
    /// [`PacketCodec::decode`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                needed: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PACKET_MAGIC {
            return Err(DecodeError::BadMagic(bytes[0]));
        }
        if bytes[1] != WIRE_VERSION {
            return Err(DecodeError::UnsupportedVersion(bytes[1]));
        }

        let packet_type =
            PacketType::from_byte(bytes[2]).ok_or(DecodeError::Malformed("unknown packet type"))?;

        let flags = PacketFlags::from_byte(bytes[3]);
        if !flags.is_valid_for(packet_type) {
            return Err(DecodeError::Malformed("reserved flag bits set"));
        }

        let sequence = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let payload_len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        Ok(Self {
            packet_type,
            flags,
            sequence: SequenceNumber::new(sequence),
            payload_len,
        })
    }

    /// Total encoded size of the packet this header describes.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }
}

/// Encoder/decoder bound to a frame size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCodec {
    max_payload: usize,
}

impl PacketCodec {
    /// Create a codec for frames of at most `max_frame_size` bytes.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_payload: max_frame_size.saturating_sub(HEADER_SIZE),
        }
    }

    /// Create a codec from the transport configuration.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.max_frame_size)
    }

    /// Largest payload accepted by this codec.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    /// Check a payload against the frame limit.
    pub fn check_payload(&self, len: usize) -> Result<(), EncodeError> {
        if len > self.max_payload {
            return Err(EncodeError::PayloadTooLarge {
                size: len,
                max: self.max_payload,
            });
        }
        Ok(())
    }

    /// Encode `header` followed by `payload`.
    ///
    /// The header's length field is taken from `payload`.
    pub fn encode(&self, header: &PacketHeader, payload: &[u8]) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        self.encode_into(header, payload, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode into an existing buffer.
    pub fn encode_into(
        &self,
        header: &PacketHeader,
        payload: &[u8],
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        self.check_payload(payload.len())?;

        let header = PacketHeader {
            payload_len: payload.len() as u32,
            ..*header
        };
        buf.reserve(HEADER_SIZE + payload.len());
        buf.put_slice(&header.to_bytes());
        buf.put_slice(payload);
        Ok(())
    }

    /// Decode one complete packet occupying all of `buf`.
    ///
    /// The returned payload borrows from `buf`.
    pub fn decode<'a>(&self, buf: &'a [u8]) -> Result<(PacketHeader, &'a [u8]), DecodeError> {
        let header = self.parse_header(buf)?;
        let total = header.frame_len();

        if buf.len() < total {
            return Err(DecodeError::Truncated {
                needed: total,
                actual: buf.len(),
            });
        }
        if buf.len() > total {
            return Err(DecodeError::Malformed("trailing bytes after payload"));
        }

        Ok((header, &buf[HEADER_SIZE..total]))
    }

    /// Length of the first frame in a stream buffer.
    ///
    /// Returns `Ok(None)` until the buffer holds a whole frame.
    pub fn peek_frame_len(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = self.parse_header(buf)?;
        let total = header.frame_len();
        if buf.len() < total {
            Ok(None)
        } else {
            Ok(Some(total))
        }
    }

    /// Header validation shared by datagram and stream decoding.
    fn parse_header(&self, buf: &[u8]) -> Result<PacketHeader, DecodeError> {
        let header = PacketHeader::from_bytes(buf)?;
        let len = header.payload_len as usize;

        if len > self.max_payload {
            return Err(DecodeError::Malformed("payload length exceeds frame limit"));
        }
        match header.packet_type {
            PacketType::Handshake | PacketType::HandshakeAck if len != HANDSHAKE_PAYLOAD_SIZE => {
                Err(DecodeError::Malformed("handshake payload must be 4 bytes"))
            }
            t if !t.carries_payload() && len != 0 => {
                Err(DecodeError::Malformed("control packet carries a payload"))
            }
            _ => Ok(header),
        }
    }
}

/// Encode a protocol version as a handshake payload.
pub fn handshake_payload(protocol_version: u32) -> [u8; HANDSHAKE_PAYLOAD_SIZE] {
    protocol_version.to_be_bytes()
}

/// Read the protocol version out of a decoded handshake payload.
pub fn parse_handshake_payload(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; HANDSHAKE_PAYLOAD_SIZE] = payload.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PacketCodec {
        PacketCodec::new(1400)
    }

    #[test]
    fn test_packet_type_roundtrip() {
        for t in [
            PacketType::Handshake,
            PacketType::HandshakeAck,
            PacketType::Data,
            PacketType::Ack,
            PacketType::KeepAlive,
            PacketType::Disconnect,
        ] {
            assert_eq!(PacketType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(PacketType::from_byte(6), None);
        assert_eq!(PacketType::from_byte(0xFF), None);
    }

    #[test]
    fn test_wire_layout() {
        let header = PacketHeader::data(SequenceNumber::new(0x0102_0304), true, 3);
        let bytes = codec().encode(&header, b"abc").unwrap();

        assert_eq!(hex::encode(&bytes), "a50102010102030400000003616263");
    }

    #[test]
    fn test_decode_known_vector() {
        let bytes = hex::decode("a50103000000000700000000").unwrap();
        let (header, payload) = codec().decode(&bytes).unwrap();

        assert_eq!(header.packet_type, PacketType::Ack);
        assert_eq!(header.sequence, SequenceNumber::new(7));
        assert!(payload.is_empty());
    }

    #[test]
    fn test_roundtrip_data() {
        let header = PacketHeader::data(SequenceNumber::new(42), false, 5);
        let bytes = codec().encode(&header, b"hello").unwrap();
        let (decoded, payload) = codec().decode(&bytes).unwrap();

        assert_eq!(decoded, header);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_roundtrip_disconnect_reason() {
        let header = PacketHeader::disconnect(DisconnectReason::Timeout);
        let bytes = codec().encode(&header, &[]).unwrap();
        let (decoded, _) = codec().decode(&bytes).unwrap();

        assert_eq!(decoded.flags.as_byte(), DisconnectReason::Timeout.code());
    }

    #[test]
    fn test_encode_payload_too_large() {
        let codec = PacketCodec::new(HEADER_SIZE + 4);
        let header = PacketHeader::data(SequenceNumber::ZERO, false, 5);
        assert_eq!(
            codec.encode(&header, b"12345"),
            Err(EncodeError::PayloadTooLarge { size: 5, max: 4 })
        );
    }

    #[test]
    fn test_decode_too_short() {
        let data = [PACKET_MAGIC, WIRE_VERSION, 2];
        assert!(matches!(
            codec().decode(&data),
            Err(DecodeError::Truncated { needed: HEADER_SIZE, actual: 3 })
        ));
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut bytes = codec()
            .encode(&PacketHeader::keep_alive(), &[])
            .unwrap()
            .to_vec();
        bytes[0] = 0x00;
        assert_eq!(codec().decode(&bytes), Err(DecodeError::BadMagic(0x00)));
    }

    #[test]
    fn test_decode_unsupported_version() {
        let mut bytes = codec()
            .encode(&PacketHeader::keep_alive(), &[])
            .unwrap()
            .to_vec();
        bytes[1] = 0x09;
        assert_eq!(codec().decode(&bytes), Err(DecodeError::UnsupportedVersion(0x09)));
    }

    #[test]
    fn test_decode_huge_length_field() {
        // 50-byte buffer whose length field claims 0xFFFFFFFF.
        let mut bytes = vec![0u8; 50];
        bytes[..HEADER_SIZE]
            .copy_from_slice(&PacketHeader::data(SequenceNumber::ZERO, false, 0).to_bytes());
        bytes[8..12].copy_from_slice(&u32::MAX.to_be_bytes());

        let err = codec().decode(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_) | DecodeError::Truncated { .. }));
    }

    #[test]
    fn test_decode_length_longer_than_buffer() {
        let bytes = codec()
            .encode(&PacketHeader::data(SequenceNumber::ZERO, true, 0), b"payload")
            .unwrap();
        let cut = &bytes[..bytes.len() - 2];
        assert!(matches!(
            codec().decode(cut),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut bytes = codec()
            .encode(&PacketHeader::keep_alive(), &[])
            .unwrap()
            .to_vec();
        bytes.push(0);
        assert!(matches!(codec().decode(&bytes), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_reserved_flags() {
        let mut bytes = codec()
            .encode(&PacketHeader::data(SequenceNumber::ZERO, false, 1), b"x")
            .unwrap()
            .to_vec();
        bytes[3] = 0x80;
        assert!(matches!(codec().decode(&bytes), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_control_with_payload() {
        let mut bytes = PacketHeader::ack(SequenceNumber::new(1)).to_bytes().to_vec();
        bytes[8..12].copy_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(b"xx");
        assert!(matches!(codec().decode(&bytes), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_handshake_payload() {
        let header = PacketHeader::handshake(1);
        let bytes = codec().encode(&header, &handshake_payload(7)).unwrap();
        let (decoded, payload) = codec().decode(&bytes).unwrap();

        assert_eq!(decoded.packet_type, PacketType::Handshake);
        assert_eq!(parse_handshake_payload(payload), Some(7));
        assert_eq!(parse_handshake_payload(b"abc"), None);
    }

    #[test]
    fn test_peek_frame_len() {
        let bytes = codec()
            .encode(&PacketHeader::data(SequenceNumber::ZERO, true, 0), b"0123456789")
            .unwrap();

        assert_eq!(codec().peek_frame_len(&bytes[..4]), Ok(None));
        assert_eq!(codec().peek_frame_len(&bytes[..15]), Ok(None));
        assert_eq!(codec().peek_frame_len(&bytes), Ok(Some(bytes.len())));
    }
}
