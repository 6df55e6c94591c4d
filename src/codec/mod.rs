//! Wire codec: packet headers, sequence arithmetic, and stream framing.

pub mod assembler;
pub mod packet;
pub mod sequence;

pub use assembler::FrameAssembler;
pub use packet::{PacketCodec, PacketFlags, PacketHeader, PacketType};
pub use sequence::SequenceNumber;
