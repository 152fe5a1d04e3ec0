//! Wire protocol definitions
//!
//! Binary framing and packets for the broker connection, plus the JSON
//! envelopes exchanged between peers inside PUBLISH bodies.

mod envelope;
mod frame;
mod packet;

pub use envelope::{Envelope, Message, PeerId, RemoteMicReason, SignalKind};
pub use frame::{
    decode_remaining_length, encode_remaining_length, Frame, FrameDecoder, FrameError, PacketType,
    MAX_LENGTH_BYTES, MAX_REMAINING_LENGTH,
};
pub use packet::{
    ConnectOptions, Packet, Publish, QoS, CONNACK_ACCEPTED, PROTOCOL_LEVEL, PROTOCOL_NAME,
    SUBACK_FAILURE,
};
