//! Binary framing for the broker protocol
//!
//! Frame format:
//! - header: 1 byte (`packet_type << 4 | flags`)
//! - remaining length: 1-4 bytes, 7 bits per byte, MSB = continuation
//! - payload: exactly `remaining length` bytes
//!
//! [`FrameDecoder`] is a streaming parser: chunks may split a frame at any
//! byte or carry several frames at once, and frames come out one at a time
//! in arrival order.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Largest value the 4-byte remaining-length field can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Maximum number of bytes in the remaining-length field
pub const MAX_LENGTH_BYTES: usize = 4;

/// Errors raised while framing or parsing packets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed remaining length")]
    MalformedLength,

    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Truncated {0}")]
    Truncated(&'static str),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Unsupported QoS level: {0}")]
    UnsupportedQos(u8),
}

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            other => Err(FrameError::UnknownPacketType(other)),
        }
    }
}

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: PacketType,
    /// Low nibble of the header byte
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(packet_type: PacketType, flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            flags: flags & 0x0F,
            payload: payload.into(),
        }
    }

    /// A frame with an empty body (PINGREQ, PINGRESP, DISCONNECT)
    pub fn empty(packet_type: PacketType) -> Self {
        Self::new(packet_type, 0, Bytes::new())
    }

    /// The first byte on the wire
    pub fn header_byte(&self) -> u8 {
        ((self.packet_type as u8) << 4) | self.flags
    }

    /// Serialize the frame to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(1 + MAX_LENGTH_BYTES + self.payload.len());
        buf.push(self.header_byte());
        encode_remaining_length(self.payload.len(), &mut buf)?;
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Append the variable-length encoding of `len` to `out`
pub fn encode_remaining_length(len: usize, out: &mut Vec<u8>) -> Result<(), FrameError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(FrameError::TooLarge(len));
    }

    let mut value = len;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

/// Decode a remaining-length field from the start of `buf`
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and
/// the number of bytes the field occupied.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, FrameError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_LENGTH_BYTES {
            return Err(FrameError::MalformedLength);
        }
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= MAX_LENGTH_BYTES {
        return Err(FrameError::MalformedLength);
    }
    Ok(None)
}

/// Streaming frame parser
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk received from the socket
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame (used when the connection is replaced)
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Pop the next complete frame, if one is fully buffered
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some(&header) = self.buffer.first() else {
            return Ok(None);
        };

        let packet_type = PacketType::try_from(header >> 4)?;

        let Some((remaining, length_bytes)) = decode_remaining_length(&self.buffer[1..])? else {
            return Ok(None);
        };

        let total = 1 + length_bytes + remaining;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let mut frame_bytes = self.buffer.split_to(total);
        frame_bytes.advance(1 + length_bytes);

        Ok(Some(Frame {
            packet_type,
            flags: header & 0x0F,
            payload: frame_bytes.freeze(),
        }))
    }

    /// Push a chunk and hand every frame it completes to `handle_packet`
    ///
    /// Returns the number of frames dispatched. On a malformed frame the
    /// buffer is left untouched; the caller is expected to drop the
    /// connection.
    pub fn feed<F>(&mut self, chunk: &[u8], mut handle_packet: F) -> Result<usize, FrameError>
    where
        F: FnMut(Frame),
    {
        self.push(chunk);
        let mut dispatched = 0;
        while let Some(frame) = self.next_frame()? {
            handle_packet(frame);
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        encode_remaining_length(len, &mut out).unwrap();
        out
    }

    #[test]
    fn test_remaining_length_roundtrip() {
        for (len, width) in [
            (0, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (MAX_REMAINING_LENGTH, 4),
        ] {
            let bytes = encoded(len);
            assert_eq!(bytes.len(), width, "width for {}", len);
            assert_eq!(decode_remaining_length(&bytes), Ok(Some((len, width))));
        }
    }

    #[test]
    fn test_remaining_length_known_encodings() {
        assert_eq!(encoded(0), vec![0x00]);
        assert_eq!(encoded(127), vec![0x7F]);
        assert_eq!(encoded(128), vec![0x80, 0x01]);
        assert_eq!(encoded(16_383), vec![0xFF, 0x7F]);
        assert_eq!(encoded(16_384), vec![0x80, 0x80, 0x01]);
    }

    #[test]
    fn test_remaining_length_too_large() {
        let mut out = Vec::new();
        assert_eq!(
            encode_remaining_length(MAX_REMAINING_LENGTH + 1, &mut out),
            Err(FrameError::TooLarge(MAX_REMAINING_LENGTH + 1))
        );
    }

    #[test]
    fn test_remaining_length_incomplete() {
        assert_eq!(decode_remaining_length(&[]), Ok(None));
        assert_eq!(decode_remaining_length(&[0x80]), Ok(None));
        assert_eq!(decode_remaining_length(&[0x80, 0x80, 0x80]), Ok(None));
    }

    #[test]
    fn test_remaining_length_five_bytes_is_malformed() {
        assert_eq!(
            decode_remaining_length(&[0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(FrameError::MalformedLength)
        );
        assert_eq!(
            decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(FrameError::MalformedLength)
        );
    }

    #[test]
    fn test_frame_header_byte() {
        let ping = Frame::empty(PacketType::PingReq);
        assert_eq!(ping.to_bytes().unwrap(), vec![0xC0, 0x00]);

        let subscribe = Frame::new(PacketType::Subscribe, 0x02, vec![0u8; 3]);
        assert_eq!(subscribe.header_byte(), 0x82);
    }

    #[test]
    fn test_partial_frame_not_dispatched() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0x30, 0x05, 0x00, 0x01]);
        assert_eq!(decoder.next_frame(), Ok(None));
        assert_eq!(decoder.buffered(), 4);

        decoder.push(&[b'a', 0xAA, 0xBB]);
        let frame = decoder.next_frame().unwrap().expect("frame complete");
        assert_eq!(frame.packet_type, PacketType::Publish);
        assert_eq!(&frame.payload[..], &[0x00, 0x01, b'a', 0xAA, 0xBB]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_header_only_waits_for_length() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0xD0]);
        assert_eq!(decoder.next_frame(), Ok(None));
        decoder.push(&[0x00]);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.packet_type, PacketType::PingResp);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_unknown_packet_type_is_error() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0xF0, 0x00]);
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::UnknownPacketType(15))
        );
    }

    #[test]
    fn test_feed_dispatches_in_order() {
        let mut stream = Vec::new();
        stream.extend(Frame::empty(PacketType::PingResp).to_bytes().unwrap());
        stream.extend(
            Frame::new(PacketType::PubAck, 0, vec![0x00, 0x07])
                .to_bytes()
                .unwrap(),
        );

        let mut decoder = FrameDecoder::new();
        let mut seen = Vec::new();
        let count = decoder
            .feed(&stream, |frame| seen.push(frame.packet_type))
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(seen, vec![PacketType::PingResp, PacketType::PubAck]);
    }

    #[test]
    fn test_coalesced_connacks_dispatch_two_frames() {
        let connack = [0x20, 0x02, 0x00, 0x00];
        let mut chunk = connack.to_vec();
        chunk.extend_from_slice(&connack);

        let mut decoder = FrameDecoder::new();
        let mut lengths = Vec::new();
        let count = tokio_test::assert_ok!(decoder.feed(&chunk, |frame| {
            assert_eq!(frame.packet_type, PacketType::ConnAck);
            lengths.push(frame.to_bytes().map(|bytes| bytes.len()).unwrap_or(0));
        }));

        assert_eq!(count, 2);
        assert_eq!(lengths, vec![4, 4]);
        assert_eq!(decoder.buffered(), 0);
    }
}
