//! WebSocket frame parsing and serialization
//!
//! This module implements RFC 6455 frame handling:
//! - Resumable decoding: an incomplete frame is reported as "need more data"
//!   and the input buffer is left untouched
//! - Smallest length encoding on output (7-bit, 16-bit or 64-bit)
//! - Masking on output when a key is supplied, unmasking on input
//!
//! Decoded frames are immutable values. Validity of opcodes and fragment
//! sequencing is left to the connection state machine.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::apply_mask;
use crate::{MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

const FIN_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const RSV2_BIT: u8 = 0x20;
const RSV3_BIT: u8 = 0x10;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_BITS: u8 = 0x7F;

/// WebSocket opcode
///
/// Values 0x3-0x7 and 0xB-0xF are reserved. They still decode, as
/// [`OpCode::Reserved`], so the caller can decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Continuation frame
    Continuation,
    /// Text frame
    Text,
    /// Binary frame
    Binary,
    /// Connection close
    Close,
    /// Ping
    Ping,
    /// Pong
    Pong,
    /// Reserved opcode (raw 4-bit value)
    Reserved(u8),
}

impl OpCode {
    /// Parse opcode from the low 4 bits of a byte
    #[inline]
    pub fn from_u8(byte: u8) -> Self {
        match byte & OPCODE_BITS {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }

    /// Wire value of this opcode
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(v) => v & OPCODE_BITS,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.as_u8() >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        self.as_u8() <= 0x2
    }

    /// Check if this opcode is reserved
    #[inline]
    pub fn is_reserved(&self) -> bool {
        matches!(self, OpCode::Reserved(_))
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1 (reserved, round-trips unchanged)
    pub rsv1: bool,
    /// RSV2 (reserved, round-trips unchanged)
    pub rsv2: bool,
    /// RSV3 (reserved, round-trips unchanged)
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Header size in bytes when encoded with the smallest length field
    #[inline]
    pub fn header_size(&self) -> usize {
        let mut size = 2;

        if self.payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
            size += 8;
        } else if self.payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
            size += 2;
        }

        if self.masked {
            size += 4;
        }

        size
    }

    /// Encode the frame header into a buffer
    #[inline]
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = self.opcode.as_u8();
        if self.fin {
            b0 |= FIN_BIT;
        }
        if self.rsv1 {
            b0 |= RSV1_BIT;
        }
        if self.rsv2 {
            b0 |= RSV2_BIT;
        }
        if self.rsv3 {
            b0 |= RSV3_BIT;
        }
        buf.put_u8(b0);

        let mask_bit = if self.masked { MASK_BIT } else { 0x00 };

        if self.payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }

    /// Decode a header from the front of `buf` without consuming it
    ///
    /// Returns the header and its encoded size, or `None` if `buf` does not
    /// hold the whole header yet.
    pub fn decode(buf: &[u8]) -> Result<Option<(FrameHeader, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];
        let masked = b1 & MASK_BIT != 0;
        let len_byte = b1 & LEN_BITS;

        let (payload_len, len_size) = match len_byte {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(len);
                if len >> 63 != 0 {
                    return Err(Error::InvalidFrame("payload length MSB must be 0"));
                }
                (len, 10)
            }
            small => (small as u64, 2),
        };

        let header_size = len_size + if masked { 4 } else { 0 };
        if buf.len() < header_size {
            return Ok(None);
        }

        let mask = if masked {
            Some([
                buf[len_size],
                buf[len_size + 1],
                buf[len_size + 2],
                buf[len_size + 3],
            ])
        } else {
            None
        };

        Ok(Some((
            FrameHeader {
                fin: b0 & FIN_BIT != 0,
                rsv1: b0 & RSV1_BIT != 0,
                rsv2: b0 & RSV2_BIT != 0,
                rsv3: b0 & RSV3_BIT != 0,
                opcode: OpCode::from_u8(b0),
                masked,
                payload_len,
                mask,
            },
            header_size,
        )))
    }
}

/// A complete WebSocket frame (one fragment of a message)
///
/// The payload is stored unmasked. When the frame carries a mask key the
/// key is kept, and encoding writes the masked form back to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    /// Create a new unmasked frame with all reserved bits clear
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>, fin: bool) -> Self {
        let payload = payload.into();
        Self {
            header: FrameHeader {
                fin,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode,
                masked: false,
                payload_len: payload.len() as u64,
                mask: None,
            },
            payload,
        }
    }

    /// Return this frame with the given mask key (or without one)
    pub fn with_mask(mut self, mask: Option<[u8; 4]>) -> Self {
        self.header.masked = mask.is_some();
        self.header.mask = mask;
        self
    }

    /// Return this frame with the given reserved bits
    pub fn with_rsv(mut self, rsv1: bool, rsv2: bool, rsv3: bool) -> Self {
        self.header.rsv1 = rsv1;
        self.header.rsv2 = rsv2;
        self.header.rsv3 = rsv3;
        self
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<String>) -> Self {
        Self::new(OpCode::Text, Bytes::from(data.into()), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data, true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data, true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data, true)
    }

    /// Create a close frame
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        let payload = CloseReason::new(code, reason).to_payload();
        Self::new(OpCode::Close, payload, true)
    }

    /// Create an empty close frame
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Frame header
    #[inline]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Final fragment flag
    #[inline]
    pub fn fin(&self) -> bool {
        self.header.fin
    }

    /// Reserved bits as `(rsv1, rsv2, rsv3)`
    #[inline]
    pub fn rsv(&self) -> (bool, bool, bool) {
        (self.header.rsv1, self.header.rsv2, self.header.rsv3)
    }

    /// Frame opcode
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// Whether the frame is masked on the wire
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.header.masked
    }

    /// Masking key, if any
    #[inline]
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.header.mask
    }

    /// Payload length as carried in the length field
    #[inline]
    pub fn payload_len(&self) -> u64 {
        self.header.payload_len
    }

    /// Unmasked payload
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame, returning the unmasked payload
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Get the payload as a string (for text frames)
    pub fn as_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|_| Error::InvalidUtf8)
    }

    /// Parse close frame payload
    pub fn close_reason(&self) -> Result<Option<CloseReason>> {
        CloseReason::parse(&self.payload)
    }

    /// Encoded size of this frame on the wire
    #[inline]
    pub fn wire_len(&self) -> usize {
        self.header.header_size() + self.payload.len()
    }

    /// Encode this frame, masking the payload if the frame has a key
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.wire_len());
        self.header.encode(buf);

        let start = buf.len();
        buf.put_slice(&self.payload);
        if let Some(mask) = self.header.mask {
            apply_mask(&mut buf[start..], mask);
        }
    }

    /// Encode this frame into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one frame from the front of `buf` without consuming it
    ///
    /// Returns the frame and the number of bytes it occupies, or `None`
    /// when more data is needed.
    pub fn decode(buf: &[u8], max_frame_size: usize) -> Result<Option<(Frame, usize)>> {
        let Some((header, header_size)) = FrameHeader::decode(buf)? else {
            return Ok(None);
        };
        let payload_len = checked_payload_len(&header, max_frame_size)?;

        let total = header_size + payload_len;
        if buf.len() < total {
            return Ok(None);
        }

        let mut payload = BytesMut::from(&buf[header_size..total]);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some((
            Frame {
                header,
                payload: payload.freeze(),
            },
            total,
        )))
    }
}

fn checked_payload_len(header: &FrameHeader, max_frame_size: usize) -> Result<usize> {
    if header.payload_len > max_frame_size as u64 {
        return Err(Error::FrameTooLarge(header.payload_len));
    }
    usize::try_from(header.payload_len).map_err(|_| Error::FrameTooLarge(header.payload_len))
}

/// Incremental frame parser over a growing byte buffer
///
/// Each successful parse consumes exactly one frame's bytes from the
/// buffer. An incomplete frame leaves the buffer as it was.
#[derive(Debug, Clone)]
pub struct FrameParser {
    /// Maximum accepted payload length
    max_frame_size: usize,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Maximum accepted payload length
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Parse a frame from the buffer
    ///
    /// Returns:
    /// - Ok(Some(frame)) if a complete frame was parsed and consumed
    /// - Ok(None) if more data is needed (nothing consumed)
    /// - Err(e) if the header is unacceptable
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        let Some((header, header_size)) = FrameHeader::decode(buf)? else {
            return Ok(None);
        };
        let payload_len = checked_payload_len(&header, self.max_frame_size)?;

        if buf.len() < header_size + payload_len {
            return Ok(None);
        }

        buf.advance(header_size);
        let mut payload = buf.split_to(payload_len);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Frame {
            header,
            payload: payload.freeze(),
        }))
    }
}

/// Encode a frame into a buffer
///
/// For masked frames (client mode) the payload is copied and masked.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let header = FrameHeader {
        fin,
        rsv1: false,
        rsv2: false,
        rsv3: false,
        opcode,
        masked: mask.is_some(),
        payload_len: payload.len() as u64,
        mask,
    };
    buf.reserve(header.header_size() + payload.len());
    header.encode(buf);

    let start = buf.len();
    buf.put_slice(payload);
    if let Some(m) = mask {
        apply_mask(&mut buf[start..], m);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 16 * 1024 * 1024;

    #[test]
    fn test_opcode() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
        assert_eq!(OpCode::from_u8(0x3), OpCode::Reserved(0x3));
        assert_eq!(OpCode::from_u8(0xB), OpCode::Reserved(0xB));
        assert!(OpCode::Reserved(0xB).is_control());
        assert_eq!(OpCode::from_u8(0x8A), OpCode::Pong);
    }

    #[test]
    fn test_parse_small_unmasked() {
        let mut parser = FrameParser::new(MAX);
        let mut buf = BytesMut::from(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'][..]);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert!(frame.fin());
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.payload().as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_small_masked() {
        let mut parser = FrameParser::new(MAX);
        let mask = [0x37, 0xfa, 0x21, 0x3d];

        // RFC 6455 section 5.7 example: masked "Hello"
        let mut buf = BytesMut::from(
            &[
                0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
            ][..],
        );

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload().as_ref(), b"Hello");
        assert_eq!(frame.mask(), Some(mask));
        assert!(frame.is_masked());
    }

    #[test]
    fn test_parse_medium_length() {
        let mut parser = FrameParser::new(MAX);
        let payload = vec![0x42u8; 200];

        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(126);
        buf.put_u16(200);
        buf.put_slice(&payload);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode(), OpCode::Binary);
        assert_eq!(frame.payload().len(), 200);
        assert_eq!(frame.payload_len(), 200);
    }

    #[test]
    fn test_roundtrip_lengths_masked_and_unmasked() {
        let opcodes = [OpCode::Text, OpCode::Binary, OpCode::Continuation];
        for (i, len) in [0usize, 10, 200, 70_000].into_iter().enumerate() {
            let payload: Vec<u8> = (0..len).map(|b| (b % 251) as u8).collect();
            for mask in [None, Some([0xde, 0xad, 0xbe, 0xef])] {
                let original = Frame::new(opcodes[i % 3], payload.clone(), i % 2 == 0)
                    .with_rsv(true, false, true)
                    .with_mask(mask);
                let wire = original.to_bytes();
                assert_eq!(wire.len(), original.wire_len());

                let (decoded, used) = Frame::decode(&wire, MAX).unwrap().unwrap();
                assert_eq!(used, wire.len());
                assert_eq!(decoded, original, "len {} mask {:?}", len, mask);
                assert_eq!(decoded.rsv(), (true, false, true));
            }
        }
    }

    #[test]
    fn test_wire_bytes_stay_masked() {
        let mask = [1, 2, 3, 4];
        let frame = Frame::text("test").with_mask(Some(mask));
        let wire = frame.to_bytes();
        assert_ne!(&wire[6..], b"test");

        let mut payload = wire[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(&payload, b"test");
    }

    #[test]
    fn test_length_field_selection() {
        let cases = [
            (125usize, 2usize, 125u8),
            (126, 4, 126),
            (65_535, 4, 126),
            (65_536, 10, 127),
        ];
        for (len, header, marker) in cases {
            let frame = Frame::binary(vec![0u8; len]);
            let wire = frame.to_bytes();
            assert_eq!(wire.len() - len, header, "len {}", len);
            assert_eq!(wire[1] & 0x7F, marker);
        }
    }

    #[test]
    fn test_incremental_decode_one_byte_at_a_time() {
        let frame = Frame::binary(vec![7u8; 300]).with_mask(Some([9, 8, 7, 6]));
        let wire = frame.to_bytes();

        let mut parser = FrameParser::new(MAX);
        let mut buf = BytesMut::new();
        let mut produced = Vec::new();
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            match parser.parse(&mut buf).unwrap() {
                Some(f) => {
                    assert_eq!(i, wire.len() - 1, "frame produced early");
                    produced.push(f);
                }
                None => assert_eq!(buf.len(), i + 1, "partial frame must not be consumed"),
            }
        }
        assert_eq!(produced, vec![frame]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_consumes_exactly_one_frame() {
        let mut buf = BytesMut::new();
        Frame::text("one").encode(&mut buf);
        Frame::ping("two").encode(&mut buf);
        buf.put_u8(0x81);

        let mut parser = FrameParser::new(MAX);
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap().payload().as_ref(), b"one");
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap().opcode(), OpCode::Ping);
        assert!(parser.parse(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_reserved_opcode_still_decodes() {
        let mut parser = FrameParser::new(MAX);
        let mut buf = BytesMut::from(&[0x83, 0x01, 0xAA][..]);
        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode(), OpCode::Reserved(3));
    }

    #[test]
    fn test_frame_too_large() {
        let mut parser = FrameParser::new(1024);
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(127);
        buf.put_u64(1 << 40);

        assert!(matches!(
            parser.parse(&mut buf),
            Err(Error::FrameTooLarge(len)) if len == 1 << 40
        ));
    }

    #[test]
    fn test_length_msb_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(127);
        buf.put_u64(1 << 63);
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_encode_frame() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"hello", true, None);

        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x05);
        assert_eq!(&buf[2..], b"hello");
    }

    #[test]
    fn test_encode_frame_masked() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"test", true, Some(mask));

        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x84);
        assert_eq!(&buf[2..6], &mask);

        let mut payload = buf[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(&payload, b"test");
    }

    #[test]
    fn test_close_frame_payload() {
        let frame = Frame::close(CloseReason::NORMAL, "done");
        let reason = frame.close_reason().unwrap().unwrap();
        assert_eq!(reason.code, CloseReason::NORMAL);
        assert_eq!(reason.reason, "done");
        assert_eq!(Frame::close_empty().close_reason().unwrap(), None);
    }
}
