//! Frame header codec.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// The single supported protocol version. Any other value on the wire is
/// a fatal error.
pub const PROTOCOL_VERSION: u8 = 0;

/// Encoded size of a frame header in bytes.
pub const HEADER_LEN: usize = 12;

/// Frame types.
///
/// Only `Data` carries a payload. For the other types the header's length
/// field is reinterpreted: window delta for `WindowUpdate`, opaque nonce
/// for `Ping`, numeric reason for `GoAway`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    WindowUpdate = 1,
    Ping = 2,
    GoAway = 3,
}

impl FrameType {
    fn from_wire(raw: u8) -> Result<Self, WireError> {
        match raw {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::WindowUpdate),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::GoAway),
            other => Err(WireError::InvalidFrameType(other)),
        }
    }
}

/// Header flag bitfield.
///
/// `SYN` opens a stream, `ACK` accepts one (or answers a ping), `FIN`
/// half-closes the sender's direction, `RST` aborts both directions.
/// Flags ride on `Data` and `WindowUpdate` frames alike; a header-only
/// control frame is a valid carrier for any of them.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const SYN: Flags = Flags(0x1);
    pub const ACK: Flags = Flags(0x2);
    pub const FIN: Flags = Flags(0x4);
    pub const RST: Flags = Flags(0x8);

    /// Reconstructs a flag set from its wire representation. Unknown bits
    /// are preserved but have no meaning to this implementation.
    pub fn from_bits(bits: u16) -> Flags {
        Flags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = Vec::new();
        if self.contains(Flags::SYN) {
            names.push("SYN");
        }
        if self.contains(Flags::ACK) {
            names.push("ACK");
        }
        if self.contains(Flags::FIN) {
            names.push("FIN");
        }
        if self.contains(Flags::RST) {
            names.push("RST");
        }
        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Reasons carried by a `GoAway` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GoAwayCode {
    /// Orderly shutdown; no fault on either side.
    Normal = 0,
    /// The sender observed a protocol violation.
    ProtocolError = 1,
    /// The sender hit an internal failure.
    InternalError = 2,
}

impl GoAwayCode {
    pub fn from_wire(raw: u32) -> Result<Self, WireError> {
        match raw {
            0 => Ok(GoAwayCode::Normal),
            1 => Ok(GoAwayCode::ProtocolError),
            2 => Ok(GoAwayCode::InternalError),
            other => Err(WireError::InvalidLength(other, FrameType::GoAway)),
        }
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub frame_type: FrameType,
    pub flags: Flags,
    pub stream_id: u32,
    pub length: u32,
}

impl Header {
    pub fn new(frame_type: FrameType, flags: Flags, stream_id: u32, length: u32) -> Header {
        Header {
            frame_type,
            flags,
            stream_id,
            length,
        }
    }

    /// Header for a `Data` frame carrying `length` payload bytes.
    pub fn data(stream_id: u32, flags: Flags, length: u32) -> Header {
        Header::new(FrameType::Data, flags, stream_id, length)
    }

    /// Header for a `WindowUpdate` granting `delta` bytes of credit.
    pub fn window_update(stream_id: u32, flags: Flags, delta: u32) -> Header {
        Header::new(FrameType::WindowUpdate, flags, stream_id, delta)
    }

    /// Header for a `Ping` carrying an opaque nonce. Pings address the
    /// session, so the stream id is zero.
    pub fn ping(flags: Flags, nonce: u32) -> Header {
        Header::new(FrameType::Ping, flags, 0, nonce)
    }

    /// Header for a `GoAway` with the given reason.
    pub fn go_away(code: GoAwayCode) -> Header {
        Header::new(FrameType::GoAway, Flags::NONE, 0, code as u32)
    }

    /// Decodes and validates a header from its 12-byte wire form.
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Header, WireError> {
        let mut buf = &raw[..];
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(WireError::InvalidVersion(version));
        }
        let frame_type = FrameType::from_wire(buf.get_u8())?;
        let flags = Flags::from_bits(buf.get_u16());
        let stream_id = buf.get_u32();
        let length = buf.get_u32();
        Ok(Header {
            frame_type,
            flags,
            stream_id,
            length,
        })
    }

    /// Appends the 12-byte wire form to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(self.frame_type as u8);
        dst.put_u16(self.flags.bits());
        dst.put_u32(self.stream_id);
        dst.put_u32(self.length);
    }

    /// Rejects `Data` headers whose announced payload exceeds `max`.
    pub fn check_data_length(&self, max: u32) -> Result<(), WireError> {
        if self.frame_type == FrameType::Data && self.length > max {
            return Err(WireError::OversizedFrame {
                length: self.length,
                max,
            });
        }
        Ok(())
    }
}

/// A full frame: header plus payload. The payload is empty for every type
/// except `Data`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    /// A header-only frame.
    pub fn header_only(header: Header) -> Frame {
        Frame {
            header,
            body: Bytes::new(),
        }
    }

    /// A `Data` frame. The header's length field must match the body.
    pub fn with_body(header: Header, body: Bytes) -> Frame {
        debug_assert_eq!(header.length as usize, body.len());
        Frame { header, body }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Appends header and payload to `dst` as one contiguous unit.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        self.header.encode_into(dst);
        dst.put_slice(&self.body);
    }
}
