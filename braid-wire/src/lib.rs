//! Wire format for the braid stream multiplexer.
//!
//! Every unit on the wire is a frame: a fixed 12-byte big-endian header
//! followed, for `DATA` frames only, by a payload of `length` bytes. The
//! header layout is:
//!
//! ```text
//! byte 0      version   (always 0)
//! byte 1      type      (0 DATA, 1 WINDOW_UPDATE, 2 PING, 3 GO_AWAY)
//! bytes 2-3   flags     (0x1 SYN, 0x2 ACK, 0x4 FIN, 0x8 RST)
//! bytes 4-7   stream id (0 addresses the session itself)
//! bytes 8-11  length    (payload bytes / window delta / nonce / reason)
//! ```
//!
//! This crate is pure: it encodes and decodes headers and carries no I/O,
//! no tasks, and no session state. The session engine lives in `braid`.

#![forbid(unsafe_code)]

mod error;
mod frame;

pub use error::WireError;
pub use frame::{Flags, Frame, FrameType, GoAwayCode, Header, HEADER_LEN, PROTOCOL_VERSION};
