//! Wire-level decode errors.

use thiserror::Error;

use crate::frame::FrameType;

/// Errors raised while decoding a frame off the wire.
///
/// All of these are protocol violations: the peer sent bytes that no
/// conforming implementation produces, so the session that observes one
/// is expected to terminate.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The version byte was not the supported protocol version.
    #[error("unsupported protocol version {0}")]
    InvalidVersion(u8),

    /// The type byte named no known frame type.
    #[error("unknown frame type {0}")]
    InvalidFrameType(u8),

    /// The length field of a header-only frame was outside its domain
    /// (a go-away reason nobody defines).
    #[error("invalid length field {0} for frame type {1:?}")]
    InvalidLength(u32, FrameType),

    /// A `DATA` frame announced a payload larger than the receiver's
    /// configured limit.
    #[error("data frame of {length} bytes exceeds the {max} byte limit")]
    OversizedFrame { length: u32, max: u32 },
}
