//! Session and stream error types.

use thiserror::Error;

use braid_wire::WireError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by session and stream operations.
///
/// The split that matters is fatal versus local. Wire violations, transport
/// failures, and keep-alive misses kill the whole session: every operation
/// afterwards reports the session-level cause. A reset or an expired
/// deadline is confined to its stream, and a deadline failure clears once
/// the deadline is advanced or removed.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer sent bytes that violate the frame format.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The peer violated the protocol above the frame format.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The local stream id space is used up.
    #[error("stream identifiers exhausted")]
    StreamsExhausted,

    /// The peer opened a stream id that is already in use.
    #[error("duplicate stream {0}")]
    DuplicateStream(u32),

    /// The peer sent more data than the advertised receive window allows.
    #[error("receive window exceeded on stream {0}")]
    ReceiveWindowExceeded(u32),

    /// The stream was aborted, locally or by the peer.
    #[error("stream was reset")]
    StreamReset,

    /// Write after the send half was closed.
    #[error("stream closed for writing")]
    StreamClosed,

    /// The transport failed or the peer vanished mid-session.
    #[error("connection reset")]
    ConnectionReset,

    /// The session was shut down.
    #[error("session shutdown")]
    SessionShutdown,

    /// The peer announced it accepts no new streams.
    #[error("remote end is not accepting new streams")]
    RemoteGoAway,

    /// A deadline expired. Retryable once the deadline moves.
    #[error("i/o deadline reached")]
    Timeout,

    /// The peer stopped answering keep-alive probes.
    #[error("keep-alive timeout")]
    KeepAliveTimeout,

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

/// Mapping used by the `AsyncRead`/`AsyncWrite` surface of a stream,
/// which speaks `std::io::Error`.
impl From<Error> for std::io::Error {
    fn from(error: Error) -> Self {
        use std::io::ErrorKind;
        let kind = match &error {
            Error::Timeout | Error::KeepAliveTimeout => ErrorKind::TimedOut,
            Error::StreamReset | Error::ConnectionReset => ErrorKind::ConnectionReset,
            Error::StreamClosed => ErrorKind::BrokenPipe,
            Error::SessionShutdown => ErrorKind::ConnectionAborted,
            Error::RemoteGoAway => ErrorKind::ConnectionRefused,
            _ => ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, error)
    }
}

/// Why a session died. Copyable so it can be fanned out to every stream
/// and replayed by any later operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Local close or go-away.
    Shutdown,
    /// Transport error or peer hangup.
    ConnectionReset,
    /// Wire or protocol violation.
    Protocol,
    /// Keep-alive probe unanswered.
    KeepAlive,
    /// A locally opened stream was never acknowledged.
    OpenTimeout,
}

impl Fault {
    pub(crate) fn to_error(self) -> Error {
        match self {
            Fault::Shutdown | Fault::Protocol => Error::SessionShutdown,
            Fault::ConnectionReset => Error::ConnectionReset,
            Fault::KeepAlive => Error::KeepAliveTimeout,
            Fault::OpenTimeout => Error::Timeout,
        }
    }
}
