//! Stream multiplexer over a single reliable transport.
//!
//! `braid` layers many independent, flow-controlled, bidirectional byte
//! streams over one ordered byte pipe: a TCP connection, a TLS session, a
//! unix socket, an in-memory duplex, anything implementing tokio's
//! `AsyncRead + AsyncWrite`. The protocol is symmetric: once a session is
//! up, either peer may open streams, transfer arbitrary bytes, close each
//! direction independently, and shut the session down cleanly.
//!
//! The two ends differ only in stream id parity. The side created with
//! [`Session::client`] allocates odd ids, [`Session::server`] even ones.
//!
//! ```no_run
//! use braid::{Config, Session};
//!
//! # async fn run() -> braid::Result<()> {
//! // Any AsyncRead + AsyncWrite transport works; a TCP stream in
//! // practice, an in-memory pipe here.
//! let (socket, _peer) = tokio::io::duplex(64 * 1024);
//! let session = Session::client(socket, Config::default())?;
//!
//! let stream = session.open()?;
//! stream.write(b"hello").await?;
//! stream.close()?;
//!
//! let peer_stream = session.accept_stream().await?;
//! let mut buf = [0u8; 64];
//! let n = peer_stream.read(&mut buf).await?;
//! # let _ = n;
//! # Ok(())
//! # }
//! ```
//!
//! Streams expose explicit `read`/`write`/deadline methods and also
//! implement tokio's `AsyncRead`/`AsyncWrite`, so they slot straight into
//! `tokio::io` utilities.
//!
//! Each session runs three background tasks: a receive loop (sole reader
//! of the transport), a send loop (sole writer, control frames first), and
//! an optional keep-alive prober. Back-pressure is credit-based: a sender
//! blocks once it exhausts the receive window its peer advertised, never
//! on the shared transport directly. The wire format lives in
//! [`braid_wire`], re-exported as [`wire`].

#![forbid(unsafe_code)]

mod buffer;
mod config;
mod error;
mod session;
mod stream;

pub use braid_wire as wire;

pub use config::Config;
pub use error::{Error, Result};
pub use session::Session;
pub use stream::Stream;
