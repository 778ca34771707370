//! Receive loop: the session's sole transport reader.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, trace, warn};

use braid_wire::{Flags, FrameType, GoAwayCode, Header, HEADER_LEN};

use crate::error::{Error, Fault, Result};
use crate::session::{ping, SessionShared};
use crate::stream::Phase;

/// Reads frames off the transport and dispatches them until the transport
/// fails, the peer violates the protocol, or the session shuts down.
pub(crate) async fn recv_loop<R>(mut reader: R, shared: Arc<SessionShared>)
where
    R: AsyncRead + Unpin,
{
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut header_buf = [0u8; HEADER_LEN];

    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            read = reader.read_exact(&mut header_buf) => read,
        };
        if let Err(error) = read {
            transport_lost(&shared, error);
            return;
        }

        let header = match Header::decode(&header_buf) {
            Ok(header) => header,
            Err(error) => {
                error!(%error, "malformed frame header, dropping session");
                fatal(&shared);
                return;
            }
        };
        trace!(
            frame_type = ?header.frame_type,
            flags = ?header.flags,
            stream_id = header.stream_id,
            length = header.length,
            "frame received"
        );

        let dispatched = match header.frame_type {
            FrameType::Data => {
                if let Err(error) =
                    header.check_data_length(shared.config().max_stream_window_size)
                {
                    Err(Error::Wire(error))
                } else {
                    let body = tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => return,
                        body = read_body(&mut reader, header.length as usize) => body,
                    };
                    match body {
                        Ok(body) => handle_stream_frame(&shared, header, Some(body)),
                        Err(error) => {
                            transport_lost(&shared, error);
                            return;
                        }
                    }
                }
            }
            FrameType::WindowUpdate => handle_stream_frame(&shared, header, None),
            FrameType::Ping => handle_ping(&shared, header),
            FrameType::GoAway => handle_go_away(&shared, header),
        };
        if let Err(error) = dispatched {
            error!(%error, "protocol violation, dropping session");
            fatal(&shared);
            return;
        }
    }
}

/// Best-effort go-away, then session death. The send loop flushes queued
/// control frames on its way out, so the peer usually learns why.
fn fatal(shared: &SessionShared) {
    let _ = shared.submit_go_away(GoAwayCode::ProtocolError, None);
    shared.shutdown(Fault::Protocol);
}

fn transport_lost(shared: &SessionShared, error: io::Error) {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        debug!("transport closed by peer");
    } else {
        warn!(%error, "transport read failed");
    }
    shared.shutdown(Fault::ConnectionReset);
}

async fn read_body<R>(reader: &mut R, len: usize) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(Bytes::new());
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Applies a `DATA` (`body` present) or `WINDOW_UPDATE` (`body` absent)
/// frame. The flag semantics are shared: either frame type may open,
/// acknowledge, half-close, or reset its stream.
fn handle_stream_frame(
    shared: &Arc<SessionShared>,
    header: Header,
    body: Option<Bytes>,
) -> Result<()> {
    let flags = header.flags;
    if flags.contains(Flags::SYN) {
        shared.incoming_stream(header.stream_id)?;
    }

    let Some(stream) = shared.lookup_stream(header.stream_id) else {
        // Unknown stream: the payload is already off the wire, so this is
        // a stateless reject. Never answer a reset with a reset.
        if !flags.contains(Flags::RST) {
            trace!(stream_id = header.stream_id, "frame for unknown stream, resetting");
            let _ = shared.submit_reset(header.stream_id);
        }
        return Ok(());
    };

    let mut acknowledged = false;
    let finished = {
        let mut state = stream.state.lock();
        if flags.contains(Flags::ACK) && state.phase == Phase::SynSent {
            state.phase = Phase::Established;
            acknowledged = true;
        }
        match body {
            Some(data) => {
                if !data.is_empty() {
                    let len = data.len();
                    if state.recv.push(data).is_err() {
                        return Err(Error::ReceiveWindowExceeded(header.stream_id));
                    }
                    trace!(stream_id = stream.id, bytes = len, "stream data buffered");
                }
            }
            None => {
                state.send_window = state.send_window.saturating_add(header.length);
            }
        }
        if flags.contains(Flags::FIN) {
            state.recv_closed = true;
        }
        if flags.contains(Flags::RST) {
            state.reset = true;
            state.recv.clear();
        }
        state.reset || (state.send_closed && state.recv_closed)
    };

    if flags.contains(Flags::RST) {
        debug!(stream_id = stream.id, "stream reset by peer");
        stream.wake_all();
    } else {
        stream.wake_readers();
        stream.wake_writers();
        if acknowledged {
            stream.established.notify_waiters();
        }
    }
    if finished {
        shared.remove_stream(stream.id);
    }
    Ok(())
}

fn handle_ping(shared: &Arc<SessionShared>, header: Header) -> Result<()> {
    let nonce = header.length;
    if header.flags.contains(Flags::SYN) {
        let _ = shared.submit_ping(Flags::ACK, nonce);
    } else if header.flags.contains(Flags::ACK) {
        ping::complete(shared, nonce);
    }
    Ok(())
}

fn handle_go_away(shared: &Arc<SessionShared>, header: Header) -> Result<()> {
    match GoAwayCode::from_wire(header.length).map_err(Error::Wire)? {
        GoAwayCode::Normal => {
            debug!("peer is going away");
            shared.set_remote_goaway();
            Ok(())
        }
        GoAwayCode::ProtocolError => Err(Error::Protocol("peer reported a protocol error")),
        GoAwayCode::InternalError => Err(Error::Protocol("peer reported an internal error")),
    }
}
