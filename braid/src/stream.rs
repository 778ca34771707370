//! The user-facing stream endpoint and its shared state.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::debug;

use braid_wire::Flags;

use crate::buffer::RecvBuffer;
use crate::error::{Error, Fault, Result};
use crate::session::SessionShared;

/// Establishment phase of a stream.
///
/// `Init` streams were opened locally and have sent nothing yet; their
/// first outbound frame carries `SYN` and moves them to `SynSent`, where
/// they stay until the peer's `ACK`. `SynReceived` streams were opened by
/// the peer; their first outbound frame carries the `ACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Init,
    SynSent,
    SynReceived,
    Established,
}

/// Mutable stream state, guarded by the stream's own lock.
pub(crate) struct StreamState {
    pub(crate) phase: Phase,
    /// We emitted `FIN`; no further writes.
    pub(crate) send_closed: bool,
    /// The peer emitted `FIN`; reads drain the buffer then end.
    pub(crate) recv_closed: bool,
    /// `RST` seen or sent; both halves are dead.
    pub(crate) reset: bool,
    /// Set once when the owning session dies.
    pub(crate) fault: Option<Fault>,
    pub(crate) recv: RecvBuffer,
    /// Bytes we may still send before the peer grants more credit.
    pub(crate) send_window: u32,
    pub(crate) read_deadline: Option<Instant>,
    pub(crate) write_deadline: Option<Instant>,
    /// Wakers parked by the `AsyncRead`/`AsyncWrite` poll paths.
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

/// Per-stream shared state. The session registry holds one strong
/// reference until the stream finishes; the user's [`Stream`] handle holds
/// the other. Back-references to the session live only in the handle, so
/// registry and stream never form a cycle.
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    pub(crate) state: Mutex<StreamState>,
    /// Woken on data arrival, FIN, RST, deadline change, session death.
    pub(crate) readable: Notify,
    /// Woken on window credit, RST, close, deadline change, session death.
    pub(crate) writable: Notify,
    /// Woken when the peer acknowledges a locally opened stream.
    pub(crate) established: Notify,
}

impl StreamShared {
    pub(crate) fn new(id: u32, phase: Phase, window: u32) -> Self {
        Self {
            id,
            state: Mutex::new(StreamState {
                phase,
                send_closed: false,
                recv_closed: false,
                reset: false,
                fault: None,
                recv: RecvBuffer::new(window),
                send_window: window,
                read_deadline: None,
                write_deadline: None,
                read_waker: None,
                write_waker: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            established: Notify::new(),
        }
    }

    /// Wakes everything blocked on the receive side, in both the async-fn
    /// and the poll-based paths.
    pub(crate) fn wake_readers(&self) {
        let waker = self.state.lock().read_waker.take();
        self.readable.notify_waiters();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wakes everything blocked on the send side.
    pub(crate) fn wake_writers(&self) {
        let waker = self.state.lock().write_waker.take();
        self.writable.notify_waiters();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn wake_all(&self) {
        self.wake_readers();
        self.wake_writers();
        self.established.notify_waiters();
    }

    /// Marks the stream dead because its session died, discarding any
    /// buffered data, and wakes every waiter.
    pub(crate) fn fail(&self, fault: Fault) {
        {
            let mut state = self.state.lock();
            state.fault = Some(fault);
            state.recv.clear();
        }
        self.wake_all();
    }

    pub(crate) fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.reset || (state.send_closed && state.recv_closed)
    }
}

/// Computes the handshake flags the next outbound frame must carry and
/// advances the phase accordingly.
pub(crate) fn take_handshake_flags(state: &mut StreamState) -> Flags {
    match state.phase {
        Phase::Init => {
            state.phase = Phase::SynSent;
            Flags::SYN
        }
        Phase::SynReceived => {
            state.phase = Phase::Established;
            Flags::ACK
        }
        Phase::SynSent | Phase::Established => Flags::NONE,
    }
}

/// One bidirectional byte stream within a session.
///
/// Both directions are independent: [`close`](Stream::close) ends only the
/// outgoing half, and reading continues until the peer closes its own.
/// Dropping a handle closes the send half if the user did not; use
/// [`reset`](Stream::reset) to abort a stream outright.
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Arc<SessionShared>,
}

enum WriteStep {
    Submit { flags: Flags, len: usize },
    Wait(Option<Instant>),
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, session: Arc<SessionShared>) -> Self {
        Self { shared, session }
    }

    /// The stream's identifier: odd for client-opened streams, even for
    /// server-opened ones.
    pub fn stream_id(&self) -> u32 {
        self.shared.id
    }

    /// Reads up to `buf.len()` bytes.
    ///
    /// Blocks while the stream is alive and empty. Returns `Ok(0)` once
    /// the peer has closed its half and the buffer is drained. Fails with
    /// [`Error::Timeout`] when the read deadline passes, with
    /// [`Error::StreamReset`] after an abort, and with the session-level
    /// cause once the session is gone.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.shared.state.lock();
                if state.reset {
                    return Err(Error::StreamReset);
                }
                if let Some(fault) = state.fault {
                    return Err(fault.to_error());
                }
                if let Some(deadline) = state.read_deadline {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                }
                if !state.recv.is_empty() {
                    let n = state.recv.pop(buf);
                    // No point re-advertising credit once the peer sent FIN.
                    let credit = if state.recv_closed {
                        None
                    } else {
                        state.recv.take_credit()
                    };
                    let flags = match credit {
                        Some(_) => take_handshake_flags(&mut state),
                        None => Flags::NONE,
                    };
                    drop(state);
                    if let Some(delta) = credit {
                        let _ = self.session.submit_window_update(self.shared.id, flags, delta);
                    }
                    return Ok(n);
                }
                if state.recv_closed {
                    return Ok(0);
                }
                state.read_deadline
            };

            wait_woken(notified, deadline).await?;
        }
    }

    /// Writes all of `buf`, fragmenting as window credit allows.
    ///
    /// A single call owns its fragmentation: its frames are never
    /// interleaved with frames of another `write` on the same stream.
    /// Blocks while the send window is empty; fails with
    /// [`Error::Timeout`] when the write deadline passes, with
    /// [`Error::StreamClosed`] after a local close, with
    /// [`Error::StreamReset`] after an abort, and with the session-level
    /// cause once the session is gone.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.shared.state.lock();
                if state.reset {
                    return Err(Error::StreamReset);
                }
                if let Some(fault) = state.fault {
                    return Err(fault.to_error());
                }
                if state.send_closed {
                    return Err(Error::StreamClosed);
                }
                if let Some(deadline) = state.write_deadline {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                }
                if state.send_window > 0 {
                    let len = (buf.len() - written)
                        .min(state.send_window as usize)
                        .min(self.session.config().max_stream_window_size as usize);
                    let flags = take_handshake_flags(&mut state);
                    state.send_window -= len as u32;
                    WriteStep::Submit { flags, len }
                } else {
                    WriteStep::Wait(state.write_deadline)
                }
            };

            match step {
                WriteStep::Submit { flags, len } => {
                    let chunk = Bytes::copy_from_slice(&buf[written..written + len]);
                    self.session.submit_data(self.shared.id, flags, chunk)?;
                    written += len;
                }
                WriteStep::Wait(deadline) => wait_woken(notified, deadline).await?,
            }
        }
        Ok(written)
    }

    /// Half-closes the stream: emits `FIN` behind any queued data and
    /// refuses further writes. Reading continues until the peer closes or
    /// resets. Idempotent.
    pub fn close(&self) -> Result<()> {
        let flags = {
            let mut state = self.shared.state.lock();
            if state.reset || state.send_closed || state.fault.is_some() {
                return Ok(());
            }
            state.send_closed = true;
            take_handshake_flags(&mut state) | Flags::FIN
        };
        self.shared.wake_writers();
        let _ = self.session.submit_close(self.shared.id, flags);
        self.session.retire_if_finished(&self.shared);
        Ok(())
    }

    /// Aborts both directions immediately and tells the peer with `RST`.
    /// Buffered unread data is discarded.
    pub fn reset(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.reset
                || state.fault.is_some()
                || (state.send_closed && state.recv_closed)
            {
                return Ok(());
            }
            state.reset = true;
            state.recv.clear();
        }
        self.shared.wake_all();
        let _ = self.session.submit_reset(self.shared.id);
        self.session.remove_stream(self.shared.id);
        debug!(stream_id = self.shared.id, "stream reset locally");
        Ok(())
    }

    /// Sets the deadline for blocked and future reads. `None` clears it.
    /// Deadlines bind the inherent [`read`](Stream::read); the `AsyncRead`
    /// path has no deadline concept and ignores them.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.state.lock().read_deadline = deadline;
        self.shared.wake_readers();
    }

    /// Sets the deadline for blocked and future writes. `None` clears it.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.state.lock().write_deadline = deadline;
        self.shared.wake_writers();
    }

    /// Sets both deadlines at once.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock();
        if state.reset {
            return Poll::Ready(Err(Error::StreamReset.into()));
        }
        if let Some(fault) = state.fault {
            return Poll::Ready(Err(fault.to_error().into()));
        }
        if !state.recv.is_empty() {
            let unfilled = buf.initialize_unfilled();
            let n = state.recv.pop(unfilled);
            let credit = if state.recv_closed {
                None
            } else {
                state.recv.take_credit()
            };
            let flags = match credit {
                Some(_) => take_handshake_flags(&mut state),
                None => Flags::NONE,
            };
            drop(state);
            buf.advance(n);
            if let Some(delta) = credit {
                let _ = this.session.submit_window_update(this.shared.id, flags, delta);
            }
            return Poll::Ready(Ok(()));
        }
        if state.recv_closed {
            // End of stream: return without filling anything.
            return Poll::Ready(Ok(()));
        }
        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let step = {
            let mut state = this.shared.state.lock();
            if state.reset {
                return Poll::Ready(Err(Error::StreamReset.into()));
            }
            if let Some(fault) = state.fault {
                return Poll::Ready(Err(fault.to_error().into()));
            }
            if state.send_closed {
                return Poll::Ready(Err(Error::StreamClosed.into()));
            }
            if state.send_window > 0 {
                let len = buf
                    .len()
                    .min(state.send_window as usize)
                    .min(this.session.config().max_stream_window_size as usize);
                let flags = take_handshake_flags(&mut state);
                state.send_window -= len as u32;
                Some((flags, len))
            } else {
                state.write_waker = Some(cx.waker().clone());
                None
            }
        };
        match step {
            Some((flags, len)) => {
                let chunk = Bytes::copy_from_slice(&buf[..len]);
                match this.session.submit_data(this.shared.id, flags, chunk) {
                    Ok(()) => Poll::Ready(Ok(len)),
                    Err(error) => Poll::Ready(Err(error.into())),
                }
            }
            None => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // A written chunk is already committed to the send scheduler, and
        // the scheduler owns transport flushing.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.get_mut().close().map_err(Into::into))
    }
}

/// Parks until the notifier fires or the deadline passes.
async fn wait_woken(
    notified: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>,
    deadline: Option<Instant>,
) -> Result<()> {
    match deadline {
        None => {
            notified.await;
            Ok(())
        }
        Some(deadline) => {
            tokio::select! {
                _ = notified => Ok(()),
                _ = time::sleep_until(deadline) => Err(Error::Timeout),
            }
        }
    }
}
