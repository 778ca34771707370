//! Session facade, stream registry, and shared session state.

mod ping;
mod recv;
mod send;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, error, trace, warn};

use braid_wire::{Flags, Frame, GoAwayCode, Header};

use crate::config::Config;
use crate::error::{Error, Fault, Result};
use crate::stream::{Phase, Stream, StreamShared};

use ping::PendingPing;
use send::SendItem;

/// Which end of the session this is. The only asymmetry in the protocol
/// is stream id parity: clients allocate odd ids, servers even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

/// Mutable session state, guarded by the session lock. The lock is held
/// for registry and flag updates only, never across I/O or a queue
/// submission.
pub(crate) struct SessionState {
    streams: HashMap<u32, Arc<StreamShared>>,
    next_stream_id: u32,
    pings: HashMap<u32, PendingPing>,
    local_goaway: bool,
    remote_goaway: bool,
    fault: Option<Fault>,
    /// Feeds the accept queue. Dropped at shutdown so acceptors wake.
    accept_tx: Option<mpsc::Sender<Arc<StreamShared>>>,
}

/// State shared by the facade, every stream handle, and the worker tasks.
pub(crate) struct SessionShared {
    config: Config,
    side: Side,
    state: Mutex<SessionState>,
    /// Control frames: pings, window updates, go-away, resets. Jump ahead
    /// of queued data.
    ctrl_tx: mpsc::UnboundedSender<SendItem>,
    /// Data frames, including the zero-length FIN carriers, in FIFO order.
    data_tx: mpsc::UnboundedSender<SendItem>,
    /// Fan-out that stops the worker tasks once the session dies.
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionShared {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    fn submit(
        &self,
        queue: &mpsc::UnboundedSender<SendItem>,
        frame: Frame,
        done: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        if let Some(fault) = self.state.lock().fault {
            return Err(fault.to_error());
        }
        queue
            .send(SendItem { frame, done })
            .map_err(|_| Error::SessionShutdown)
    }

    pub(crate) fn submit_data(&self, stream_id: u32, flags: Flags, body: Bytes) -> Result<()> {
        let header = Header::data(stream_id, flags, body.len() as u32);
        self.submit(&self.data_tx, Frame::with_body(header, body), None)
    }

    /// A `FIN` travels as a zero-length data frame so it stays behind the
    /// stream's queued payloads.
    pub(crate) fn submit_close(&self, stream_id: u32, flags: Flags) -> Result<()> {
        let header = Header::data(stream_id, flags, 0);
        self.submit(&self.data_tx, Frame::header_only(header), None)
    }

    pub(crate) fn submit_window_update(
        &self,
        stream_id: u32,
        flags: Flags,
        delta: u32,
    ) -> Result<()> {
        let header = Header::window_update(stream_id, flags, delta);
        self.submit(&self.ctrl_tx, Frame::header_only(header), None)
    }

    /// An `RST` is a header-only window update with the reset flag; it may
    /// overtake queued data, which is the point of an abort.
    pub(crate) fn submit_reset(&self, stream_id: u32) -> Result<()> {
        self.submit_window_update(stream_id, Flags::RST, 0)
    }

    pub(crate) fn submit_ping(&self, flags: Flags, nonce: u32) -> Result<()> {
        let header = Header::ping(flags, nonce);
        self.submit(&self.ctrl_tx, Frame::header_only(header), None)
    }

    pub(crate) fn submit_go_away(
        &self,
        code: GoAwayCode,
        done: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        self.submit(&self.ctrl_tx, Frame::header_only(Header::go_away(code)), done)
    }

    pub(crate) fn lookup_stream(&self, stream_id: u32) -> Option<Arc<StreamShared>> {
        self.state.lock().streams.get(&stream_id).cloned()
    }

    pub(crate) fn remove_stream(&self, stream_id: u32) {
        if self.state.lock().streams.remove(&stream_id).is_some() {
            trace!(stream_id, "stream retired");
        }
    }

    /// Removes the stream from the registry once both halves are done.
    pub(crate) fn retire_if_finished(&self, stream: &StreamShared) {
        if stream.is_finished() {
            self.remove_stream(stream.id);
        }
    }

    /// Registers a stream the peer opened with `SYN` and queues it for
    /// accept. Wrong parity and id reuse are fatal; a full accept backlog
    /// or a local go-away answer with a reset instead.
    pub(crate) fn incoming_stream(&self, stream_id: u32) -> Result<()> {
        let peer_opened_odd = stream_id % 2 == 1;
        let parity_ok = match self.side {
            Side::Client => !peer_opened_odd,
            Side::Server => peer_opened_odd,
        };
        if stream_id == 0 || !parity_ok {
            return Err(Error::Protocol("stream id parity violation"));
        }

        let stream = {
            let mut state = self.state.lock();
            if state.fault.is_some() {
                return Ok(());
            }
            if state.streams.contains_key(&stream_id) {
                return Err(Error::DuplicateStream(stream_id));
            }
            if state.local_goaway {
                drop(state);
                trace!(stream_id, "stream opened after local go-away, resetting");
                let _ = self.submit_reset(stream_id);
                return Ok(());
            }
            let Some(accept_tx) = state.accept_tx.clone() else {
                return Ok(());
            };
            let stream = Arc::new(StreamShared::new(
                stream_id,
                Phase::SynReceived,
                self.config.max_stream_window_size,
            ));
            match accept_tx.try_send(stream.clone()) {
                Ok(()) => {
                    state.streams.insert(stream_id, stream.clone());
                    stream
                }
                Err(_) => {
                    drop(state);
                    warn!(stream_id, "accept backlog full, resetting stream");
                    let _ = self.submit_reset(stream_id);
                    return Ok(());
                }
            }
        };
        trace!(stream_id = stream.id, "incoming stream queued for accept");
        Ok(())
    }

    /// Kills the session exactly once: records the fault, fails every
    /// stream and pending ping, closes the accept queue, and stops the
    /// worker tasks.
    pub(crate) fn shutdown(&self, fault: Fault) {
        let streams: Vec<Arc<StreamShared>> = {
            let mut state = self.state.lock();
            if state.fault.is_some() {
                return;
            }
            state.fault = Some(fault);
            state.accept_tx = None;
            // Dropping the reply senders wakes every ping waiter.
            state.pings.clear();
            state.streams.drain().map(|(_, stream)| stream).collect()
        };
        for stream in &streams {
            stream.fail(fault);
        }
        let _ = self.shutdown_tx.send(());
        debug!(?fault, streams = streams.len(), "session shut down");
    }

    pub(crate) fn fault(&self) -> Option<Fault> {
        self.state.lock().fault
    }

    pub(crate) fn set_remote_goaway(&self) {
        self.state.lock().remote_goaway = true;
    }

    pub(crate) fn take_pending_ping(&self, nonce: u32) -> Option<PendingPing> {
        self.state.lock().pings.remove(&nonce)
    }
}

/// One multiplexed session over a single reliable transport.
///
/// Construct with [`Session::client`] on the initiating side and
/// [`Session::server`] on the accepting side; the two are symmetric apart
/// from stream id parity. Construction spawns the session's worker tasks,
/// so it must happen inside a tokio runtime.
pub struct Session {
    shared: Arc<SessionShared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<StreamShared>>>,
}

impl Session {
    /// Starts the odd-id (initiator) side of a session.
    pub fn client<T>(transport: T, config: Config) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Session::start(transport, config, Side::Client)
    }

    /// Starts the even-id (accepter) side of a session.
    pub fn server<T>(transport: T, config: Config) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Session::start(transport, config, Side::Server)
    }

    fn start<T>(transport: T, config: Config, side: Side) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;
        let (read_half, write_half) = tokio::io::split(transport);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        let (shutdown_tx, _) = broadcast::channel(1);

        let shared = Arc::new(SessionShared {
            side,
            state: Mutex::new(SessionState {
                streams: HashMap::new(),
                next_stream_id: match side {
                    Side::Client => 1,
                    Side::Server => 2,
                },
                pings: HashMap::new(),
                local_goaway: false,
                remote_goaway: false,
                fault: None,
                accept_tx: Some(accept_tx),
            }),
            ctrl_tx,
            data_tx,
            shutdown_tx,
            config,
        });

        tokio::spawn(recv::recv_loop(read_half, shared.clone()));
        tokio::spawn(send::send_loop(write_half, ctrl_rx, data_rx, shared.clone()));
        if shared.config.enable_keep_alive {
            tokio::spawn(ping::keep_alive_loop(shared.clone()));
        }
        debug!(?side, "session started");

        Ok(Session {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        })
    }

    /// Opens a new stream to the peer.
    ///
    /// No frame is emitted until the stream's first write or close; the
    /// `SYN` rides on that frame. Fails with [`Error::RemoteGoAway`] after
    /// the peer announced it accepts no new streams, and with the
    /// session-level cause once the session is gone.
    pub fn open(&self) -> Result<Stream> {
        let stream = {
            let mut state = self.shared.state.lock();
            if let Some(fault) = state.fault {
                return Err(fault.to_error());
            }
            if state.local_goaway {
                return Err(Error::SessionShutdown);
            }
            if state.remote_goaway {
                return Err(Error::RemoteGoAway);
            }
            let stream_id = state.next_stream_id;
            if stream_id >= u32::MAX - 1 {
                return Err(Error::StreamsExhausted);
            }
            state.next_stream_id += 2;
            let stream = Arc::new(StreamShared::new(
                stream_id,
                Phase::Init,
                self.shared.config.max_stream_window_size,
            ));
            state.streams.insert(stream_id, stream.clone());
            stream
        };
        trace!(stream_id = stream.id, "stream opened");
        spawn_open_watchdog(self.shared.clone(), stream.clone());
        Ok(Stream::new(stream, self.shared.clone()))
    }

    /// Waits for the next stream the peer opens, in the order their `SYN`
    /// frames arrived. Fails once the session dies.
    pub async fn accept_stream(&self) -> Result<Stream> {
        let mut accept_rx = self.accept_rx.lock().await;
        match accept_rx.recv().await {
            Some(stream) => {
                trace!(stream_id = stream.id, "stream accepted");
                Ok(Stream::new(stream, self.shared.clone()))
            }
            None => Err(self
                .shared
                .fault()
                .map(Fault::to_error)
                .unwrap_or(Error::SessionShutdown)),
        }
    }

    /// Measures a round trip to the peer.
    pub async fn ping(&self) -> Result<Duration> {
        ping::ping(&self.shared).await
    }

    /// Announces that this side opens and accepts no further streams.
    /// Existing streams are unaffected.
    pub fn go_away(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if let Some(fault) = state.fault {
                return Err(fault.to_error());
            }
            state.local_goaway = true;
        }
        debug!("local go-away");
        self.shared.submit_go_away(GoAwayCode::Normal, None)
    }

    /// Shuts the whole session down: flushes a final go-away, terminates
    /// every stream, stops the workers, and releases the transport.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shared.fault().is_some() {
            return Ok(());
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .shared
            .submit_go_away(GoAwayCode::Normal, Some(done_tx))
            .is_ok()
        {
            let _ = time::timeout(self.shared.config.connection_write_timeout, done_rx).await;
        }
        self.shared.shutdown(Fault::Shutdown);
        Ok(())
    }

    /// Whether the session has died, for any reason.
    pub fn is_closed(&self) -> bool {
        self.shared.fault().is_some()
    }

    /// Number of streams currently registered, both directions combined.
    pub fn num_streams(&self) -> usize {
        self.shared.state.lock().streams.len()
    }
}

/// Watches a locally opened stream until the peer acknowledges it. A peer
/// that never answers the `SYN` within the configured bound is treated as
/// dead and takes the session down with it.
fn spawn_open_watchdog(shared: Arc<SessionShared>, stream: Arc<StreamShared>) {
    let deadline = Instant::now() + shared.config.stream_open_timeout;
    let settled = |stream: &StreamShared| {
        let state = stream.state.lock();
        state.phase == Phase::Established
            || state.reset
            || state.fault.is_some()
            || (state.send_closed && state.recv_closed)
    };
    tokio::spawn(async move {
        let mut shutdown_rx = shared.shutdown_tx.subscribe();
        loop {
            let notified = stream.established.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if settled(&stream) {
                return;
            }

            tokio::select! {
                _ = notified => {}
                _ = shutdown_rx.recv() => return,
                _ = time::sleep_until(deadline) => {
                    if settled(&stream) {
                        return;
                    }
                    error!(
                        stream_id = stream.id,
                        "stream was never acknowledged, dropping session"
                    );
                    shared.shutdown(Fault::OpenTimeout);
                    return;
                }
            }
        }
    });
}
