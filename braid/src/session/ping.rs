//! Ping round trips and the background keep-alive probe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::{error, trace};

use braid_wire::Flags;

use crate::error::{Error, Fault, Result};
use crate::session::SessionShared;

/// A ping in flight: when it left, and who is waiting for the echo.
pub(crate) struct PendingPing {
    sent_at: Instant,
    reply_tx: oneshot::Sender<Duration>,
}

/// Sends a `PING` and waits for the matching `ACK`, returning the round
/// trip time. Bounded by the configured ping timeout; a timed-out nonce is
/// forgotten so a late echo is simply dropped.
pub(crate) async fn ping(shared: &Arc<SessionShared>) -> Result<Duration> {
    let (nonce, reply_rx) = {
        let mut state = shared.state.lock();
        if let Some(fault) = state.fault {
            return Err(fault.to_error());
        }
        // Nonces must be unique among pings in flight; zero is reserved.
        let mut nonce: u32 = rand::random();
        while nonce == 0 || state.pings.contains_key(&nonce) {
            nonce = rand::random();
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        state.pings.insert(
            nonce,
            PendingPing {
                sent_at: Instant::now(),
                reply_tx,
            },
        );
        (nonce, reply_rx)
    };

    if let Err(error) = shared.submit_ping(Flags::SYN, nonce) {
        shared.state.lock().pings.remove(&nonce);
        return Err(error);
    }

    match time::timeout(shared.config().ping_timeout, reply_rx).await {
        Ok(Ok(rtt)) => Ok(rtt),
        // The book was cleared by shutdown.
        Ok(Err(_)) => Err(shared
            .fault()
            .map(Fault::to_error)
            .unwrap_or(Error::SessionShutdown)),
        Err(_) => {
            shared.state.lock().pings.remove(&nonce);
            Err(Error::Timeout)
        }
    }
}

/// Resolves an echoed nonce against the ping book.
pub(crate) fn complete(shared: &Arc<SessionShared>, nonce: u32) {
    match shared.take_pending_ping(nonce) {
        Some(pending) => {
            let _ = pending.reply_tx.send(pending.sent_at.elapsed());
        }
        None => trace!(nonce, "ping response with unknown nonce"),
    }
}

/// Periodically pings the peer and kills the session when a probe goes
/// unanswered.
pub(crate) async fn keep_alive_loop(shared: Arc<SessionShared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let period = shared.config().keep_alive_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = ticker.tick() => {}
        }
        match ping(&shared).await {
            Ok(rtt) => trace!(?rtt, "keep-alive round trip"),
            Err(Error::Timeout) => {
                error!("keep-alive probe went unanswered, dropping session");
                shared.shutdown(Fault::KeepAlive);
                return;
            }
            // The session is already on its way down.
            Err(_) => return,
        }
    }
}
