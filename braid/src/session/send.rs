//! Send scheduler: the session's sole transport writer.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{error, warn};

use braid_wire::Frame;

use crate::error::Fault;
use crate::session::SessionShared;

/// A frame queued for transmission. `done` fires once the frame has been
/// committed to the transport; only session close cares.
pub(crate) struct SendItem {
    pub(crate) frame: Frame,
    pub(crate) done: Option<oneshot::Sender<()>>,
}

/// Drains the control and data queues onto the transport, control first.
///
/// Frames are written atomically: header and payload go out as one
/// buffer, and a frame is either fully committed or the session dies.
/// Submission back-pressure is handled upstream by per-stream send
/// windows, so the queues themselves never block senders.
pub(crate) async fn send_loop<W>(
    mut writer: W,
    mut ctrl_rx: mpsc::UnboundedReceiver<SendItem>,
    mut data_rx: mpsc::UnboundedReceiver<SendItem>,
    shared: Arc<SessionShared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut buf = BytesMut::with_capacity(16 * 1024);

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            item = ctrl_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            item = data_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        if write_frame(&mut writer, &mut buf, item, &shared).await.is_err() {
            let _ = writer.shutdown().await;
            return;
        }
    }

    // The shutdown path still flushes queued control frames so a final
    // go-away reaches the peer.
    while let Ok(item) = ctrl_rx.try_recv() {
        if write_frame(&mut writer, &mut buf, item, &shared).await.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame<W>(
    writer: &mut W,
    buf: &mut BytesMut,
    item: SendItem,
    shared: &SessionShared,
) -> Result<(), ()>
where
    W: AsyncWrite + Unpin,
{
    buf.clear();
    item.frame.encode_into(buf);

    let commit = async {
        writer.write_all(&buf[..]).await?;
        writer.flush().await
    };
    match time::timeout(shared.config().connection_write_timeout, commit).await {
        Ok(Ok(())) => {
            if let Some(done) = item.done {
                let _ = done.send(());
            }
            Ok(())
        }
        Ok(Err(error)) => {
            warn!(%error, "transport write failed");
            shared.shutdown(Fault::ConnectionReset);
            Err(())
        }
        Err(_) => {
            error!("transport write timed out");
            shared.shutdown(Fault::ConnectionReset);
            Err(())
        }
    }
}
