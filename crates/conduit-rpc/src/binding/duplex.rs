// crates/conduit-rpc/src/binding/duplex.rs
//
// Raw duplex binding.
//
// Each inbound frame is a JSON call envelope, or a cancel frame
// `{"cancel": "<callId>"}`. Each outbound frame is a JSON response envelope.
// A frame that fails to decode gets an `error(Transport)` reply and the
// connection keeps reading; a framing error (oversized frame, invalid UTF-8 on
// a line) ends the connection.
//
// When the connection ends for any reason, every session it owns is torn
// down through the session manager.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use conduit_core::envelope::{CallEnvelope, ResponseEnvelope};
use conduit_core::error::RpcError;
use conduit_core::peer::Peer;

use crate::binding::framing::{FrameCodec, Framing, DEFAULT_MAX_FRAME_LENGTH};
use crate::binding::{accept_loop, outbound_channel, route_call, FlowControl, OutboundQueue, OutboundReceiver};
use crate::dispatcher::{call_id_of, Dispatcher};
use crate::session::PeerHandle;

/// Per-connection settings for the raw duplex binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplexOptions {
    pub framing: Framing,
    pub max_frame_length: usize,
    pub flow: FlowControl,
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            framing: Framing::Lines,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            flow: FlowControl::default(),
        }
    }
}

/// What a client may send on the raw duplex channel.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClientFrame {
    Call(CallEnvelope),
    Cancel { cancel: String },
}

/// `Peer` for one duplex connection. Sends go through the connection's
/// outbound queue; `close` stops the reader and the writer.
pub(crate) struct QueuePeer {
    queue: OutboundQueue<Bytes>,
    closed: CancellationToken,
}

impl QueuePeer {
    pub(crate) fn new(queue: OutboundQueue<Bytes>, closed: CancellationToken) -> Self {
        Self { queue, closed }
    }

    pub(crate) fn queue(&self) -> &OutboundQueue<Bytes> {
        &self.queue
    }

    /// Enqueue an already-encoded frame, giving up if the connection closes
    /// while waiting for queue capacity.
    pub(crate) async fn send_frame(&self, frame: Bytes) -> Result<(), RpcError> {
        if self.closed.is_cancelled() {
            return Err(RpcError::Transport("Connection is closed".to_string()));
        }
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(RpcError::Transport("Connection is closed".to_string()))
            }
            sent = self.queue.send(frame) => sent,
        }
    }
}

#[async_trait]
impl Peer for QueuePeer {
    async fn send(&self, envelope: ResponseEnvelope) -> Result<(), RpcError> {
        let frame = serde_json::to_vec(&envelope)?;
        self.send_frame(Bytes::from(frame)).await
    }

    async fn ready(&self) -> Result<(), RpcError> {
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(RpcError::Transport("Connection is closed".to_string()))
            }
            ready = self.queue.ready() => ready,
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Drain the outbound queue into the sink until the connection closes.
/// Frames already queued when the close happens are still written.
pub(crate) async fn write_loop<W>(
    mut outbound: OutboundReceiver<Bytes>,
    mut sink: FramedWrite<W, FrameCodec>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            _ = closed.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = sink.send(frame).await {
            tracing::warn!("Write failed, closing connection: {}", e);
            closed.cancel();
            break;
        }
    }
    if let Err(e) = sink.close().await {
        tracing::debug!("Closing writer failed: {}", e);
    }
}

/// Serve one raw duplex connection until the client hangs up, the peer is
/// closed, or `shutdown` fires.
pub async fn serve_connection<S>(
    io: S,
    dispatcher: Dispatcher,
    options: DuplexOptions,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let codec = FrameCodec::new(options.framing, options.max_frame_length);
    let mut frames = FramedRead::new(read_half, codec.clone());
    let sink = FramedWrite::new(write_half, codec);

    let (queue, outbound) = outbound_channel(&options.flow);
    let closed = CancellationToken::new();
    let peer = Arc::new(QueuePeer::new(queue, closed.clone()));
    let handle = dispatcher.sessions().attach(peer.clone());
    let writer = tokio::spawn(write_loop(outbound, sink, closed.clone()));

    tracing::debug!("Duplex peer {} connected", handle.key());

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(bytes)) => handle_frame(&dispatcher, &handle, &peer, &bytes).await,
            Some(Err(e)) => {
                tracing::warn!("Duplex peer {} framing error: {}", handle.key(), e);
                break;
            }
            None => break,
        }
    }

    let torn_down = dispatcher.sessions().close_peer(&handle.key());
    peer.close();
    if let Err(e) = writer.await {
        tracing::warn!("Duplex writer task failed: {}", e);
    }
    tracing::debug!(
        "Duplex peer {} disconnected, {} session(s) torn down",
        handle.key(),
        torn_down
    );
}

async fn handle_frame(dispatcher: &Dispatcher, handle: &PeerHandle, peer: &QueuePeer, bytes: &[u8]) {
    match serde_json::from_slice::<ClientFrame>(bytes) {
        Ok(ClientFrame::Call(call)) => route_call(dispatcher, handle, call).await,
        Ok(ClientFrame::Cancel { cancel }) => {
            if !dispatcher.sessions().cancel(&handle.key(), &cancel) {
                tracing::debug!("Cancel for inactive callId {} ignored", cancel);
            }
        }
        Err(e) => {
            let call_id = serde_json::from_slice::<Value>(bytes)
                .map(|raw| call_id_of(&raw))
                .unwrap_or_default();
            let err = RpcError::Transport(format!("Malformed frame: {}", e));
            if let Err(e) = peer.send(ResponseEnvelope::error(call_id, &err)).await {
                tracing::debug!("Could not report malformed frame: {}", e);
            }
        }
    }
}

/// Accept raw duplex connections on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Dispatcher,
    options: DuplexOptions,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let conn_shutdown = shutdown.clone();
    accept_loop(listener, shutdown, "duplex", move |stream, _addr| {
        serve_connection(stream, dispatcher.clone(), options, conn_shutdown.clone())
    })
    .await
}
