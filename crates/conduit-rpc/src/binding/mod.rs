// crates/conduit-rpc/src/binding/mod.rs
//
// Transport bindings. Each one decodes its wire framing into `CallEnvelope`s,
// implements `Peer` once, and hands calls to the shared `Dispatcher`.
//
// - `http`: one-shot request/response over tonic's HTTP server.
// - `duplex`: raw framed duplex stream (TCP or any AsyncRead + AsyncWrite).
// - `events`: event-name-addressed duplex stream with ack callbacks.
//
// Persistent bindings write through a per-connection outbound queue drained
// by a dedicated writer task. With back-pressure on, the queue is bounded:
// `Peer::ready` waits for capacity, and a session pump waits on it before
// pulling the next value from its handler.

pub mod duplex;
pub mod events;
pub mod framing;
pub mod http;

use std::future::Future;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use conduit_core::contract::CallMode;
use conduit_core::envelope::CallEnvelope;
use conduit_core::error::RpcError;

use crate::dispatcher::Dispatcher;
use crate::session::PeerHandle;

/// Outbound flow control for persistent connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControl {
    /// Bound the outbound queue and make senders wait when it is full.
    #[serde(default = "default_backpressure")]
    pub backpressure: bool,
    /// Outbound queue capacity in frames when back-pressure is on.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_backpressure() -> bool {
    true
}

fn default_outbound_buffer() -> usize {
    256
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            backpressure: default_backpressure(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Sending side of a connection's outbound queue.
#[derive(Debug)]
pub(crate) enum OutboundQueue<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for OutboundQueue<T> {
    fn clone(&self) -> Self {
        match self {
            OutboundQueue::Bounded(tx) => OutboundQueue::Bounded(tx.clone()),
            OutboundQueue::Unbounded(tx) => OutboundQueue::Unbounded(tx.clone()),
        }
    }
}

impl<T> OutboundQueue<T> {
    /// Enqueue one frame, waiting for capacity on a bounded queue.
    pub(crate) async fn send(&self, item: T) -> Result<(), RpcError> {
        let sent = match self {
            OutboundQueue::Bounded(tx) => tx.send(item).await.is_ok(),
            OutboundQueue::Unbounded(tx) => tx.send(item).is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(RpcError::Transport("Connection writer has stopped".to_string()))
        }
    }

    /// Wait until a frame could be enqueued without waiting. The capacity is
    /// not held, so a later `send` may still wait if another sender took it.
    pub(crate) async fn ready(&self) -> Result<(), RpcError> {
        let open = match self {
            OutboundQueue::Bounded(tx) => tx.reserve().await.is_ok(),
            OutboundQueue::Unbounded(tx) => !tx.is_closed(),
        };
        if open {
            Ok(())
        } else {
            Err(RpcError::Transport("Connection writer has stopped".to_string()))
        }
    }

    /// Enqueue without waiting. Used from synchronous paths such as
    /// `Peer::close`.
    pub(crate) fn try_send(&self, item: T) -> Result<(), RpcError> {
        let sent = match self {
            OutboundQueue::Bounded(tx) => tx.try_send(item).is_ok(),
            OutboundQueue::Unbounded(tx) => tx.send(item).is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(RpcError::Transport("Outbound queue full or closed".to_string()))
        }
    }
}

/// Receiving side, owned by the writer task.
#[derive(Debug)]
pub(crate) enum OutboundReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> OutboundReceiver<T> {
    pub(crate) async fn recv(&mut self) -> Option<T> {
        match self {
            OutboundReceiver::Bounded(rx) => rx.recv().await,
            OutboundReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

pub(crate) fn outbound_channel<T>(flow: &FlowControl) -> (OutboundQueue<T>, OutboundReceiver<T>) {
    if flow.backpressure {
        let (tx, rx) = mpsc::channel(flow.outbound_buffer.max(1));
        (OutboundQueue::Bounded(tx), OutboundReceiver::Bounded(rx))
    } else {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutboundQueue::Unbounded(tx), OutboundReceiver::Unbounded(rx))
    }
}

/// Hand a decoded call to the dispatcher on behalf of a persistent peer.
///
/// Streaming calls are dispatched inline: starting a session never blocks,
/// and doing it in frame order means a cancel frame that follows a call frame
/// always finds the session. Unary calls run on their own task so a slow
/// handler does not hold up the connection's reader.
pub(crate) async fn route_call(dispatcher: &Dispatcher, handle: &PeerHandle, call: CallEnvelope) {
    if dispatcher.mode_of(&call.path) == Some(CallMode::Streaming) {
        dispatcher.handle(call, handle).await;
    } else {
        let dispatcher = dispatcher.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            dispatcher.handle(call, &handle).await;
        });
    }
}

/// Accept connections until `shutdown` fires, spawning `on_connection` for
/// each one.
pub(crate) async fn accept_loop<F, Fut>(
    listener: TcpListener,
    shutdown: CancellationToken,
    binding: &'static str,
    on_connection: F,
) -> std::io::Result<()>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send,
    Fut: Future<Output = ()> + Send + 'static,
{
    tracing::info!("{} binding listening on {}", binding, listener.local_addr()?);
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                tracing::debug!("{} connection accepted from {}", binding, addr);
                tokio::spawn(on_connection(stream, addr));
            }
            Err(e) => {
                tracing::warn!("{} accept failed: {}", binding, e);
            }
        }
    }
    tracing::info!("{} binding stopped", binding);
    Ok(())
}
