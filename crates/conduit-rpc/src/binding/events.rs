// crates/conduit-rpc/src/binding/events.rs
//
// Event-addressed duplex binding.
//
// Every frame is `{ "event": <name>, "data": <payload>, "ack"?: <id> }`.
// Reserved event names (configurable):
//   rpc:call      data = call envelope; an `ack` id asks for the first
//                 response envelope to come back as an ack frame
//   rpc:cancel    data = { callId }
//   rpc:response  outbound response envelopes
//   rpc:ack       outbound ack frame carrying a response envelope
//   disconnect    either side is leaving
//
// Aliases map plain application events onto a procedure: the start event
// (re)starts the call under a fixed callId, the stop event cancels it, and
// each streamed value is emitted under the alias's emit event with the bare
// value as payload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use conduit_core::contract::ProcedurePath;
use conduit_core::envelope::{CallEnvelope, ResponseBody, ResponseEnvelope};
use conduit_core::error::RpcError;
use conduit_core::peer::Peer;

use crate::binding::duplex::{write_loop, QueuePeer};
use crate::binding::framing::{FrameCodec, Framing, DEFAULT_MAX_FRAME_LENGTH};
use crate::binding::{accept_loop, outbound_channel, route_call, FlowControl};
use crate::dispatcher::{call_id_of, Dispatcher};
use crate::session::PeerHandle;

/// One frame on the event-addressed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack: None,
        }
    }

    pub fn with_ack(mut self, ack: u64) -> Self {
        self.ack = Some(ack);
        self
    }
}

/// Reserved event names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNames {
    #[serde(default = "default_call_event")]
    pub call: String,
    #[serde(default = "default_cancel_event")]
    pub cancel: String,
    #[serde(default = "default_response_event")]
    pub response: String,
    #[serde(default = "default_ack_event")]
    pub ack: String,
    #[serde(default = "default_disconnect_event")]
    pub disconnect: String,
}

fn default_call_event() -> String {
    "rpc:call".to_string()
}

fn default_cancel_event() -> String {
    "rpc:cancel".to_string()
}

fn default_response_event() -> String {
    "rpc:response".to_string()
}

fn default_ack_event() -> String {
    "rpc:ack".to_string()
}

fn default_disconnect_event() -> String {
    "disconnect".to_string()
}

impl Default for EventNames {
    fn default() -> Self {
        Self {
            call: default_call_event(),
            cancel: default_cancel_event(),
            response: default_response_event(),
            ack: default_ack_event(),
            disconnect: default_disconnect_event(),
        }
    }
}

/// A plain event route onto a procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAlias {
    pub start_event: String,
    pub stop_event: String,
    pub emit_event: String,
    /// Dotted procedure path, e.g. `time.stream`.
    pub path: String,
}

impl EventAlias {
    /// The live clock feed: `start-time-stream` / `stop-time-stream`, values
    /// emitted as `time-update`.
    pub fn time_stream() -> Self {
        Self {
            start_event: "start-time-stream".to_string(),
            stop_event: "stop-time-stream".to_string(),
            emit_event: "time-update".to_string(),
            path: "time.stream".to_string(),
        }
    }

    /// The fixed callId an alias runs under on each connection.
    pub fn call_id(&self) -> String {
        format!("alias:{}", self.start_event)
    }
}

/// Settings for the event-addressed binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOptions {
    pub framing: Framing,
    pub max_frame_length: usize,
    pub flow: FlowControl,
    pub names: EventNames,
    /// Honour `ack` ids on inbound calls.
    pub acks: bool,
    pub aliases: Vec<EventAlias>,
}

impl Default for EventOptions {
    fn default() -> Self {
        Self {
            framing: Framing::Lines,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            flow: FlowControl::default(),
            names: EventNames::default(),
            acks: true,
            aliases: vec![EventAlias::time_stream()],
        }
    }
}

/// `Peer` for one event-addressed connection.
struct EventPeer {
    inner: QueuePeer,
    names: EventNames,
    /// callId -> ack id still waiting for the call's first response. At most
    /// one per callId; a later call cannot claim a callId that is waiting.
    pending_acks: Mutex<HashMap<String, u64>>,
    /// alias callId -> emit event name.
    alias_emits: HashMap<String, String>,
}

impl EventPeer {
    /// Park `ack` for the first response under `call_id`. Returns `false`
    /// and leaves the table alone if another ack is already waiting there.
    fn remember_ack(&self, call_id: &str, ack: u64) -> bool {
        let mut pending = self
            .pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending.contains_key(call_id) {
            return false;
        }
        pending.insert(call_id.to_string(), ack);
        true
    }

    /// Answer one inbound frame directly, without going through the pending
    /// ack table: as an ack frame when the frame carried an ack id, otherwise
    /// as a response event.
    async fn reply(&self, envelope: ResponseEnvelope, ack: Option<u64>) {
        let sent = match serde_json::to_value(&envelope) {
            Ok(data) => {
                let frame = match ack {
                    Some(id) => EventFrame::new(self.names.ack.clone(), data).with_ack(id),
                    None => EventFrame::new(self.names.response.clone(), data),
                };
                self.emit(&frame).await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            tracing::debug!("Reply for {:?} not delivered: {}", envelope.call_id, e);
        }
    }

    /// Pick the outbound frame for an envelope.
    fn frame_for(&self, envelope: &ResponseEnvelope) -> Result<EventFrame, RpcError> {
        if let Some(emit) = self.alias_emits.get(&envelope.call_id) {
            if let ResponseBody::Event { value } = &envelope.body {
                return Ok(EventFrame::new(emit.clone(), value.clone()));
            }
        }

        let data = serde_json::to_value(envelope)?;
        let ack = self
            .pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&envelope.call_id);
        Ok(match ack {
            Some(id) => EventFrame::new(self.names.ack.clone(), data).with_ack(id),
            None => EventFrame::new(self.names.response.clone(), data),
        })
    }

    async fn emit(&self, frame: &EventFrame) -> Result<(), RpcError> {
        let bytes = serde_json::to_vec(frame)?;
        self.inner.send_frame(Bytes::from(bytes)).await
    }
}

#[async_trait]
impl Peer for EventPeer {
    async fn send(&self, envelope: ResponseEnvelope) -> Result<(), RpcError> {
        let frame = self.frame_for(&envelope)?;
        self.emit(&frame).await
    }

    async fn ready(&self) -> Result<(), RpcError> {
        self.inner.ready().await
    }

    async fn closed(&self) {
        self.inner.closed().await
    }

    fn close(&self) {
        let goodbye = EventFrame::new(self.names.disconnect.clone(), Value::Null);
        match serde_json::to_vec(&goodbye) {
            Ok(bytes) => {
                if let Err(e) = self.inner.queue().try_send(Bytes::from(bytes)) {
                    tracing::debug!("Disconnect frame not queued: {}", e);
                }
            }
            Err(e) => tracing::debug!("Disconnect frame not encoded: {}", e),
        }
        self.inner.close();
    }
}

/// What the reader loop should do after a frame.
enum Next {
    Continue,
    Disconnect,
}

/// Serve one event-addressed connection until either side disconnects or
/// `shutdown` fires.
pub async fn serve_connection<S>(
    io: S,
    dispatcher: Dispatcher,
    options: Arc<EventOptions>,
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
    let peer = Arc::new(EventPeer {
        inner: QueuePeer::new(queue, closed.clone()),
        names: options.names.clone(),
        pending_acks: Mutex::new(HashMap::new()),
        alias_emits: options
            .aliases
            .iter()
            .map(|a| (a.call_id(), a.emit_event.clone()))
            .collect(),
    });
    let handle = dispatcher.sessions().attach(peer.clone());
    let writer = tokio::spawn(write_loop(outbound, sink, closed.clone()));

    tracing::debug!("Event peer {} connected", handle.key());

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::warn!("Event peer {} framing error: {}", handle.key(), e);
                break;
            }
            None => break,
        };

        let frame = match serde_json::from_slice::<EventFrame>(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                let err = RpcError::Transport(format!("Malformed event frame: {}", e));
                peer.reply(ResponseEnvelope::error("", &err), None).await;
                continue;
            }
        };

        if let Next::Disconnect = handle_event(&dispatcher, &handle, &peer, &options, frame).await {
            break;
        }
    }

    let torn_down = dispatcher.sessions().close_peer(&handle.key());
    peer.close();
    if let Err(e) = writer.await {
        tracing::warn!("Event writer task failed: {}", e);
    }
    tracing::debug!(
        "Event peer {} disconnected, {} session(s) torn down",
        handle.key(),
        torn_down
    );
}

async fn handle_event(
    dispatcher: &Dispatcher,
    handle: &PeerHandle,
    peer: &EventPeer,
    options: &EventOptions,
    frame: EventFrame,
) -> Next {
    let names = &options.names;

    if frame.event == names.call {
        let call_id = call_id_of(&frame.data);
        let ack = frame.ack.filter(|_| options.acks);
        let call = match serde_json::from_value::<CallEnvelope>(frame.data) {
            Ok(call) => call,
            Err(e) => {
                let err = RpcError::Transport(format!("Malformed call envelope: {}", e));
                peer.reply(ResponseEnvelope::error(call_id, &err), ack).await;
                return Next::Continue;
            }
        };
        if let Some(ack) = ack {
            // The ack table is keyed by callId, so a call reusing a callId
            // that is still in use here is answered on its own ack.
            let busy = dispatcher.sessions().in_use(&handle.key(), &call.call_id);
            if busy || !peer.remember_ack(&call.call_id, ack) {
                let err = RpcError::Transport(format!(
                    "callId {} is already in use on this connection",
                    call.call_id
                ));
                peer.reply(ResponseEnvelope::error(call.call_id.as_str(), &err), Some(ack))
                    .await;
                return Next::Continue;
            }
        }
        route_call(dispatcher, handle, call).await;
        return Next::Continue;
    }

    if frame.event == names.cancel {
        let call_id = call_id_of(&frame.data);
        if !dispatcher.sessions().cancel(&handle.key(), &call_id) {
            tracing::debug!("Cancel for inactive callId {} ignored", call_id);
        }
        return Next::Continue;
    }

    if frame.event == names.disconnect {
        return Next::Disconnect;
    }

    if let Some(alias) = options.aliases.iter().find(|a| a.start_event == frame.event) {
        let call_id = alias.call_id();
        // Starting an alias that is already running restarts it.
        dispatcher.sessions().cancel(&handle.key(), &call_id);
        let input = match frame.data {
            Value::Null => json!({}),
            data => data,
        };
        let call = CallEnvelope::new(ProcedurePath::parse(&alias.path), input, call_id);
        route_call(dispatcher, handle, call).await;
        return Next::Continue;
    }

    if let Some(alias) = options.aliases.iter().find(|a| a.stop_event == frame.event) {
        dispatcher.sessions().cancel(&handle.key(), &alias.call_id());
        return Next::Continue;
    }

    tracing::debug!("Unhandled event {} from peer {}", frame.event, handle.key());
    Next::Continue
}

/// Accept event-addressed connections on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Dispatcher,
    options: EventOptions,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let options = Arc::new(options);
    let conn_shutdown = shutdown.clone();
    accept_loop(listener, shutdown, "events", move |stream, _addr| {
        serve_connection(
            stream,
            dispatcher.clone(),
            options.clone(),
            conn_shutdown.clone(),
        )
    })
    .await
}
