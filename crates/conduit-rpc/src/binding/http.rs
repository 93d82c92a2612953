// crates/conduit-rpc/src/binding/http.rs
//
// Request/response binding, served by tonic's HTTP server with HTTP/1.1
// enabled. No proto codegen: a manual `tower_service::Service` plus
// `NamedService` mounts everything under `/api`.
//
// Routes:
//   GET  /api/health          liveness probe
//   POST /api/rpc             body = full call envelope
//   POST /api/<seg>/<seg>...  body = input only; path from the URL, callId
//                             generated, request headers in context.headers
//
// The response body is always one response envelope (or the health
// document). Streaming procedures are refused with a transport error.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, StatusCode};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tonic::Status;
use uuid::Uuid;

use conduit_core::contract::ProcedurePath;
use conduit_core::envelope::{CallEnvelope, ResponseEnvelope};
use conduit_core::error::{ErrorKind, RpcError};
use conduit_core::peer::Peer;

use crate::dispatcher::{call_id_of, Dispatcher};
use crate::session::PeerHandle;

/// Peer for a single HTTP exchange: the first `send` is the reply, later
/// sends fail.
struct OneShotPeer {
    reply: Mutex<Option<oneshot::Sender<ResponseEnvelope>>>,
}

impl OneShotPeer {
    fn new() -> (Self, oneshot::Receiver<ResponseEnvelope>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                reply: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

#[async_trait]
impl Peer for OneShotPeer {
    async fn send(&self, envelope: ResponseEnvelope) -> Result<(), RpcError> {
        let tx = self
            .reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| RpcError::Transport("Response already sent".to_string()))?;
        tx.send(envelope)
            .map_err(|_| RpcError::Transport("Client went away".to_string()))
    }

    fn close(&self) {}
}

/// HTTP status for a response envelope.
pub fn status_for(envelope: &ResponseEnvelope) -> StatusCode {
    match envelope.error_kind() {
        None => StatusCode::OK,
        Some(ErrorKind::Validation) | Some(ErrorKind::Transport) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorKind::Handler) => StatusCode::INTERNAL_SERVER_ERROR,
        // 499: client closed request.
        Some(ErrorKind::Cancelled) => {
            StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
        }
    }
}

/// The request/response binding as a tower service.
#[derive(Clone)]
pub struct HttpBinding {
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for HttpBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBinding").finish_non_exhaustive()
    }
}

impl HttpBinding {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Dispatch one call through a one-shot peer and wait for its reply.
    async fn exchange(&self, call: CallEnvelope) -> ResponseEnvelope {
        let call_id = call.call_id.clone();
        let (peer, reply) = OneShotPeer::new();
        let handle = PeerHandle::one_shot(Arc::new(peer));
        self.dispatcher.handle(call, &handle).await;
        match reply.await {
            Ok(envelope) => envelope,
            Err(_) => ResponseEnvelope::error(
                call_id,
                &RpcError::Handler("No response produced".to_string()),
            ),
        }
    }

    async fn route(&self, method: Method, uri_path: &str, headers: Value, body: Bytes) -> (StatusCode, Value) {
        let segments: Vec<&str> = uri_path
            .trim_start_matches('/')
            .split('/')
            .skip(1) // "api"
            .filter(|s| !s.is_empty())
            .collect();

        match segments.as_slice() {
            [] => (StatusCode::NOT_FOUND, json!({"error": "Route not found"})),
            ["health"] if method == Method::GET => (
                StatusCode::OK,
                json!({"status": "ok", "timestamp": chrono::Utc::now().to_rfc3339()}),
            ),
            _ if method != Method::POST => (
                StatusCode::METHOD_NOT_ALLOWED,
                json!({"error": format!("Method {} not allowed", method)}),
            ),
            ["rpc"] => {
                let call = match decode_envelope(&body) {
                    Ok(call) => call,
                    Err(reply) => return envelope_reply(&reply),
                };
                let call = if call.context.contains_key("headers") {
                    call
                } else {
                    call.with_context("headers", headers)
                };
                envelope_reply(&self.exchange(call).await)
            }
            segs => {
                let call_id = Uuid::now_v7().to_string();
                let input = match decode_input(&body) {
                    Ok(input) => input,
                    Err(err) => return envelope_reply(&ResponseEnvelope::error(call_id, &err)),
                };
                let path = ProcedurePath::new(segs.iter().copied());
                let call = CallEnvelope::new(path, input, call_id).with_context("headers", headers);
                envelope_reply(&self.exchange(call).await)
            }
        }
    }
}

fn envelope_reply(envelope: &ResponseEnvelope) -> (StatusCode, Value) {
    let body = serde_json::to_value(envelope).unwrap_or_else(|e| {
        json!({"callId": envelope.call_id, "kind": "error", "errorKind": "Handler", "message": e.to_string()})
    });
    (status_for(envelope), body)
}

fn decode_envelope(body: &[u8]) -> Result<CallEnvelope, ResponseEnvelope> {
    serde_json::from_slice::<CallEnvelope>(body).map_err(|e| {
        let call_id = serde_json::from_slice::<Value>(body)
            .map(|raw| call_id_of(&raw))
            .unwrap_or_default();
        ResponseEnvelope::error(call_id, &RpcError::from(e))
    })
}

fn decode_input(body: &[u8]) -> Result<Value, RpcError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(body)?)
}

fn headers_to_json(headers: &http::HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(map)
}

impl tonic::server::NamedService for HttpBinding {
    const NAME: &'static str = "api";
}

impl<B> tower_service::Service<http::Request<B>> for HttpBinding
where
    B: HttpBody + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    B::Data: Send,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let binding = self.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            tracing::debug!("{} {}", parts.method, parts.uri.path());

            let body = match collect_body(body).await {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!("{}", err);
                    let (status, json) = envelope_reply(&ResponseEnvelope::error("", &err));
                    return Ok(build_response(status, &json));
                }
            };

            let headers = headers_to_json(&parts.headers);
            let (status, json) = binding
                .route(parts.method, parts.uri.path(), headers, body)
                .await;
            Ok(build_response(status, &json))
        })
    }
}

/// Read the whole request body. A body that breaks off mid-read is a
/// transport failure of the exchange.
async fn collect_body<B>(body: B) -> Result<Bytes, RpcError>
where
    B: HttpBody,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| RpcError::Transport(format!("Failed to read request body: {}", e.into())))
}

/// Build an HTTP response with the given status and JSON body.
fn build_response(status: StatusCode, json: &Value) -> http::Response<tonic::body::BoxBody> {
    let bytes = serde_json::to_vec(json).unwrap_or_default();
    let body = tonic::body::BoxBody::new(
        http_body_util::Full::new(Bytes::from(bytes))
            .map_err(|e| Status::internal(format!("body error: {}", e))),
    );

    let mut response = http::Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
