// crates/conduit-rpc/src/dispatcher.rs
//
// RPC dispatcher: resolve, validate, invoke, normalize.
//
// Every binding funnels decoded call envelopes through `Dispatcher::dispatch`.
// Unary calls produce exactly one `success` or `error` envelope. Streaming
// calls are handed to the session manager and the dispatcher returns without
// waiting on the stream.
//
// A unary call whose connection closes before the handler returns is cut
// off with `error(Cancelled)` and its handler's token fires.
//
// Handler panics are caught here (unary calls and stream opening) and inside
// the wrapped stream (streaming items), and surface as `error(Handler)`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use conduit_core::contract::{CallMode, Contract, ContractRegistry, ProcedurePath};
use conduit_core::envelope::{CallEnvelope, ResponseEnvelope};
use conduit_core::error::{RegistryError, RpcError, ValidationError};
use conduit_core::traits::Validator;

use crate::handler::{CallContext, Handler, HandlerTable, ValueStream};
use crate::session::{PeerHandle, SessionKey, SessionManager};

/// Outcome of dispatching one call.
#[derive(Debug)]
pub enum Dispatched {
    /// A single envelope to send back: a unary result or any failure that
    /// happened before a session started.
    Reply(ResponseEnvelope),
    /// A streaming session was registered; the session's pump now owns
    /// every further envelope for this callId.
    Streaming(SessionKey),
}

impl Dispatched {
    /// The immediate reply, if any.
    pub fn into_reply(self) -> Option<ResponseEnvelope> {
        match self {
            Dispatched::Reply(envelope) => Some(envelope),
            Dispatched::Streaming(_) => None,
        }
    }
}

/// Dispatcher shared by all bindings.
#[derive(Clone)]
pub struct Dispatcher {
    contracts: Arc<ContractRegistry>,
    handlers: Arc<HandlerTable>,
    validator: Arc<dyn Validator>,
    sessions: Arc<SessionManager>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("contracts", &self.contracts.len())
            .field("sessions", &self.sessions)
            .finish()
    }
}

impl Dispatcher {
    /// Build a dispatcher. Fails if the handler table does not cover the
    /// contract registry exactly, mode for mode.
    pub fn new(
        contracts: ContractRegistry,
        handlers: HandlerTable,
        validator: Arc<dyn Validator>,
    ) -> Result<Self, RegistryError> {
        handlers.verify(&contracts)?;
        tracing::info!("Dispatcher ready with {} procedure(s)", contracts.len());
        Ok(Self {
            contracts: Arc::new(contracts),
            handlers: Arc::new(handlers),
            validator,
            sessions: Arc::new(SessionManager::new()),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    /// Mode of the contract registered at `path`, if any.
    pub fn mode_of(&self, path: &ProcedurePath) -> Option<CallMode> {
        self.contracts.resolve(path).ok().map(|c| c.mode)
    }

    /// Dispatch one call on behalf of `handle`'s peer.
    pub async fn dispatch(&self, call: CallEnvelope, handle: &PeerHandle) -> Dispatched {
        let call_id = call.call_id.clone();
        tracing::debug!("Dispatching {} (callId {})", call.path, call_id);

        match self.try_dispatch(call, handle).await {
            Ok(dispatched) => dispatched,
            Err(err) => {
                tracing::debug!("Call {} failed: {}", call_id, err);
                Dispatched::Reply(ResponseEnvelope::error(call_id, &err))
            }
        }
    }

    /// Dispatch and deliver the immediate reply (if any) through the peer.
    pub async fn handle(&self, call: CallEnvelope, handle: &PeerHandle) {
        let call_id = call.call_id.clone();
        if let Dispatched::Reply(envelope) = self.dispatch(call, handle).await {
            if let Err(e) = handle.peer().send(envelope).await {
                tracing::warn!("Reply for {} not delivered: {}", call_id, e);
            }
        }
    }

    async fn try_dispatch(
        &self,
        call: CallEnvelope,
        handle: &PeerHandle,
    ) -> Result<Dispatched, RpcError> {
        let contract = self.contracts.resolve(&call.path)?;

        // Request/response bindings refuse streaming contracts before the
        // input is even looked at.
        if contract.mode == CallMode::Streaming && !handle.supports_streaming() {
            return Err(RpcError::Transport(format!(
                "{} is a streaming procedure and needs a persistent connection",
                contract.path
            )));
        }

        let input = self.validator.validate(&contract.input, &call.input).await?;

        let handler = self
            .handlers
            .get(&contract.path)
            .ok_or_else(|| RpcError::Handler(format!("No handler for {}", contract.path)))?;

        let cancel = CancellationToken::new();
        let ctx = CallContext {
            call_id: call.call_id.clone(),
            path: contract.path.clone(),
            context: call.context,
            cancel: cancel.clone(),
        };

        match handler {
            Handler::Unary(h) => {
                let running = AssertUnwindSafe(h.call(input, ctx)).catch_unwind();
                let output = tokio::select! {
                    biased;
                    output = running => {
                        output.map_err(|panic| handler_panic(&contract.path, panic))??
                    }
                    _ = handle.peer().closed() => {
                        cancel.cancel();
                        return Err(RpcError::Cancelled(format!(
                            "{} cancelled: connection closed",
                            contract.path
                        )));
                    }
                };
                let output = self
                    .validator
                    .validate(&contract.output, &output)
                    .await
                    .map_err(|e| output_violation(&contract.path, e))?;
                Ok(Dispatched::Reply(ResponseEnvelope::success(
                    call.call_id,
                    output,
                )))
            }
            Handler::Streaming(h) => {
                let stream = std::panic::catch_unwind(AssertUnwindSafe(|| h.open(input, ctx)))
                    .map_err(|panic| handler_panic(&contract.path, panic))??;
                let stream = self.guard_stream(contract, stream);
                let key = self
                    .sessions
                    .start(handle, &call.call_id, stream, cancel.clone())
                    .inspect_err(|_| cancel.cancel())?;
                Ok(Dispatched::Streaming(key))
            }
        }
    }

    /// Wrap a handler stream so that a panic while producing an item ends
    /// the stream with a handler error, and every item is checked against
    /// the contract's output schema.
    fn guard_stream(&self, contract: Arc<Contract>, stream: ValueStream) -> ValueStream {
        let validator = self.validator.clone();
        let path = contract.path.clone();

        AssertUnwindSafe(stream)
            .catch_unwind()
            .map(move |item| match item {
                Ok(item) => item,
                Err(panic) => Err(handler_panic(&path, panic)),
            })
            .then(move |item| {
                let validator = validator.clone();
                let contract = contract.clone();
                async move {
                    let value = item?;
                    validator
                        .validate(&contract.output, &value)
                        .await
                        .map_err(|e| output_violation(&contract.path, e))
                }
            })
            .boxed()
    }
}

fn handler_panic(path: &ProcedurePath, panic: Box<dyn Any + Send>) -> RpcError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!("Handler for {} panicked: {}", path, detail);
    RpcError::Handler(format!("Handler panicked: {}", detail))
}

fn output_violation(path: &ProcedurePath, err: ValidationError) -> RpcError {
    tracing::warn!("Handler for {} broke its output contract: {}", path, err);
    RpcError::Handler(format!("Output contract violated: {}", err))
}

/// Extract a string call id from a loosely-typed frame, for error replies to
/// frames that did not decode as a full call envelope.
pub(crate) fn call_id_of(raw: &Value) -> String {
    raw.get("callId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
