// crates/conduit-rpc/src/handler.rs
//
// Handler table: maps a procedure path to a unary or streaming handler.
//
// Handlers receive input that has already passed the contract's input schema.
// Typed closures are adapted with `UnaryFn` / `StreamingFn`, which decode the
// validated JSON into the closure's request type and encode its output.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use conduit_core::contract::{CallMode, ContractRegistry, ProcedurePath};
use conduit_core::error::{RegistryError, RpcError};

/// A handler's output sequence. Pulled by the session manager one value at
/// a time; an `Err` item ends the session with an `error` envelope.
pub type ValueStream = BoxStream<'static, Result<Value, RpcError>>;

/// Per-call information handed to every handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub call_id: String,
    pub path: ProcedurePath,
    /// The envelope's free-form context map.
    pub context: Map<String, Value>,
    /// Cancelled when the caller cancels or disconnects. Streaming handlers
    /// must stop producing promptly once this fires.
    pub cancel: CancellationToken,
}

/// A procedure that produces exactly one value.
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn call(&self, input: Value, ctx: CallContext) -> Result<Value, RpcError>;
}

/// A procedure that produces a time-ordered sequence of values.
pub trait StreamingHandler: Send + Sync {
    /// Start the sequence. Must not block; long-running work belongs inside
    /// the returned stream.
    fn open(&self, input: Value, ctx: CallContext) -> Result<ValueStream, RpcError>;
}

/// A registered handler of either mode.
#[derive(Clone)]
pub enum Handler {
    Unary(Arc<dyn UnaryHandler>),
    Streaming(Arc<dyn StreamingHandler>),
}

impl Handler {
    pub fn mode(&self) -> CallMode {
        match self {
            Handler::Unary(_) => CallMode::Unary,
            Handler::Streaming(_) => CallMode::Streaming,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler::{}", self.mode())
    }
}

fn decode_input<T: DeserializeOwned>(input: Value) -> Result<T, RpcError> {
    serde_json::from_value(input).map_err(|e| RpcError::Validation {
        path: Vec::new(),
        reason: format!("Failed to decode input: {}", e),
    })
}

fn encode_output<T: Serialize>(output: T) -> Result<Value, RpcError> {
    serde_json::to_value(output)
        .map_err(|e| RpcError::Handler(format!("Failed to serialize output: {}", e)))
}

/// Adapts `async fn(Req, CallContext) -> Result<Resp, RpcError>` into a
/// `UnaryHandler`.
pub struct UnaryFn<F, Req, Resp, Fut> {
    f: F,
    _phantom: PhantomData<fn(Req) -> (Resp, Fut)>,
}

impl<F, Req, Resp, Fut> UnaryFn<F, Req, Resp, Fut> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Req, Resp, Fut> UnaryHandler for UnaryFn<F, Req, Resp, Fut>
where
    F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
{
    async fn call(&self, input: Value, ctx: CallContext) -> Result<Value, RpcError> {
        let request: Req = decode_input(input)?;
        let response = (self.f)(request, ctx).await?;
        encode_output(response)
    }
}

/// Adapts `fn(Req, CallContext) -> impl Stream<Item = Result<Item, RpcError>>`
/// into a `StreamingHandler`.
pub struct StreamingFn<F, Req, Item, S> {
    f: F,
    _phantom: PhantomData<fn(Req) -> (Item, S)>,
}

impl<F, Req, Item, S> StreamingFn<F, Req, Item, S> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

impl<F, Req, Item, S> StreamingHandler for StreamingFn<F, Req, Item, S>
where
    F: Fn(Req, CallContext) -> S + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Item: Serialize + Send + 'static,
    S: Stream<Item = Result<Item, RpcError>> + Send + 'static,
{
    fn open(&self, input: Value, ctx: CallContext) -> Result<ValueStream, RpcError> {
        let request: Req = decode_input(input)?;
        let stream = (self.f)(request, ctx);
        Ok(stream
            .map(|item| item.and_then(encode_output))
            .boxed())
    }
}

/// Path-keyed handler lookup. Built at startup, then shared read-only.
#[derive(Debug, Default)]
pub struct HandlerTable {
    handlers: HashMap<ProcedurePath, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, path: &str, handler: Handler) -> Result<(), RegistryError> {
        let path = ProcedurePath::parse(path);
        if !path.is_valid() {
            return Err(RegistryError::InvalidPath(path.to_string()));
        }
        if self.handlers.contains_key(&path) {
            return Err(RegistryError::Duplicate(path.to_string()));
        }
        self.handlers.insert(path, handler);
        Ok(())
    }

    /// Register a unary handler object.
    pub fn register_unary<H>(&mut self, path: &str, handler: H) -> Result<(), RegistryError>
    where
        H: UnaryHandler + 'static,
    {
        self.insert(path, Handler::Unary(Arc::new(handler)))
    }

    /// Register a streaming handler object.
    pub fn register_streaming<H>(&mut self, path: &str, handler: H) -> Result<(), RegistryError>
    where
        H: StreamingHandler + 'static,
    {
        self.insert(path, Handler::Streaming(Arc::new(handler)))
    }

    /// Register a typed async closure as a unary handler.
    pub fn unary<F, Req, Resp, Fut>(&mut self, path: &str, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        self.register_unary(path, UnaryFn::new(f))
    }

    /// Register a typed stream-producing closure as a streaming handler.
    pub fn streaming<F, Req, Item, S>(&mut self, path: &str, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Req, CallContext) -> S + Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Item: Serialize + Send + 'static,
        S: Stream<Item = Result<Item, RpcError>> + Send + 'static,
    {
        self.register_streaming(path, StreamingFn::new(f))
    }

    pub fn get(&self, path: &ProcedurePath) -> Option<Handler> {
        self.handlers.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Check that every contract has a handler of the same mode and that no
    /// handler is registered without a contract.
    pub fn verify(&self, contracts: &ContractRegistry) -> Result<(), RegistryError> {
        for contract in contracts.contracts() {
            match self.handlers.get(&contract.path) {
                None => return Err(RegistryError::MissingHandler(contract.path.to_string())),
                Some(h) if h.mode() != contract.mode => {
                    return Err(RegistryError::ModeMismatch(contract.path.to_string()))
                }
                Some(_) => {}
            }
        }
        if let Some(path) = self.handlers.keys().find(|p| !contracts.contains(p)) {
            return Err(RegistryError::UnknownContract(path.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::contract::Contract;
    use conduit_core::schema::Schema;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Echo {
        text: String,
    }

    fn ctx(path: &str) -> CallContext {
        CallContext {
            call_id: "t".to_string(),
            path: ProcedurePath::parse(path),
            context: Map::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn typed_unary_closure_round_trips_json() {
        let mut table = HandlerTable::new();
        table
            .unary("echo.say", |req: Echo, _ctx| async move {
                Ok::<_, RpcError>(json!({"said": req.text}))
            })
            .unwrap();

        let Some(Handler::Unary(h)) = table.get(&ProcedurePath::parse("echo.say")) else {
            panic!("expected unary handler");
        };
        let out = h.call(json!({"text": "hi"}), ctx("echo.say")).await.unwrap();
        assert_eq!(out, json!({"said": "hi"}));
    }

    #[tokio::test]
    async fn undecodable_input_is_a_validation_error() {
        let mut table = HandlerTable::new();
        table
            .unary("echo.say", |req: Echo, _ctx| async move { Ok::<_, RpcError>(req.text) })
            .unwrap();
        let Some(Handler::Unary(h)) = table.get(&ProcedurePath::parse("echo.say")) else {
            panic!("expected unary handler");
        };
        let err = h.call(json!({"nope": 1}), ctx("echo.say")).await.unwrap_err();
        assert!(matches!(err, RpcError::Validation { .. }));
    }

    #[tokio::test]
    async fn typed_streaming_closure_yields_encoded_items() {
        let mut table = HandlerTable::new();
        table
            .streaming("count.up", |n: u32, _ctx| {
                futures::stream::iter((0..n).map(Ok::<_, RpcError>))
            })
            .unwrap();
        let Some(Handler::Streaming(h)) = table.get(&ProcedurePath::parse("count.up")) else {
            panic!("expected streaming handler");
        };
        let items: Vec<_> = h
            .open(json!(3), ctx("count.up"))
            .unwrap()
            .collect()
            .await;
        let values: Vec<Value> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn duplicate_handler_registration_fails() {
        let mut table = HandlerTable::new();
        table
            .unary("a.b", |_: Value, _| async { Ok::<_, RpcError>(Value::Null) })
            .unwrap();
        let err = table
            .unary("a.b", |_: Value, _| async { Ok::<_, RpcError>(Value::Null) })
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("a.b".into()));
    }

    #[test]
    fn verify_detects_missing_mismatched_and_orphaned_handlers() {
        let mut contracts = ContractRegistry::new();
        contracts
            .register(Contract::unary("a.b", Schema::Any, Schema::Any))
            .unwrap();

        let table = HandlerTable::new();
        assert_eq!(
            table.verify(&contracts),
            Err(RegistryError::MissingHandler("a.b".into()))
        );

        let mut table = HandlerTable::new();
        table
            .streaming("a.b", |_: Value, _| futures::stream::empty::<Result<Value, RpcError>>())
            .unwrap();
        assert_eq!(
            table.verify(&contracts),
            Err(RegistryError::ModeMismatch("a.b".into()))
        );

        let mut table = HandlerTable::new();
        table
            .unary("a.b", |_: Value, _| async { Ok::<_, RpcError>(Value::Null) })
            .unwrap();
        table
            .unary("x.y", |_: Value, _| async { Ok::<_, RpcError>(Value::Null) })
            .unwrap();
        assert_eq!(
            table.verify(&contracts),
            Err(RegistryError::UnknownContract("x.y".into()))
        );
    }
}
