// crates/conduit-rpc/src/lib.rs
//
// conduit-rpc: contract dispatcher, streaming session manager, and transport
// bindings for the Conduit RPC layer.
//
// Calls arrive through one of three bindings (HTTP request/response, raw
// framed duplex, event-addressed duplex), are normalized into call envelopes,
// and go through the same `Dispatcher`. Streaming results are owned by the
// `SessionManager`, which pumps them to the originating peer.

pub mod api;
pub mod binding;
pub mod dispatcher;
pub mod handler;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod session;

// Re-export the main types for ergonomic access.
pub use dispatcher::{Dispatched, Dispatcher};
pub use handler::{CallContext, Handler, HandlerTable, StreamingHandler, UnaryHandler, ValueStream};
pub use server::{BindingKind, RpcConfig, RpcServer};
pub use session::{PeerHandle, SessionKey, SessionManager, SessionState};
