// crates/conduit-core/src/peer.rs
//
// The peer capability: the only view of a connection the dispatcher and the
// session manager ever get. Each transport binding implements it once.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::ResponseEnvelope;
use crate::error::RpcError;

/// Lookup key for one logical connection. Generated by the binding when the
/// connection is accepted; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerKey(Uuid);

impl PeerKey {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PeerKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One logical duplex connection.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Deliver one response envelope. Fails with `RpcError::Transport` when the
    /// peer is no longer reachable.
    async fn send(&self, envelope: ResponseEnvelope) -> Result<(), RpcError>;

    /// Wait until the peer has room for another envelope. Bindings with a
    /// bounded outbound queue wait for capacity here; session pumps call it
    /// before pulling the next value from a handler.
    async fn ready(&self) -> Result<(), RpcError> {
        Ok(())
    }

    /// Resolves once the connection has ended. Peers without a connection
    /// lifetime of their own never resolve.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }

    /// End the connection. Must be safe to call more than once.
    fn close(&self);
}
