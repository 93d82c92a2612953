// crates/conduit-core/src/lib.rs
//
// conduit-core: Core types, contracts, and trait interfaces for the Conduit
// RPC layer.
//
// This is the leaf crate that all other crates in the workspace depend on.
// It defines the call/response envelopes, the error taxonomy, procedure
// contracts and their registry, the schema validator boundary, the peer
// capability every transport binding implements, and the persistence
// contract consumed by the user procedures.

pub mod contract;
pub mod envelope;
pub mod error;
pub mod peer;
pub mod schema;
pub mod traits;
pub mod user;

// Re-export key types for ergonomic access from downstream crates.
// Usage: `use conduit_core::CallEnvelope;`

// Envelope types
pub use envelope::{CallEnvelope, ResponseBody, ResponseEnvelope};

// Contract types
pub use contract::{CallMode, Contract, ContractRegistry, ProcedurePath};

// Schema types
pub use schema::{Field, Schema, SchemaValidator, StringFormat};

// Peer types
pub use peer::{Peer, PeerKey};

// Record types
pub use user::{NewUser, User, UserPatch};

// Error types
pub use error::{ErrorKind, RegistryError, RpcError, StoreError, ValidationError};

// Traits
pub use traits::{UserStore, Validator};
