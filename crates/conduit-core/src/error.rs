// crates/conduit-core/src/error.rs
//
// Error taxonomy for the Conduit RPC layer.
//
// `RpcError` is the per-call taxonomy that ends up on the wire as an `error`
// envelope. `RegistryError` covers startup-time wiring faults, `StoreError`
// the persistence collaborator, and `ValidationError` the validator boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Wire-level error classification carried in `errorKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed input; the handler was never invoked.
    Validation,
    /// Unknown procedure path or missing domain record.
    NotFound,
    /// Uncaught fault inside a handler.
    Handler,
    /// Malformed frame, write to a closed peer, or a mode the binding forbids.
    Transport,
    /// Session torn down by an explicit cancel or a disconnect.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "Validation",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Handler => "Handler",
            ErrorKind::Transport => "Transport",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while handling a single call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// Input did not satisfy the contract's input schema.
    #[error("Validation error at `{}`: {}", .path.join("."), .reason)]
    Validation { path: Vec<String>, reason: String },

    /// Unknown procedure path or missing record.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Fault inside a handler, including a broken output contract.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Transport-level failure scoped to one peer.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The call was cancelled before it finished.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl RpcError {
    /// Convenience constructor for a validation error on a single field.
    pub fn invalid_field(field: &str, reason: impl Into<String>) -> Self {
        RpcError::Validation {
            path: vec![field.to_string()],
            reason: reason.into(),
        }
    }

    /// The wire-level kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Validation { .. } => ErrorKind::Validation,
            RpcError::NotFound(_) => ErrorKind::NotFound,
            RpcError::Handler(_) => ErrorKind::Handler,
            RpcError::Transport(_) => ErrorKind::Transport,
            RpcError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Human-readable message for the `message` field of an error envelope.
    pub fn message(&self) -> String {
        match self {
            RpcError::Validation { reason, .. } => reason.clone(),
            RpcError::NotFound(msg)
            | RpcError::Handler(msg)
            | RpcError::Transport(msg)
            | RpcError::Cancelled(msg) => msg.clone(),
        }
    }

    /// Structured detail for the `detail` field. Validation errors carry the
    /// offending field path; other kinds carry nothing.
    pub fn detail(&self) -> Option<Value> {
        match self {
            RpcError::Validation { path, .. } => Some(Value::Array(
                path.iter().cloned().map(Value::String).collect(),
            )),
            _ => None,
        }
    }
}

/// The validator boundary's failure value: where the input went wrong and why.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (at `{}`)", .path.join("."))]
pub struct ValidationError {
    /// Field path from the root of the value; array indices are rendered as
    /// decimal strings.
    pub path: Vec<String>,
    /// Why the value was rejected.
    pub reason: String,
}

impl ValidationError {
    pub fn new(path: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            path,
            reason: reason.into(),
        }
    }
}

impl From<ValidationError> for RpcError {
    fn from(e: ValidationError) -> Self {
        RpcError::Validation {
            path: e.path,
            reason: e.reason,
        }
    }
}

/// A frame that is not valid JSON (or not the expected shape) is a transport
/// fault of the sending peer.
impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Transport(format!("Malformed frame: {}", e))
    }
}

/// Startup-time registration faults. These abort server construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two contracts (or two handlers) were registered under the same path.
    #[error("Duplicate procedure path: {0}")]
    Duplicate(String),

    /// The path is empty or contains an empty or dotted segment.
    #[error("Invalid procedure path: {0}")]
    InvalidPath(String),

    /// A contract has no handler.
    #[error("No handler registered for contract: {0}")]
    MissingHandler(String),

    /// A handler was registered for a path with no contract.
    #[error("Handler registered for unknown contract: {0}")]
    UnknownContract(String),

    /// Handler and contract disagree on unary vs streaming.
    #[error("Handler mode does not match contract mode for: {0}")]
    ModeMismatch(String),
}

/// Persistence collaborator errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No record with the given key.
    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness constraint was violated on the named field.
    #[error("Conflict on `{field}`: {reason}")]
    Conflict { field: String, reason: String },

    /// Backend failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for RpcError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => RpcError::NotFound(format!("{} not found", what)),
            StoreError::Conflict { field, reason } => RpcError::Validation {
                path: vec![field],
                reason,
            },
            StoreError::Storage(msg) => RpcError::Handler(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_detail_is_field_path() {
        let err = RpcError::invalid_field("email", "Invalid email");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.message(), "Invalid email");
        assert_eq!(err.detail(), Some(serde_json::json!(["email"])));
    }

    #[test]
    fn non_validation_errors_have_no_detail() {
        assert_eq!(RpcError::NotFound("x".into()).detail(), None);
        assert_eq!(RpcError::Handler("x".into()).detail(), None);
    }

    #[test]
    fn store_errors_map_onto_call_taxonomy() {
        let nf: RpcError = StoreError::NotFound("User".into()).into();
        assert_eq!(nf, RpcError::NotFound("User not found".into()));

        let conflict: RpcError = StoreError::Conflict {
            field: "email".into(),
            reason: "Email already registered".into(),
        }
        .into();
        assert_eq!(conflict.kind(), ErrorKind::Validation);
        assert_eq!(conflict.detail(), Some(serde_json::json!(["email"])));

        let storage: RpcError = StoreError::Storage("disk".into()).into();
        assert_eq!(storage.kind(), ErrorKind::Handler);
    }

    #[test]
    fn error_kind_serializes_as_name() {
        let json = serde_json::to_string(&ErrorKind::NotFound).unwrap();
        assert_eq!(json, "\"NotFound\"");
    }
}
