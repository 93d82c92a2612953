// crates/conduit-cli/src/rpc_client.rs
//
// Lightweight client that POSTs call envelopes to the conduit-daemon HTTP
// binding.

use serde_json::Value;
use thiserror::Error;

use conduit_core::{CallEnvelope, ErrorKind, ProcedurePath, ResponseBody, ResponseEnvelope};

/// Errors surfaced to the CLI user.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The call reached the daemon and failed there.
    #[error("{kind}: {message}")]
    Rpc { kind: ErrorKind, message: String },

    /// The daemon answered with something other than a success or error.
    #[error("Unexpected {0} response")]
    Unexpected(&'static str),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A fresh call id.
pub fn new_call_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Build a call envelope for `path` ("users.get") with a fresh call id.
pub fn call_envelope(path: &str, input: Value) -> CallEnvelope {
    CallEnvelope::new(ProcedurePath::parse(path), input, new_call_id())
}

/// Send one call through the `/api/rpc` route and return the response
/// envelope, whatever its HTTP status.
pub async fn rpc_call(endpoint: &str, path: &str, input: Value) -> Result<ResponseEnvelope, ClientError> {
    let request = call_envelope(path, input);
    let url = format!("{}/api/rpc", endpoint.trim_end_matches('/'));

    let client = reqwest::Client::new();
    let resp = client.post(&url).json(&request).send().await?;

    let envelope: ResponseEnvelope = resp.json().await?;
    Ok(envelope)
}

/// Send one call and unwrap its `success` value.
pub async fn call_value(endpoint: &str, path: &str, input: Value) -> Result<Value, ClientError> {
    into_value(rpc_call(endpoint, path, input).await?)
}

/// Fetch `/api/health`.
pub async fn health(endpoint: &str) -> Result<Value, ClientError> {
    let url = format!("{}/api/health", endpoint.trim_end_matches('/'));
    let resp = reqwest::get(&url).await?.error_for_status()?;
    Ok(resp.json().await?)
}

/// The success value of an envelope, or the error it carries.
pub fn into_value(envelope: ResponseEnvelope) -> Result<Value, ClientError> {
    let kind = envelope.kind();
    match envelope.body {
        ResponseBody::Success { value } => Ok(value),
        ResponseBody::Error {
            error_kind, message, ..
        } => Err(ClientError::Rpc {
            kind: error_kind,
            message,
        }),
        _ => Err(ClientError::Unexpected(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::RpcError;
    use serde_json::json;

    #[test]
    fn success_unwraps_to_value() {
        let env = ResponseEnvelope::success("c", json!({"id": 1}));
        assert_eq!(into_value(env).unwrap(), json!({"id": 1}));
    }

    #[test]
    fn error_envelope_becomes_rpc_error() {
        let env = ResponseEnvelope::error("c", &RpcError::NotFound("User not found".into()));
        let err = into_value(env).unwrap_err();
        assert_eq!(err.to_string(), "NotFound: User not found");
    }

    #[test]
    fn streaming_envelopes_are_unexpected() {
        let err = into_value(ResponseEnvelope::complete("c")).unwrap_err();
        assert!(matches!(err, ClientError::Unexpected("complete")));
    }

    #[test]
    fn call_envelope_splits_path() {
        let call = call_envelope("users.get", json!({"id": 3}));
        assert_eq!(call.path.to_string(), "users.get");
        assert!(!call.call_id.is_empty());
    }
}
