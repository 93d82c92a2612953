// crates/conduit-core/src/envelope.rs
//
// Call and response envelopes: the normalized messages exchanged between a
// transport binding and the dispatcher.
//
// Wire shapes:
//   call:     { path: string[], input: any, callId: string, context: {..} }
//   response: { callId, kind, value?, errorKind?, message?, detail? }

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::contract::ProcedurePath;
use crate::error::{ErrorKind, RpcError};

/// An inbound call, decoded by a binding but not yet validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    /// Procedure path used to resolve the contract.
    pub path: ProcedurePath,
    /// Raw, unvalidated input. Absent input decodes as `null`.
    #[serde(default)]
    pub input: Value,
    /// Caller-generated id, unique among the peer's active calls.
    pub call_id: String,
    /// Free-form call context (e.g. request headers).
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl CallEnvelope {
    pub fn new(path: ProcedurePath, input: Value, call_id: impl Into<String>) -> Self {
        Self {
            path,
            input,
            call_id: call_id.into(),
            context: Map::new(),
        }
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// The variant part of a response envelope, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResponseBody {
    /// The single result of a unary call.
    Success { value: Value },
    /// A failed call, unary or streaming.
    Error {
        #[serde(rename = "errorKind")]
        error_kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    /// One value produced by a streaming call.
    Event { value: Value },
    /// A streaming call's sequence ended normally.
    Complete,
    /// A streaming call was cancelled.
    Aborted,
}

/// A response to a call, addressed by the call's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "callId")]
    pub call_id: String,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn success(call_id: impl Into<String>, value: Value) -> Self {
        Self {
            call_id: call_id.into(),
            body: ResponseBody::Success { value },
        }
    }

    pub fn error(call_id: impl Into<String>, err: &RpcError) -> Self {
        Self {
            call_id: call_id.into(),
            body: ResponseBody::Error {
                error_kind: err.kind(),
                message: err.message(),
                detail: err.detail(),
            },
        }
    }

    pub fn event(call_id: impl Into<String>, value: Value) -> Self {
        Self {
            call_id: call_id.into(),
            body: ResponseBody::Event { value },
        }
    }

    pub fn complete(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            body: ResponseBody::Complete,
        }
    }

    pub fn aborted(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            body: ResponseBody::Aborted,
        }
    }

    /// The wire `kind` string.
    pub fn kind(&self) -> &'static str {
        match self.body {
            ResponseBody::Success { .. } => "success",
            ResponseBody::Error { .. } => "error",
            ResponseBody::Event { .. } => "event",
            ResponseBody::Complete => "complete",
            ResponseBody::Aborted => "aborted",
        }
    }

    /// Whether this envelope ends its call. Only `event` is non-terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.body, ResponseBody::Event { .. })
    }

    /// The error kind, if this is an error envelope.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.body {
            ResponseBody::Error { error_kind, .. } => Some(*error_kind),
            _ => None,
        }
    }

    /// The carried value for `success` and `event` envelopes.
    pub fn value(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Success { value } | ResponseBody::Event { value } => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_envelope_decodes_wire_shape() {
        let raw = json!({
            "path": ["users", "get"],
            "input": {"id": 7},
            "callId": "c-1",
            "context": {"headers": {}}
        });
        let call: CallEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(call.path.to_string(), "users.get");
        assert_eq!(call.input, json!({"id": 7}));
        assert_eq!(call.call_id, "c-1");
        assert!(call.context.contains_key("headers"));
    }

    #[test]
    fn call_envelope_defaults_input_and_context() {
        let call: CallEnvelope =
            serde_json::from_value(json!({"path": ["users", "list"], "callId": "1"})).unwrap();
        assert_eq!(call.input, Value::Null);
        assert!(call.context.is_empty());
    }

    #[test]
    fn error_envelope_flattens_kind_fields() {
        let env = ResponseEnvelope::error("c-9", &RpcError::invalid_field("email", "Invalid email"));
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(
            wire,
            json!({
                "callId": "c-9",
                "kind": "error",
                "errorKind": "Validation",
                "message": "Invalid email",
                "detail": ["email"]
            })
        );
    }

    #[test]
    fn unit_kinds_carry_only_call_id() {
        let wire = serde_json::to_value(ResponseEnvelope::complete("s")).unwrap();
        assert_eq!(wire, json!({"callId": "s", "kind": "complete"}));
        let wire = serde_json::to_value(ResponseEnvelope::aborted("s")).unwrap();
        assert_eq!(wire, json!({"callId": "s", "kind": "aborted"}));
    }

    #[test]
    fn response_envelope_decodes_from_wire() {
        let env: ResponseEnvelope =
            serde_json::from_value(json!({"callId": "a", "kind": "event", "value": 3})).unwrap();
        assert_eq!(env, ResponseEnvelope::event("a", json!(3)));
        assert!(!env.is_terminal());

        let env: ResponseEnvelope = serde_json::from_value(
            json!({"callId": "a", "kind": "error", "errorKind": "NotFound", "message": "nope"}),
        )
        .unwrap();
        assert_eq!(env.error_kind(), Some(ErrorKind::NotFound));
        assert!(env.is_terminal());
    }
}
