//! JSON-RPC 2.0 message types.
//!
//! Messages are relayed verbatim, so [`JsonRpcMessage`] keeps the raw object
//! and only exposes the fields the bridge needs to classify and correlate it.

use crate::{TetherError, TetherResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Protocol version string carried in every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer identifier.
    Number(i64),
    /// String identifier.
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::from(*n),
            RequestId::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

/// The shape of a JSON-RPC message, decided once when it is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Has `method` and `id`: expects exactly one response.
    Request,
    /// Has `method` but no `id`.
    Notification,
    /// Has `result` or `error`.
    Response,
}

/// A single JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct JsonRpcMessage {
    kind: MessageKind,
    fields: Map<String, Value>,
}

impl JsonRpcMessage {
    /// Parse one message from a line or request body.
    pub fn parse(raw: &str) -> TetherResult<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    /// Validate an already-decoded JSON value as a JSON-RPC message.
    ///
    /// Batches (arrays) are rejected.
    pub fn from_value(value: Value) -> TetherResult<Self> {
        let Value::Object(fields) = value else {
            return Err(TetherError::Protocol(
                "expected a single JSON-RPC object".into(),
            ));
        };
        let kind = classify(&fields)?;
        Ok(Self { kind, fields })
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        fields.insert("method".into(), Value::String(method.into()));
        fields.insert("params".into(), params);
        Self {
            kind: MessageKind::Notification,
            fields,
        }
    }

    /// Build a request.
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        let mut msg = Self::notification(method, params);
        msg.kind = MessageKind::Request;
        msg.set_id(&id);
        msg
    }

    /// Build a successful response.
    pub fn response(id: RequestId, result: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        fields.insert("id".into(), id.to_value());
        fields.insert("result".into(), result);
        Self {
            kind: MessageKind::Response,
            fields,
        }
    }

    /// Build an error response.
    pub fn error_response(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        fields.insert("id".into(), id.to_value());
        fields.insert(
            "error".into(),
            serde_json::json!({"code": code, "message": message.into()}),
        );
        Self {
            kind: MessageKind::Response,
            fields,
        }
    }

    /// The message's shape.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The `id` member, if it is a number or string.
    pub fn id(&self) -> Option<RequestId> {
        self.fields.get("id").and_then(RequestId::from_value)
    }

    /// Overwrite the `id` member.
    pub fn set_id(&mut self, id: &RequestId) {
        self.fields.insert("id".into(), id.to_value());
    }

    /// The `method` member of a request or notification.
    pub fn method(&self) -> Option<&str> {
        self.fields.get("method").and_then(Value::as_str)
    }

    /// Look up any top-level member.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Serialize to a single line of JSON.
    pub fn to_line(&self) -> TetherResult<String> {
        Ok(serde_json::to_string(&self.fields)?)
    }
}

fn classify(fields: &Map<String, Value>) -> TetherResult<MessageKind> {
    let has_method = fields.get("method").is_some_and(Value::is_string);
    let has_id = fields.get("id").is_some_and(|id| !id.is_null());
    let is_response = fields.contains_key("result") || fields.contains_key("error");

    match (has_method, has_id, is_response) {
        (true, true, false) => Ok(MessageKind::Request),
        (true, false, false) => Ok(MessageKind::Notification),
        (false, _, true) => Ok(MessageKind::Response),
        _ => Err(TetherError::Protocol(
            "message is neither a request, notification nor response".into(),
        )),
    }
}

impl TryFrom<Value> for JsonRpcMessage {
    type Error = TetherError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<JsonRpcMessage> for Value {
    fn from(msg: JsonRpcMessage) -> Self {
        Value::Object(msg.fields)
    }
}
