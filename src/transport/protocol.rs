//! JSON-RPC 2.0 message types and the line codec.
//!
//! One frame per line: either a single message object or a JSON array of
//! messages (a batch). Classification of inbound objects is done on the raw
//! `serde_json::Value` so that `"result": null` survives as a real result.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// The only protocol version accepted on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard and application-reserved JSON-RPC error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const RESOURCE_NOT_FOUND: i64 = -32001;
    pub const RESOURCE_UNAVAILABLE: i64 = -32002;
    pub const TOOL_NOT_FOUND: i64 = -32003;
    pub const TOOL_EXECUTION_FAILED: i64 = -32004;
    pub const PROMPT_NOT_FOUND: i64 = -32005;
    pub const PROMPT_RENDER_FAILED: i64 = -32006;
}

/// Correlation identifier carried in `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
    Null,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Null => f.write_str("null"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// A request expecting a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: RequestId,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: id.into(),
        }
    }
}

/// A request-shaped message with no `id`; never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(codes::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Codes in the resource/tool/prompt range (-32006..=-32001).
    pub const fn is_application_error(&self) -> bool {
        self.code >= codes::PROMPT_RENDER_FAILED && self.code <= codes::RESOURCE_NOT_FOUND
    }
}

/// Exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(ErrorObject),
}

/// A response to a previously sent request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub payload: ResponsePayload,
}

impl Response {
    pub const fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            payload: ResponsePayload::Result(result),
        }
    }

    pub const fn error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    pub const fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(v) => Some(v),
            ResponsePayload::Error(_) => None,
        }
    }

    pub const fn error_object(&self) -> Option<&ErrorObject> {
        match &self.payload {
            ResponsePayload::Result(_) => None,
            ResponsePayload::Error(e) => Some(e),
        }
    }
}

/// Any single JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Request(r) => {
                let mut obj = Map::new();
                obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
                obj.insert("method".into(), Value::from(r.method.clone()));
                if let Some(params) = &r.params {
                    obj.insert("params".into(), params.clone());
                }
                obj.insert("id".into(), id_to_value(&r.id));
                Value::Object(obj)
            }
            Self::Notification(n) => {
                let mut obj = Map::new();
                obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
                obj.insert("method".into(), Value::from(n.method.clone()));
                if let Some(params) = &n.params {
                    obj.insert("params".into(), params.clone());
                }
                Value::Object(obj)
            }
            Self::Response(r) => {
                let mut obj = Map::new();
                obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
                match &r.payload {
                    ResponsePayload::Result(v) => {
                        obj.insert("result".into(), v.clone());
                    }
                    ResponsePayload::Error(e) => {
                        obj.insert(
                            "error".into(),
                            serde_json::to_value(e).unwrap_or(Value::Null),
                        );
                    }
                }
                obj.insert("id".into(), id_to_value(&r.id));
                Value::Object(obj)
            }
        }
    }

    /// Classify one JSON object as a request, notification or response.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::InvalidMessage(
                "message must be a JSON object".into(),
            ));
        };

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => return Err(ProtocolError::UnsupportedVersion(other.to_string())),
            None => {
                return Err(ProtocolError::InvalidMessage(
                    "missing \"jsonrpc\" member".into(),
                ))
            }
        }

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(ProtocolError::InvalidMessage(
                    "\"method\" must be a string".into(),
                ));
            };
            let params = obj.remove("params");
            return match obj.remove("id") {
                Some(id) => Ok(Self::Request(Request {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    method,
                    params,
                    id: parse_id(id)?,
                })),
                None => Ok(Self::Notification(Notification {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    method,
                    params,
                })),
            };
        }

        let id = obj
            .remove("id")
            .ok_or_else(|| ProtocolError::InvalidMessage("response without \"id\"".into()))
            .and_then(parse_id)?;

        let payload = match (obj.remove("result"), obj.remove("error")) {
            (Some(result), None) => ResponsePayload::Result(result),
            (None, Some(error)) => ResponsePayload::Error(serde_json::from_value(error)?),
            (Some(_), Some(_)) => {
                return Err(ProtocolError::InvalidMessage(
                    "response carries both \"result\" and \"error\"".into(),
                ))
            }
            (None, None) => {
                return Err(ProtocolError::InvalidMessage(
                    "response carries neither \"result\" nor \"error\"".into(),
                ))
            }
        };

        Ok(Self::Response(Response { id, payload }))
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Self::Notification(n)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Single(Message),
    Batch(Vec<Message>),
}

impl Frame {
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Single(m) => vec![m],
            Self::Batch(ms) => ms,
        }
    }
}

fn id_to_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::from(s.clone()),
        RequestId::Null => Value::Null,
    }
}

fn parse_id(value: Value) -> Result<RequestId, ProtocolError> {
    match value {
        Value::Null => Ok(RequestId::Null),
        Value::String(s) => Ok(RequestId::String(s)),
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| ProtocolError::InvalidMessage(format!("non-integer id: {n}"))),
        other => Err(ProtocolError::InvalidMessage(format!(
            "id must be a string, integer or null, got {other}"
        ))),
    }
}

/// Encode a single message as one newline-terminated line.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(&message.to_value())?;
    buf.push(b'\n');
    Ok(buf)
}

/// Encode several messages as one newline-terminated JSON array.
pub fn encode_batch(messages: &[Message]) -> Result<Vec<u8>, ProtocolError> {
    if messages.is_empty() {
        return Err(ProtocolError::EmptyBatch);
    }
    let array = Value::Array(messages.iter().map(Message::to_value).collect());
    let mut buf = serde_json::to_vec(&array)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one line (without its terminator) into a frame.
pub fn decode_frame(line: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(line.trim())?;
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ProtocolError::EmptyBatch);
            }
            items
                .into_iter()
                .map(Message::from_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Frame::Batch)
        }
        other => Message::from_value(other).map(Frame::Single),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_request_with_numeric_id() {
        let frame =
            decode_frame(r#"{"jsonrpc":"2.0","method":"echo","params":{"message":"hi"},"id":1}"#)
                .unwrap();
        let Frame::Single(Message::Request(req)) = frame else {
            panic!("expected request, got {frame:?}");
        };
        assert_eq!(req.method, "echo");
        assert_eq!(req.id, RequestId::Number(1));
        assert_eq!(req.params, Some(json!({"message": "hi"})));
    }

    #[test]
    fn test_decode_notification_has_no_id() {
        let frame = decode_frame(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#).unwrap();
        assert!(matches!(frame, Frame::Single(Message::Notification(_))));
    }

    #[test]
    fn test_null_result_is_a_success() {
        let frame = decode_frame(r#"{"jsonrpc":"2.0","result":null,"id":"a"}"#).unwrap();
        let Frame::Single(Message::Response(resp)) = frame else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::String("a".into()));
        assert_eq!(resp.result(), Some(&Value::Null));
    }

    #[test]
    fn test_error_response_decodes_error_object() {
        let frame = decode_frame(
            r#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"nope"},"id":null}"#,
        )
        .unwrap();
        let Frame::Single(Message::Response(resp)) = frame else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::Null);
        assert_eq!(resp.error_object().unwrap().code, codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_response_with_both_members_is_rejected() {
        let err = decode_frame(r#"{"jsonrpc":"2.0","result":1,"error":{"code":1,"message":"x"},"id":1}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_response_with_neither_member_is_rejected() {
        assert!(decode_frame(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let err = decode_frame(r#"{"jsonrpc":"1.0","method":"x","id":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion(_)));
    }

    #[test]
    fn test_garbage_is_a_json_error() {
        assert!(matches!(
            decode_frame("not json").unwrap_err(),
            ProtocolError::Json(_)
        ));
    }

    #[test]
    fn test_batch_frame_preserves_order() {
        let line = r#"[{"jsonrpc":"2.0","result":1,"id":1},{"jsonrpc":"2.0","method":"n"}]"#;
        let Frame::Batch(msgs) = decode_frame(line).unwrap() else {
            panic!("expected batch");
        };
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], Message::Response(_)));
        assert!(matches!(msgs[1], Message::Notification(_)));
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        assert!(matches!(decode_frame("[]"), Err(ProtocolError::EmptyBatch)));
        assert!(matches!(encode_batch(&[]), Err(ProtocolError::EmptyBatch)));
    }

    #[test]
    fn test_encoded_message_is_one_line() {
        let msg = Message::Request(Request::new(7, "tools/list", None));
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);

        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "tools/list", "id": 7}));
    }

    #[test]
    fn test_application_error_range() {
        assert!(ErrorObject::new(codes::TOOL_NOT_FOUND, "x").is_application_error());
        assert!(ErrorObject::new(codes::PROMPT_RENDER_FAILED, "x").is_application_error());
        assert!(!ErrorObject::internal("x").is_application_error());
        assert!(!ErrorObject::new(-32000, "x").is_application_error());
    }
}
