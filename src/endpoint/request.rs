//! Request / response model for the endpoint runtime.
//!
//! A [`Request`] is one inbound envelope: the reassembled mission payload
//! plus its `info` headers. Each worker owns the `Request` for exactly one
//! dispatch — it is never shared across threads and must not be retained
//! past the handler's return.

use serde_json::{Map, Value};

/// Info keys with fabric-level meaning; everything else is an application
/// header surfaced via [`Request::headers`].
const RESERVED_KEYS: [&str; 5] =
    ["route", "message_id", "is_response", "is_cancel", "pipe_safe_code"];

/// Outbound payload in one of the three encodings the fabric carries.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A JSON document, serialized on send.
    Json(Value),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes, passed through untouched.
    Bytes(Vec<u8>),
}

impl Payload {
    /// Encode for the wire.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Json(v) => serde_json::to_vec(&v).unwrap_or_default(),
            Payload::Text(s) => s.into_bytes(),
            Payload::Bytes(b) => b,
        }
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}
impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}
impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}
impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(b)
    }
}
impl From<&[u8]> for Payload {
    fn from(b: &[u8]) -> Self {
        Payload::Bytes(b.to_vec())
    }
}

/// One inbound envelope, bound to a single worker for a single dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    data: Vec<u8>,
    info: Value,
}

impl Request {
    pub(crate) fn new(data: Vec<u8>, info: Value) -> Self {
        Self { data, info }
    }

    /// Synthetic cancelled request delivered to a correlator waiter.
    pub(crate) fn cancelled(message_id: &str, pipe_safe_code: Option<&str>) -> Self {
        let mut info = serde_json::json!({
            "message_id": message_id,
            "is_cancel": true,
            "status": "cancelled",
        });
        if let (Some(code), Value::Object(map)) = (pipe_safe_code, &mut info) {
            map.insert("pipe_safe_code".into(), Value::String(code.to_string()));
        }
        Self { data: Vec::new(), info }
    }

    /// Raw payload bytes.
    pub fn meta(&self) -> &[u8] {
        &self.data
    }

    /// Payload as UTF-8 text, when it is.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Payload parsed as JSON, when it is.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.data).ok()
    }

    /// Target handler name.
    pub fn route(&self) -> Option<&str> {
        self.info.get("route").and_then(Value::as_str)
    }

    /// Correlator id tying a response to its request.
    pub fn message_id(&self) -> Option<&str> {
        self.info.get("message_id").and_then(Value::as_str)
    }

    /// Whether this envelope answers an outstanding request.
    pub fn is_response(&self) -> bool {
        self.info.get("is_response").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Whether the peer signalled cancellation for this message id.
    pub fn is_cancel(&self) -> bool {
        self.info.get("is_cancel").and_then(Value::as_bool).unwrap_or(false)
    }

    /// The pipe this envelope arrived on (MultiPipe only). Responses must
    /// egress the same pipe.
    pub fn pipe_safe_code(&self) -> Option<&str> {
        self.info.get("pipe_safe_code").and_then(Value::as_str)
    }

    /// The full info object.
    pub fn info(&self) -> &Value {
        &self.info
    }

    /// Application headers: every info key without fabric-level meaning.
    pub fn headers(&self) -> Map<String, Value> {
        match &self.info {
            Value::Object(map) => map
                .iter()
                .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => Map::new(),
        }
    }
}

/// A handler's reply: routed back to the requester with the original
/// message id and `is_response = true`.
#[derive(Debug, Clone)]
pub struct Response {
    /// Route label stamped on the response envelope.
    pub route: String,
    /// Response payload.
    pub data: Payload,
}

impl Response {
    /// Build a response.
    pub fn new(route: impl Into<String>, data: impl Into<Payload>) -> Self {
        Self { route: route.into(), data: data.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accessors_read_info() {
        let req = Request::new(
            br#"{"n":1}"#.to_vec(),
            json!({
                "route": "calc",
                "message_id": "abcd1234",
                "is_response": false,
                "pipe_safe_code": "pppppp",
                "X-Trace": "t1",
            }),
        );
        assert_eq!(req.route(), Some("calc"));
        assert_eq!(req.message_id(), Some("abcd1234"));
        assert!(!req.is_response());
        assert!(!req.is_cancel());
        assert_eq!(req.pipe_safe_code(), Some("pppppp"));
        assert_eq!(req.text(), Some(r#"{"n":1}"#));
        assert_eq!(req.json().unwrap()["n"], 1);
        let headers = req.headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["X-Trace"], "t1");
    }

    #[test]
    fn binary_payload_has_no_text_or_json() {
        let req = Request::new(vec![0xFF, 0xFE], json!({}));
        assert_eq!(req.text(), None);
        assert_eq!(req.json(), None);
        assert_eq!(req.meta(), &[0xFF, 0xFE]);
    }

    #[test]
    fn cancelled_request_shape() {
        let req = Request::cancelled("mid12345", Some("coded1"));
        assert!(req.is_cancel());
        assert_eq!(req.message_id(), Some("mid12345"));
        assert_eq!(req.pipe_safe_code(), Some("coded1"));
        assert_eq!(req.info()["status"], "cancelled");
        assert!(req.meta().is_empty());
    }

    #[test]
    fn payload_encodings() {
        assert_eq!(Payload::from("hi").into_bytes(), b"hi");
        assert_eq!(Payload::from(vec![1u8, 2]).into_bytes(), vec![1, 2]);
        let bytes = Payload::from(json!({"a": 1})).into_bytes();
        assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap()["a"], 1);
    }
}
