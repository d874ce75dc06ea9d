//! Gremlin Server wire envelopes
//!
//! Requests go out as binary frames: a one-byte mime length, the mime type,
//! then the JSON envelope `{ requestId, op, processor, args }`.
//! Responses come back as plain JSON:
//! `{ requestId, status: { message, code, attributes }, result: { data, meta } }`.
//!
//! The result payload stays opaque here. The only structural unwrapping is
//! the GraphSON `g:List` wrapper around the top-level data list.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::types::{Result, SessionError};

/// Mime type announced in the request frame header
pub const MIME_TYPE: &str = "application/vnd.gremlin-v3.0+json";

/// Default script language for `eval` requests
pub const DEFAULT_LANGUAGE: &str = "gremlin-groovy";

/// Opaque token correlating a request with its response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh random (v4 UUID) identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Response status codes handled by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    NoContent,
    PartialContent,
    Unauthorized,
    AuthenticationRequired,
    MalformedRequest,
    InvalidRequestArguments,
    ServerError,
    ScriptEvaluationError,
    ServerTimeout,
    ServerSerializationError,
    Other(u16),
}

impl StatusCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            200 => Self::Success,
            204 => Self::NoContent,
            206 => Self::PartialContent,
            401 => Self::Unauthorized,
            407 => Self::AuthenticationRequired,
            498 => Self::MalformedRequest,
            499 => Self::InvalidRequestArguments,
            500 => Self::ServerError,
            597 => Self::ScriptEvaluationError,
            598 => Self::ServerTimeout,
            599 => Self::ServerSerializationError,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::NoContent => 204,
            Self::PartialContent => 206,
            Self::Unauthorized => 401,
            Self::AuthenticationRequired => 407,
            Self::MalformedRequest => 498,
            Self::InvalidRequestArguments => 499,
            Self::ServerError => 500,
            Self::ScriptEvaluationError => 597,
            Self::ServerTimeout => 598,
            Self::ServerSerializationError => 599,
            Self::Other(code) => code,
        }
    }

    /// 200 and 204 complete a request successfully
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::NoContent)
    }

    /// Everything but 206 ends the response stream for a request
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::PartialContent)
    }
}

/// A script submission
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub gremlin: String,
    pub bindings: Map<String, Value>,
    pub language: String,
    pub aliases: Map<String, Value>,
}

impl Query {
    pub fn new(gremlin: impl Into<String>) -> Self {
        Self {
            gremlin: gremlin.into(),
            bindings: Map::new(),
            language: DEFAULT_LANGUAGE.to_string(),
            aliases: Map::new(),
        }
    }

    /// Bind a script parameter
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    /// Alias a traversal source (e.g. `g` → `graph_g`)
    pub fn alias(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.aliases
            .insert(name.into(), Value::String(target.into()));
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    fn into_args(self) -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("gremlin".into(), Value::String(self.gremlin));
        args.insert("language".into(), Value::String(self.language));
        if !self.bindings.is_empty() {
            args.insert("bindings".into(), Value::Object(self.bindings));
        }
        if !self.aliases.is_empty() {
            args.insert("aliases".into(), Value::Object(self.aliases));
        }
        args
    }
}

impl From<&str> for Query {
    fn from(gremlin: &str) -> Self {
        Query::new(gremlin)
    }
}

impl From<String> for Query {
    fn from(gremlin: String) -> Self {
        Query::new(gremlin)
    }
}

/// Outbound envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub op: String,
    #[serde(default)]
    pub processor: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl RequestEnvelope {
    /// Script evaluation request
    pub fn eval(request_id: RequestId, query: Query) -> Self {
        Self {
            request_id,
            op: "eval".to_string(),
            processor: String::new(),
            args: query.into_args(),
        }
    }

    /// SASL answer to a 407 challenge. Reuses the id of the challenged request.
    pub fn authentication(request_id: RequestId, sasl: &[u8]) -> Self {
        let mut args = Map::new();
        args.insert(
            "sasl".into(),
            Value::String(base64::engine::general_purpose::STANDARD.encode(sasl)),
        );
        args.insert("saslMechanism".into(), Value::String("PLAIN".into()));
        Self {
            request_id,
            op: "authentication".to_string(),
            processor: String::new(),
            args,
        }
    }
}

/// `status` object of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseStatus {
    #[serde(default)]
    pub message: String,
    pub code: u16,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ResponseStatus {
    pub fn code(&self) -> StatusCode {
        StatusCode::from_u16(self.code)
    }
}

/// `result` object of a response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseResult {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

/// Inbound envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    pub status: ResponseStatus,
    #[serde(default)]
    pub result: ResponseResult,
}

impl ResponseEnvelope {
    /// Items of `result.data`, with a top-level `g:List` wrapper removed
    pub fn into_items(self) -> Vec<Value> {
        flatten_data(self.result.data)
    }
}

/// Final value handed to a `submit` caller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Result items in arrival order (partial batches concatenated)
    pub data: Vec<Value>,
    /// `result.meta` of the terminal response
    pub meta: Map<String, Value>,
    /// `status.attributes` of the terminal response
    pub attributes: Map<String, Value>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A terminal response with any earlier 206 batches merged in
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: ResponseStatus,
    pub data: Vec<Value>,
    pub meta: Map<String, Value>,
}

impl Completion {
    /// Merge accumulated partial items with the terminal response
    pub fn new(mut partial: Vec<Value>, terminal: ResponseEnvelope) -> Self {
        let status = terminal.status.clone();
        let meta = terminal.result.meta.clone();
        partial.extend(terminal.into_items());
        Self {
            status,
            data: partial,
            meta,
        }
    }

    pub fn code(&self) -> StatusCode {
        self.status.code()
    }

    pub fn into_result(self) -> QueryResult {
        QueryResult {
            data: self.data,
            meta: self.meta,
            attributes: self.status.attributes,
        }
    }
}

/// Split `result.data` into items.
fn flatten_data(data: Value) -> Vec<Value> {
    match data {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let is_list = matches!(map.get("@type"), Some(Value::String(t)) if t == "g:List");
            if is_list {
                match map.remove("@value") {
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                    None => Vec::new(),
                }
            } else {
                vec![Value::Object(map)]
            }
        }
        other => vec![other],
    }
}

/// Encode a request envelope into a binary frame with the mime header.
pub fn encode_request(envelope: &RequestEnvelope) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(envelope)?;
    let mime = MIME_TYPE.as_bytes();

    let mut frame = Vec::with_capacity(1 + mime.len() + body.len());
    // MIME_TYPE is a short constant, well under 256 bytes
    frame.push(mime.len() as u8);
    frame.extend_from_slice(mime);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a request frame, with or without the mime header.
pub fn decode_request(frame: &[u8]) -> Result<RequestEnvelope> {
    let body = strip_mime_header(frame);
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(SessionError::Parse("empty request frame".to_string()));
    }
    Ok(serde_json::from_slice(body)?)
}

/// Decode a response frame. Empty frames are parse errors.
pub fn decode_response(frame: &[u8]) -> Result<ResponseEnvelope> {
    if frame.iter().all(u8::is_ascii_whitespace) {
        return Err(SessionError::Parse("empty response frame".to_string()));
    }
    Ok(serde_json::from_slice(frame)?)
}

fn strip_mime_header(frame: &[u8]) -> &[u8] {
    if let Some((&len, rest)) = frame.split_first() {
        let len = len as usize;
        if rest.len() >= len && rest[..len].starts_with(b"application/") {
            return &rest[len..];
        }
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NEW_VERTEX_RESPONSE: &str = r#"
    {
        "requestId": "61616161-6161-6161-2d61-6161612d6161",
        "status": { "message": "", "code": 200, "attributes": {} },
        "result": {
            "data": [{
                "@type": "g:Vertex",
                "@value": {
                    "id": { "@type": "g:Int64", "@value": 28720 },
                    "label": "newvertex"
                }
            }],
            "meta": {}
        }
    }
    "#;

    #[test]
    fn test_decode_vertex_response() {
        let response = decode_response(NEW_VERTEX_RESPONSE.as_bytes()).unwrap();
        assert_eq!(
            response.request_id.as_str(),
            "61616161-6161-6161-2d61-6161612d6161"
        );
        assert_eq!(response.status.code(), StatusCode::Success);

        let items = response.into_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["@value"]["label"], "newvertex");
        assert_eq!(items[0]["@value"]["id"]["@value"], 28720);
    }

    #[test]
    fn test_decode_rejects_garbage_and_empty() {
        let bad = "\n{\n\"BADRESPONSE\"\n}\n";
        assert!(matches!(
            decode_response(bad.as_bytes()),
            Err(SessionError::Parse(_))
        ));
        assert!(matches!(decode_response(b""), Err(SessionError::Parse(_))));
        assert!(matches!(decode_response(b"  \n"), Err(SessionError::Parse(_))));
    }

    #[test]
    fn test_missing_result_defaults_to_empty() {
        let frame = br#"{"requestId":"x","status":{"code":204}}"#;
        let response = decode_response(frame).unwrap();
        assert_eq!(response.status.code(), StatusCode::NoContent);
        assert!(response.status.message.is_empty());
        assert!(response.into_items().is_empty());
    }

    #[test]
    fn test_g_list_is_unwrapped() {
        let data = json!({"@type": "g:List", "@value": [1, 2, 3]});
        assert_eq!(flatten_data(data), vec![json!(1), json!(2), json!(3)]);

        // Any other object is a single opaque item
        let vertex = json!({"@type": "g:Vertex", "@value": {"label": "v"}});
        assert_eq!(flatten_data(vertex.clone()), vec![vertex]);
    }

    #[test]
    fn test_encode_request_has_mime_header() {
        let id = RequestId::from("abc");
        let query = Query::new("g.V(x)").bind("x", 1);
        let frame = encode_request(&RequestEnvelope::eval(id.clone(), query)).unwrap();

        assert_eq!(frame[0] as usize, MIME_TYPE.len());
        assert_eq!(&frame[1..1 + MIME_TYPE.len()], MIME_TYPE.as_bytes());

        let body: Value = serde_json::from_slice(&frame[1 + MIME_TYPE.len()..]).unwrap();
        assert_eq!(body["requestId"], "abc");
        assert_eq!(body["op"], "eval");
        assert_eq!(body["processor"], "");
        assert_eq!(body["args"]["gremlin"], "g.V(x)");
        assert_eq!(body["args"]["bindings"]["x"], 1);
        assert_eq!(body["args"]["language"], DEFAULT_LANGUAGE);

        let decoded = decode_request(&frame).unwrap();
        assert_eq!(decoded.request_id, id);
    }

    #[test]
    fn test_authentication_request() {
        let envelope = RequestEnvelope::authentication(RequestId::from("id-1"), b"\0user\0pass");
        assert_eq!(envelope.op, "authentication");
        assert_eq!(envelope.args["saslMechanism"], "PLAIN");
        assert_eq!(envelope.args["sasl"], "AHVzZXIAcGFzcw==");
    }

    #[test]
    fn test_status_codes() {
        for code in [200, 204, 206, 401, 407, 498, 499, 500, 597, 598, 599, 302] {
            assert_eq!(StatusCode::from_u16(code).as_u16(), code);
        }
        assert!(StatusCode::Success.is_success());
        assert!(StatusCode::NoContent.is_success());
        assert!(!StatusCode::PartialContent.is_terminal());
        assert!(StatusCode::AuthenticationRequired.is_terminal());
        assert_eq!(StatusCode::from_u16(302), StatusCode::Other(302));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }
}
