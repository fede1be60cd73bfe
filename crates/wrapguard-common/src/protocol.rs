// ============================================
// File: crates/wrapguard-common/src/protocol.rs
// ============================================
//! # Control-Channel Wire Records
//!
//! ## Creation Reason
//! Defines the request/response records exchanged between the preloaded
//! shim and the supervisor over the local control channel. This is a
//! compatibility surface: both sides must be built from the same schema.
//!
//! ## Main Functionality
//! - `Request` / `Response`: tagged sum types, one struct per record kind
//! - `ErrorKind`: the closed set of failure kinds carried on the wire
//! - Line-oriented encode/decode (`to_line` / `from_line`)
//! - Base64 payload helpers
//!
//! ## Wire Format
//! One JSON object per line, newline-delimited, with a `type` tag:
//!
//! ```text
//! {"type":"socket","domain":"v4","transport":"stream"}
//! {"type":"created","conn_id":7}
//! {"type":"send","conn_id":7,"payload":"R0VUIC8gHQoNCg=="}
//! {"type":"error","kind":"queue_full"}
//! ```
//!
//! ## Parsing Strategy
//! Each record kind has a closed schema: unknown keys, unknown tags and
//! missing fields are all rejected as protocol violations. Decoding goes
//! through an explicit tag dispatch so the per-kind structs can carry
//! `deny_unknown_fields`.
//!
//! ## ⚠️ Important Note for Next Developer
//! - Do NOT loosen `deny_unknown_fields`: silently ignored keys are how
//!   wire drift goes unnoticed
//! - Payloads are opaque byte strings, base64 in transit
//!
//! ## Last Modified
//! v0.1.0 - Initial wire schema

use std::net::IpAddr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommonError, Result};
use crate::types::{AddressFamily, TransportKind};

// ============================================
// Request Records
// ============================================

/// Create a virtual socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocketRequest {
    /// Socket domain (v4 or v6).
    pub domain: AddressFamily,
    /// Stream or datagram.
    pub transport: TransportKind,
}

/// Bind a connection to a local endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindRequest {
    /// Target connection.
    pub conn_id: u32,
    /// Local address.
    pub address: IpAddr,
    /// Local port.
    pub port: u16,
}

/// Put a bound connection into the listening state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenRequest {
    /// Target connection.
    pub conn_id: u32,
}

/// Take one pending connection off a listener's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceptRequest {
    /// The listening connection.
    pub conn_id: u32,
}

/// Connect to a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectRequest {
    /// Target connection.
    pub conn_id: u32,
    /// Remote address.
    pub address: IpAddr,
    /// Remote port.
    pub port: u16,
}

/// Send a payload on a connected connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendRequest {
    /// Target connection.
    pub conn_id: u32,
    /// Base64-encoded payload bytes.
    pub payload: String,
}

/// Receive the next queued payload from a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecvRequest {
    /// Target connection.
    pub conn_id: u32,
}

/// Release a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloseRequest {
    /// Target connection.
    pub conn_id: u32,
}

/// Announce that the child bound a real kernel listener, so the port
/// forwarder can mirror it on the tunnel side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindNotifyRequest {
    /// Address the child bound.
    pub address: IpAddr,
    /// Port the child bound.
    pub port: u16,
    /// Stream or datagram listener.
    pub transport: TransportKind,
}

/// A control-channel request, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `socket` record.
    Socket(SocketRequest),
    /// `bind` record.
    Bind(BindRequest),
    /// `listen` record.
    Listen(ListenRequest),
    /// `accept` record.
    Accept(AcceptRequest),
    /// `connect` record.
    Connect(ConnectRequest),
    /// `send` record.
    Send(SendRequest),
    /// `recv` record.
    Recv(RecvRequest),
    /// `close` record.
    Close(CloseRequest),
    /// `bind_notify` record.
    BindNotify(BindNotifyRequest),
}

impl Request {
    /// The `type` tag for this record.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Socket(_) => "socket",
            Self::Bind(_) => "bind",
            Self::Listen(_) => "listen",
            Self::Accept(_) => "accept",
            Self::Connect(_) => "connect",
            Self::Send(_) => "send",
            Self::Recv(_) => "recv",
            Self::Close(_) => "close",
            Self::BindNotify(_) => "bind_notify",
        }
    }

    /// Serializes to one line of JSON (no trailing newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        let body = match self {
            Self::Socket(r) => serde_json::to_value(r),
            Self::Bind(r) => serde_json::to_value(r),
            Self::Listen(r) => serde_json::to_value(r),
            Self::Accept(r) => serde_json::to_value(r),
            Self::Connect(r) => serde_json::to_value(r),
            Self::Send(r) => serde_json::to_value(r),
            Self::Recv(r) => serde_json::to_value(r),
            Self::Close(r) => serde_json::to_value(r),
            Self::BindNotify(r) => serde_json::to_value(r),
        };
        finish_line(self.tag(), body)
    }

    /// Parses one line, rejecting unknown tags and unknown keys.
    pub fn from_line(line: &str) -> Result<Self> {
        let (tag, rest) = split_tagged(line)?;
        match tag.as_str() {
            "socket" => Ok(Self::Socket(from_body(rest)?)),
            "bind" => Ok(Self::Bind(from_body(rest)?)),
            "listen" => Ok(Self::Listen(from_body(rest)?)),
            "accept" => Ok(Self::Accept(from_body(rest)?)),
            "connect" => Ok(Self::Connect(from_body(rest)?)),
            "send" => Ok(Self::Send(from_body(rest)?)),
            "recv" => Ok(Self::Recv(from_body(rest)?)),
            "close" => Ok(Self::Close(from_body(rest)?)),
            "bind_notify" => Ok(Self::BindNotify(from_body(rest)?)),
            other => Err(CommonError::protocol(format!(
                "unknown request type '{other}'"
            ))),
        }
    }
}

// ============================================
// Response Records
// ============================================

/// Failure kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Domain, transport or record kind not supported.
    Unsupported,
    /// No connection with the given id.
    UnknownId,
    /// Local endpoint already claimed.
    AddressInUse,
    /// Operation requires a bound connection.
    NotBound,
    /// No listener at the given endpoint.
    NotListening,
    /// Operation requires a connected connection.
    NotConnected,
    /// Operation invalid for the connection's current state.
    InvalidState,
    /// A bounded queue was full.
    QueueFull,
    /// No payload available within the receive budget.
    NoData,
    /// No pending connection within the accept budget.
    Timeout,
    /// The routing engine found no peer for the destination.
    NoRoute,
    /// Connection establishment failed.
    ConnectFailed,
    /// Payload could not be queued for sending.
    SendFailed,
    /// The request record itself was malformed.
    Protocol,
}

impl ErrorKind {
    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unsupported => "unsupported",
            Self::UnknownId => "unknown_id",
            Self::AddressInUse => "address_in_use",
            Self::NotBound => "not_bound",
            Self::NotListening => "not_listening",
            Self::NotConnected => "not_connected",
            Self::InvalidState => "invalid_state",
            Self::QueueFull => "queue_full",
            Self::NoData => "no_data",
            Self::Timeout => "timeout",
            Self::NoRoute => "no_route",
            Self::ConnectFailed => "connect_failed",
            Self::SendFailed => "send_failed",
            Self::Protocol => "protocol",
        }
    }
}

/// A new connection id was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreatedResponse {
    /// The new connection.
    pub conn_id: u32,
}

/// A pending connection was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceptedResponse {
    /// The accepted connection.
    pub conn_id: u32,
    /// Remote address of the accepted connection.
    pub address: IpAddr,
    /// Remote port of the accepted connection.
    pub port: u16,
}

/// A payload was dequeued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataResponse {
    /// Base64-encoded payload bytes.
    pub payload: String,
}

/// The request failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    /// What went wrong.
    pub kind: ErrorKind,
}

/// A control-channel response, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Success with nothing to return.
    Ok,
    /// `created` record.
    Created(CreatedResponse),
    /// `accepted` record.
    Accepted(AcceptedResponse),
    /// `data` record.
    Data(DataResponse),
    /// `error` record.
    Error(ErrorResponse),
}

impl Response {
    /// Shorthand for an error response.
    #[must_use]
    pub const fn error(kind: ErrorKind) -> Self {
        Self::Error(ErrorResponse { kind })
    }

    /// The `type` tag for this record.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Created(_) => "created",
            Self::Accepted(_) => "accepted",
            Self::Data(_) => "data",
            Self::Error(_) => "error",
        }
    }

    /// Serializes to one line of JSON (no trailing newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        let body = match self {
            Self::Ok => Ok(Value::Object(serde_json::Map::new())),
            Self::Created(r) => serde_json::to_value(r),
            Self::Accepted(r) => serde_json::to_value(r),
            Self::Data(r) => serde_json::to_value(r),
            Self::Error(r) => serde_json::to_value(r),
        };
        finish_line(self.tag(), body)
    }

    /// Parses one line, rejecting unknown tags and unknown keys.
    pub fn from_line(line: &str) -> Result<Self> {
        let (tag, rest) = split_tagged(line)?;
        match tag.as_str() {
            "ok" => {
                if rest.is_empty() {
                    Ok(Self::Ok)
                } else {
                    Err(CommonError::protocol("unexpected fields in 'ok' record"))
                }
            }
            "created" => Ok(Self::Created(from_body(rest)?)),
            "accepted" => Ok(Self::Accepted(from_body(rest)?)),
            "data" => Ok(Self::Data(from_body(rest)?)),
            "error" => Ok(Self::Error(from_body(rest)?)),
            other => Err(CommonError::protocol(format!(
                "unknown response type '{other}'"
            ))),
        }
    }
}

// ============================================
// Payload Encoding
// ============================================

/// Encodes payload bytes for transit.
#[must_use]
pub fn encode_payload(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decodes a payload received over the channel.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(payload)
        .map_err(|e| CommonError::decoding("payload", e.to_string()))
}

// ============================================
// Line Helpers
// ============================================

/// Splits a record into its `type` tag and the remaining fields.
fn split_tagged(line: &str) -> Result<(String, serde_json::Map<String, Value>)> {
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| CommonError::protocol(format!("not a JSON record: {e}")))?;
    let Value::Object(mut fields) = value else {
        return Err(CommonError::protocol("record is not a JSON object"));
    };
    let tag = match fields.remove("type") {
        Some(Value::String(tag)) => tag,
        Some(_) => return Err(CommonError::protocol("'type' tag is not a string")),
        None => return Err(CommonError::protocol("missing 'type' tag")),
    };
    Ok((tag, fields))
}

/// Deserializes the non-tag fields into a closed record struct.
fn from_body<T: serde::de::DeserializeOwned>(fields: serde_json::Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| CommonError::protocol(e.to_string()))
}

/// Joins a tag with its serialized fields into one line.
fn finish_line(tag: &str, body: serde_json::Result<Value>) -> String {
    let mut fields = match body {
        Ok(Value::Object(fields)) => fields,
        // Record structs always serialize to objects.
        _ => serde_json::Map::new(),
    };
    let mut record = serde_json::Map::new();
    record.insert("type".into(), Value::String(tag.into()));
    record.append(&mut fields);
    Value::Object(record).to_string()
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let requests = vec![
            Request::Socket(SocketRequest {
                domain: AddressFamily::V4,
                transport: TransportKind::Stream,
            }),
            Request::Bind(BindRequest {
                conn_id: 3,
                address: "10.150.0.2".parse().unwrap(),
                port: 8080,
            }),
            Request::Listen(ListenRequest { conn_id: 3 }),
            Request::Accept(AcceptRequest { conn_id: 3 }),
            Request::Connect(ConnectRequest {
                conn_id: 4,
                address: "10.0.0.3".parse().unwrap(),
                port: 80,
            }),
            Request::Send(SendRequest {
                conn_id: 4,
                payload: encode_payload(b"GET / \r\n\r\n"),
            }),
            Request::Recv(RecvRequest { conn_id: 4 }),
            Request::Close(CloseRequest { conn_id: 4 }),
            Request::BindNotify(BindNotifyRequest {
                address: "0.0.0.0".parse().unwrap(),
                port: 8080,
                transport: TransportKind::Stream,
            }),
        ];

        for request in requests {
            let line = request.to_line();
            assert!(!line.contains('\n'));
            let parsed = Request::from_line(&line).unwrap();
            assert_eq!(parsed, request);
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let responses = vec![
            Response::Ok,
            Response::Created(CreatedResponse { conn_id: 9 }),
            Response::Accepted(AcceptedResponse {
                conn_id: 10,
                address: "10.150.0.3".parse().unwrap(),
                port: 45000,
            }),
            Response::Data(DataResponse {
                payload: encode_payload(b"hello"),
            }),
            Response::error(ErrorKind::QueueFull),
        ];

        for response in responses {
            let parsed = Response::from_line(&response.to_line()).unwrap();
            assert_eq!(parsed, response);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = Request::from_line(r#"{"type":"frobnicate","conn_id":1}"#).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err =
            Request::from_line(r#"{"type":"listen","conn_id":1,"backlog":128}"#).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_missing_field_rejected() {
        let err = Request::from_line(r#"{"type":"bind","conn_id":1,"port":80}"#).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_missing_tag_rejected() {
        let err = Request::from_line(r#"{"conn_id":1}"#).unwrap_err();
        assert!(err.is_protocol_error());

        let err = Request::from_line("not json at all").unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_ok_with_extra_fields_rejected() {
        let err = Response::from_line(r#"{"type":"ok","conn_id":1}"#).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_payload_helpers() {
        let bytes = b"GET / \r\n\r\n";
        let encoded = encode_payload(bytes);
        assert_eq!(decode_payload(&encoded).unwrap(), bytes);
        assert!(decode_payload("!!! not base64 !!!").is_err());
    }

    #[test]
    fn test_error_kind_names() {
        assert_eq!(ErrorKind::AddressInUse.as_str(), "address_in_use");
        assert_eq!(ErrorKind::NoData.as_str(), "no_data");
        let line = Response::error(ErrorKind::NotBound).to_line();
        assert!(line.contains(r#""kind":"not_bound""#));
    }
}
