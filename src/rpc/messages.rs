//! Wire message types.
//!
//! Every message is a serde type serialised with `postcard` and wrapped in a
//! varint length prefix by [`codec`](super::codec).
//!
//! ```text
//!  RPC connection                       Stream connection
//!  ─────────────────────────────        ──────────────────────────
//!  C → S  ConnectionRequest::Rpc        C → S  ConnectionRequest::Stream
//!  S → C  ConnectionResponse            S → C  ConnectionResponse
//!  C → S  Request ...                   S → C  StreamMessage ... (per tick)
//!  S → C  Response ...
//! ```

use core::cell::Cell;
use core::fmt;
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Longest accepted client name in an RPC handshake.
pub const MAX_CLIENT_NAME: usize = 32;

/// Subscription handle returned by `AddStream`.
pub type StreamId = u64;

/// Opaque host object handle.
pub type ObjectHandle = u64;

/// Deepest nesting of values accepted from the wire.
pub const MAX_VALUE_DEPTH: usize = 64;

// ── Identity ────────────────────────────────────────────────

/// Identity shared by a client's RPC and stream connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first group is enough to tell clients apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

// ── Values ──────────────────────────────────────────────────

/// A procedure argument or result.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(ObjectHandle),
    Call(ProcedureCall),
}

thread_local! {
    static DECODE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// One level of value nesting on the current thread, released on drop.
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<Self> {
        DECODE_DEPTH.with(|depth| {
            let current = depth.get();
            if current >= MAX_VALUE_DEPTH {
                return None;
            }
            depth.set(current + 1);
            Some(Self)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DECODE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Decoding shape of [`Value`]. Variant order is the wire format and must
/// match `Value` exactly.
#[derive(Deserialize)]
#[serde(rename = "Value")]
enum WireValue {
    None,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(ObjectHandle),
    Call(ProcedureCall),
}

impl From<WireValue> for Value {
    fn from(v: WireValue) -> Self {
        match v {
            WireValue::None => Self::None,
            WireValue::Bool(b) => Self::Bool(b),
            WireValue::Int(i) => Self::Int(i),
            WireValue::UInt(u) => Self::UInt(u),
            WireValue::Float(f) => Self::Float(f),
            WireValue::Str(s) => Self::Str(s),
            WireValue::Bytes(b) => Self::Bytes(b),
            WireValue::List(l) => Self::List(l),
            WireValue::Map(m) => Self::Map(m),
            WireValue::Object(h) => Self::Object(h),
            WireValue::Call(c) => Self::Call(c),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Some(_level) = DepthGuard::enter() else {
            return Err(<D::Error as serde::de::Error>::custom(format!(
                "values nested deeper than {MAX_VALUE_DEPTH}"
            )));
        };
        WireValue::deserialize(deserializer).map(Self::from)
    }
}

impl Value {
    /// Short type name used in argument errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Object(_) => "object",
            Self::Call(_) => "call",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectHandle> {
        match self {
            Self::Object(h) => Some(*h),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

// ── Requests ────────────────────────────────────────────────

/// A (service, procedure, arguments) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureCall {
    pub service: String,
    pub procedure: String,
    pub arguments: Vec<Value>,
}

impl ProcedureCall {
    pub fn new(service: &str, procedure: &str, arguments: Vec<Value>) -> Self {
        Self {
            service: service.to_owned(),
            procedure: procedure.to_owned(),
            arguments,
        }
    }
}

impl fmt::Display for ProcedureCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.service, self.procedure, self.arguments.len())
    }
}

/// One decoded call from an RPC connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Echoed back in the matching [`Response`] when present.
    pub call_id: Option<u32>,
    pub call: ProcedureCall,
}

impl Request {
    pub fn new(call: ProcedureCall) -> Self {
        Self { call_id: None, call }
    }

    pub fn with_id(call_id: u32, call: ProcedureCall) -> Self {
        Self {
            call_id: Some(call_id),
            call,
        }
    }
}

// ── Responses ───────────────────────────────────────────────

/// Failure categories reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ProcedureNotFound,
    InvalidArgument,
    ProcedureFailed,
    SubscriptionNotFound,
    /// The client exceeded its request rate; the call was not executed.
    RateLimited,
    /// The connection's pending queue was full; the call was not executed.
    Overloaded,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProcedureNotFound => "procedure not found",
            Self::InvalidArgument => "invalid argument",
            Self::ProcedureFailed => "procedure failed",
            Self::SubscriptionNotFound => "subscription not found",
            Self::RateLimited => "rate limited",
            Self::Overloaded => "overloaded",
        };
        f.write_str(s)
    }
}

/// A structured failure: kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(service: &str, procedure: &str) -> Self {
        Self::new(
            ErrorKind::ProcedureNotFound,
            format!("procedure {service}.{procedure} not found"),
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProcedureFailed, message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of one call, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Success(Value),
    Failure(Failure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success(v) => Some(v),
            Self::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(f) => Some(f),
        }
    }
}

impl From<Result<Value, Failure>> for Outcome {
    fn from(r: Result<Value, Failure>) -> Self {
        match r {
            Ok(v) => Self::Success(v),
            Err(f) => Self::Failure(f),
        }
    }
}

/// Reply to exactly one [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub call_id: Option<u32>,
    pub outcome: Outcome,
}

// ── Stream push ─────────────────────────────────────────────

/// Current value (or failure) of one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    pub id: StreamId,
    pub outcome: Outcome,
}

/// All changed subscription results of one client for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamMessage {
    pub results: Vec<StreamResult>,
}

// ── Handshake ───────────────────────────────────────────────

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionRequest {
    Rpc {
        client_name: heapless::String<MAX_CLIENT_NAME>,
    },
    Stream {
        client_id: ClientId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Ok,
    MalformedMessage,
    /// RPC handshake on the stream port, or the reverse.
    WrongType,
    /// Stream handshake for a client without a live RPC connection.
    UnknownClient,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub status: ConnectionStatus,
    pub message: String,
    pub client_id: Option<ClientId>,
}

impl ConnectionResponse {
    pub fn ok(client_id: ClientId) -> Self {
        Self {
            status: ConnectionStatus::Ok,
            message: String::new(),
            client_id: Some(client_id),
        }
    }

    pub fn rejected(status: ConnectionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            client_id: None,
        }
    }
}
