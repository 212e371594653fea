// bridge-protocol: Wire types shared by the cloud bridge uplink and the local
// realtime link.
//
// Every WebSocket text frame is one JSON object `{ "event", "data", "ack" }`.
// `Frame` is the raw envelope; `BridgeMessage` is its typed view, keyed by the
// event name.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub mod transport;

pub use transport::{Connection, Connector, FrameSink, FrameStream, TransportError};

/// Event names as they appear on the wire.
pub mod events {
    pub const IDENTIFY: &str = "identify";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SYSTEM: &str = "system";
    pub const API_REQUEST: &str = "api-request";
    pub const API_RESPONSE: &str = "api-response";
    pub const ACK: &str = "ack";
    pub const WATCH_REGISTER: &str = "watch-register";
    pub const UNWATCH_REGISTER: &str = "unwatch-register";
    pub const WATCH_REGISTER_MOBILE: &str = "watch-register-mobile";
    pub const UNWATCH_REGISTER_MOBILE: &str = "unwatch-register-mobile";
    pub const REGISTER_VALUE: &str = "register-value";
    pub const FORWARD_REGISTER_VALUE: &str = "forward-register-value";
}

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Correlation token chosen by the cloud side. Opaque to the agent: it may be
/// a string or a number and is echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Value);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(Value::String(s.to_owned()))
    }
}

/// Identity of a watched register: `"{analyzerId}-{address}"`.
///
/// The same key is derived on watch, unwatch and incoming value events, so
/// the format must never change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterKey(String);

impl RegisterKey {
    pub fn new(analyzer_id: &str, address: i64) -> Self {
        RegisterKey(format!("{}-{}", analyzer_id, address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A register the cloud side wants to watch.
///
/// Only `analyzerId` and `address` matter to the agent. Every other field
/// (data type, bit, register id, ...) is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterWatchDescriptor {
    /// Accepted as a JSON string or number; numbers are kept as their decimal text.
    #[serde(rename = "analyzerId", deserialize_with = "string_or_number")]
    pub analyzer_id: String,
    pub address: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RegisterWatchDescriptor {
    pub fn new(analyzer_id: impl Into<String>, address: i64) -> Self {
        RegisterWatchDescriptor {
            analyzer_id: analyzer_id.into(),
            address,
            extra: Map::new(),
        }
    }

    pub fn key(&self) -> RegisterKey {
        RegisterKey::new(&self.analyzer_id, self.address)
    }
}

/// A register value update: the descriptor fields plus the current `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterValue {
    #[serde(flatten)]
    pub register: RegisterWatchDescriptor,
    #[serde(default)]
    pub value: Value,
}

impl RegisterValue {
    pub fn key(&self) -> RegisterKey {
        self.register.key()
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Cloud -> Agent messages
// ---------------------------------------------------------------------------

/// An HTTP-shaped request the cloud side wants executed against the local API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedRequest {
    pub request_id: RequestId,
    /// HTTP method name, e.g. `"GET"`. Validated by the agent, not here.
    pub method: String,
    /// Path (and query) appended to the local API base URL.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Informational message from the bridge. Logged only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    #[serde(default)]
    pub message: String,
}

// ---------------------------------------------------------------------------
// Agent -> Cloud messages
// ---------------------------------------------------------------------------

/// Sent once per cloud session, right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub version: String,
    pub hostname: String,
    pub platform: String,
    #[serde(
        rename = "agentName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_name: Option<String>,
}

/// Raw-text envelope used when the local API answers with something that is
/// not (valid) JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonJsonBody {
    pub content: String,
    pub content_type: String,
    /// Always `true`; lets the cloud side tell the envelope from a JSON body.
    pub is_non_json_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

/// Body of a forwarded response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    NonJson(NonJsonBody),
    Json(Value),
}

/// Status and body of a forwarded call, as delivered through an ack callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiReply {
    pub status: u16,
    pub data: ResponseData,
}

/// The answer to exactly one `ForwardedRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedResponse {
    pub request_id: RequestId,
    pub status: u16,
    pub data: ResponseData,
}

impl ForwardedResponse {
    /// The 500 envelope used for every failure inside the agent.
    pub fn agent_error(request_id: RequestId, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            message = "Unknown error occurred".to_owned();
        }
        ForwardedResponse {
            request_id,
            status: 500,
            data: ResponseData::Json(serde_json::json!({
                "error": "Agent Error",
                "message": message,
            })),
        }
    }

    /// Split into the correlation id and the callback payload.
    pub fn into_reply(self) -> (RequestId, ApiReply) {
        (
            self.request_id,
            ApiReply {
                status: self.status,
                data: self.data,
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Frame envelope
// ---------------------------------------------------------------------------

/// One WebSocket text frame.
///
/// ```json
/// { "event": "api-request", "data": { ... }, "ack": 7 }
/// ```
///
/// `ack` on an inbound frame asks for a per-call callback; the reply carries
/// the same id with event `ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Frame {
            event: event.into(),
            data,
            ack: None,
        }
    }

    pub fn with_ack(mut self, ack: u64) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Build the callback frame answering the inbound frame that carried `ack`.
    pub fn reply(ack: u64, reply: ApiReply) -> Result<Self, FrameError> {
        Ok(Frame::new(events::ACK, serde_json::to_value(reply)?).with_ack(ack))
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid `{event}` payload: {source}")]
    Payload {
        event: String,
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Typed messages
// ---------------------------------------------------------------------------

/// All events either link understands.
///
/// The cloud link uses `Identify`, `Ping`, `ApiResponse`, `Ack` and
/// `ForwardRegisterValue` outbound; the local realtime link uses
/// `WatchRegister`/`UnwatchRegister` outbound and `RegisterValue` inbound.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    Identify(Identify),
    Ping,
    Pong(Value),
    System(SystemMessage),
    ApiRequest(ForwardedRequest),
    ApiResponse(ForwardedResponse),
    Ack(ApiReply),
    WatchRegister(RegisterWatchDescriptor),
    UnwatchRegister(RegisterWatchDescriptor),
    WatchRegisterMobile(RegisterWatchDescriptor),
    UnwatchRegisterMobile(RegisterWatchDescriptor),
    RegisterValue(RegisterValue),
    ForwardRegisterValue(RegisterValue),
    /// An event this build does not know. Kept so callers can log it.
    Unknown { event: String, data: Value },
}

impl BridgeMessage {
    pub fn event(&self) -> &str {
        match self {
            BridgeMessage::Identify(_) => events::IDENTIFY,
            BridgeMessage::Ping => events::PING,
            BridgeMessage::Pong(_) => events::PONG,
            BridgeMessage::System(_) => events::SYSTEM,
            BridgeMessage::ApiRequest(_) => events::API_REQUEST,
            BridgeMessage::ApiResponse(_) => events::API_RESPONSE,
            BridgeMessage::Ack(_) => events::ACK,
            BridgeMessage::WatchRegister(_) => events::WATCH_REGISTER,
            BridgeMessage::UnwatchRegister(_) => events::UNWATCH_REGISTER,
            BridgeMessage::WatchRegisterMobile(_) => events::WATCH_REGISTER_MOBILE,
            BridgeMessage::UnwatchRegisterMobile(_) => events::UNWATCH_REGISTER_MOBILE,
            BridgeMessage::RegisterValue(_) => events::REGISTER_VALUE,
            BridgeMessage::ForwardRegisterValue(_) => events::FORWARD_REGISTER_VALUE,
            BridgeMessage::Unknown { event, .. } => event,
        }
    }
}

fn payload<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|source| FrameError::Payload {
        event: event.to_owned(),
        source,
    })
}

impl TryFrom<Frame> for BridgeMessage {
    type Error = FrameError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let Frame { event, data, .. } = frame;
        let msg = match event.as_str() {
            events::IDENTIFY => BridgeMessage::Identify(payload(&event, data)?),
            events::PING => BridgeMessage::Ping,
            events::PONG => BridgeMessage::Pong(data),
            events::SYSTEM => BridgeMessage::System(payload(&event, data)?),
            events::API_REQUEST => BridgeMessage::ApiRequest(payload(&event, data)?),
            events::API_RESPONSE => BridgeMessage::ApiResponse(payload(&event, data)?),
            events::ACK => BridgeMessage::Ack(payload(&event, data)?),
            events::WATCH_REGISTER => BridgeMessage::WatchRegister(payload(&event, data)?),
            events::UNWATCH_REGISTER => BridgeMessage::UnwatchRegister(payload(&event, data)?),
            events::WATCH_REGISTER_MOBILE => {
                BridgeMessage::WatchRegisterMobile(payload(&event, data)?)
            }
            events::UNWATCH_REGISTER_MOBILE => {
                BridgeMessage::UnwatchRegisterMobile(payload(&event, data)?)
            }
            events::REGISTER_VALUE => BridgeMessage::RegisterValue(payload(&event, data)?),
            events::FORWARD_REGISTER_VALUE => {
                BridgeMessage::ForwardRegisterValue(payload(&event, data)?)
            }
            _ => BridgeMessage::Unknown {
                event: event.clone(),
                data,
            },
        };
        Ok(msg)
    }
}

impl TryFrom<BridgeMessage> for Frame {
    type Error = FrameError;

    fn try_from(msg: BridgeMessage) -> Result<Self, Self::Error> {
        let event = msg.event().to_owned();
        let data = match msg {
            BridgeMessage::Identify(v) => serde_json::to_value(v)?,
            BridgeMessage::Ping => Value::Null,
            BridgeMessage::Pong(v) => v,
            BridgeMessage::System(v) => serde_json::to_value(v)?,
            BridgeMessage::ApiRequest(v) => serde_json::to_value(v)?,
            BridgeMessage::ApiResponse(v) => serde_json::to_value(v)?,
            BridgeMessage::Ack(v) => serde_json::to_value(v)?,
            BridgeMessage::WatchRegister(v)
            | BridgeMessage::UnwatchRegister(v)
            | BridgeMessage::WatchRegisterMobile(v)
            | BridgeMessage::UnwatchRegisterMobile(v) => serde_json::to_value(v)?,
            BridgeMessage::RegisterValue(v) | BridgeMessage::ForwardRegisterValue(v) => {
                serde_json::to_value(v)?
            }
            BridgeMessage::Unknown { data, .. } => data,
        };
        Ok(Frame::new(event, data))
    }
}
