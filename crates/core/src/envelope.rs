//! Client-facing wire protocol.
//!
//! Decoding happens in two steps. [`decode`] checks the shape of a frame and
//! resolves its discriminator into a closed [`Kind`]; it never looks inside
//! the payload. [`ClientRequest::try_from`] then types the payload of a
//! client-direction envelope. Outbound traffic is built as [`ServerEnvelope`]
//! values and serialized with [`encode`].

use crate::{
    audio::{self, AudioInput, AudioPayloadError},
    upstream::{AudioFormat, FunctionCall, FunctionResult, Turn},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::error;

/// Envelope discriminator. Unrecognized tags are rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Config,
    Message,
    Audio,
    FunctionResult,
    Response,
    AudioResponse,
    System,
    Error,
    ConfigAck,
    FunctionCall,
    TurnComplete,
}

impl Kind {
    /// Resolves a wire tag. Matching ignores case, `_` and `-`, so `Config`,
    /// `config` and `CONFIG` are the same tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let normalized: String = tag
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let kind = match normalized.as_str() {
            "config" => Kind::Config,
            "message" | "text" => Kind::Message,
            "audio" => Kind::Audio,
            "functionresult" => Kind::FunctionResult,
            "response" => Kind::Response,
            "audioresponse" => Kind::AudioResponse,
            "system" => Kind::System,
            "error" => Kind::Error,
            "configack" | "configsuccess" => Kind::ConfigAck,
            "functioncall" => Kind::FunctionCall,
            "turncomplete" => Kind::TurnComplete,
            _ => return None,
        };
        Some(kind)
    }

    /// The tag written on the wire for this kind.
    pub fn wire_tag(self) -> &'static str {
        match self {
            Kind::Config => "config",
            Kind::Message => "message",
            Kind::Audio | Kind::AudioResponse => "audio",
            Kind::FunctionResult => "function_result",
            Kind::Response => "response",
            Kind::System => "system",
            Kind::Error => "error",
            Kind::ConfigAck => "config_success",
            Kind::FunctionCall => "function_call",
            Kind::TurnComplete => "turn_complete",
        }
    }
}

/// A decoded frame: a known kind plus an uninterpreted payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: Kind,
    pub payload: Value,
}

/// Shape errors found while decoding a frame.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("Invalid message format: {0}")]
    Malformed(String),

    #[error("Invalid message format: expected a JSON object")]
    NotAnObject,

    #[error("Invalid message format: missing 'type' field")]
    MissingKind,

    #[error("Unknown message type '{0}'")]
    UnknownKind(String),
}

/// Decodes one raw client frame.
///
/// The discriminator is read from `type`, falling back to `kind`. The payload
/// is the `data` field when present and non-null, otherwise the remaining
/// top-level fields.
pub fn decode(raw: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let tag = match fields.remove("type").or_else(|| fields.remove("kind")) {
        Some(Value::String(tag)) => tag,
        _ => return Err(DecodeError::MissingKind),
    };
    let kind = Kind::from_tag(&tag).ok_or(DecodeError::UnknownKind(tag))?;

    let payload = match fields.remove("data") {
        Some(data) if !data.is_null() => data,
        _ => Value::Object(fields),
    };
    Ok(Envelope { kind, payload })
}

/// Nested generation parameters, as some clients send them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default, alias = "maxOutputTokens", alias = "max_tokens")]
    pub max_output_tokens: Option<i64>,
}

/// Payload of a `config` envelope. Validation is the translator's job; this
/// type only fixes the field names.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default, alias = "maxOutputTokens", alias = "max_tokens")]
    pub max_output_tokens: Option<i64>,
    #[serde(default, alias = "generationConfig")]
    pub generation_config: Option<GenerationRequest>,
    #[serde(
        default,
        alias = "response_modalities",
        alias = "responseModalities"
    )]
    pub modalities: Option<Vec<String>>,
    #[serde(default, alias = "voice_name", alias = "voiceName")]
    pub voice: Option<String>,
    #[serde(default, alias = "systemInstruction", alias = "instructions")]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub enable_code_execution: Option<bool>,
    #[serde(default)]
    pub enable_google_search: Option<bool>,

    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// A typed client-direction envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Config(Box<ConfigRequest>),
    Message(Turn),
    Audio(AudioInput),
    FunctionResult(FunctionResult),
}

/// A well-formed frame whose payload cannot be used.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("'{0}' messages are not accepted from clients")]
    UnexpectedKind(&'static str),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },

    /// Audio the bridge will not convert. Reported as a notice, not an error.
    #[error("Audio requires PCM format - {0} is not supported")]
    UnsupportedAudio(String),
}

impl TryFrom<Envelope> for ClientRequest {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let kind = envelope.kind;
        let invalid = |reason: String| ProtocolError::InvalidPayload {
            kind: kind.wire_tag(),
            reason,
        };
        match kind {
            Kind::Config => serde_json::from_value::<ConfigRequest>(envelope.payload)
                .map(|c| ClientRequest::Config(Box::new(c)))
                .map_err(|e| invalid(e.to_string())),
            Kind::Message => {
                let text = flatten_text(&envelope.payload)
                    .ok_or_else(|| invalid("expected text content".into()))?;
                if text.is_empty() {
                    return Err(invalid("message text is empty".into()));
                }
                Ok(ClientRequest::Message(Turn::complete(text)))
            }
            Kind::Audio => match audio::parse_audio_payload(&envelope.payload) {
                Ok(input) => Ok(ClientRequest::Audio(input)),
                Err(AudioPayloadError::Unsupported(format)) => {
                    Err(ProtocolError::UnsupportedAudio(format))
                }
                Err(e) => Err(invalid(e.to_string())),
            },
            Kind::FunctionResult => {
                serde_json::from_value::<FunctionResult>(envelope.payload)
                    .map(ClientRequest::FunctionResult)
                    .map_err(|e| invalid(e.to_string()))
            }
            other => Err(ProtocolError::UnexpectedKind(other.wire_tag())),
        }
    }
}

/// Flattens message content to plain text.
///
/// Accepts a bare string, an object with `text`, `content` or `parts`, or an
/// array of parts. Parts are strings or objects with a `text` field; text
/// parts are joined with newlines and non-text parts are skipped.
fn flatten_text(payload: &Value) -> Option<String> {
    match payload {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<String> = parts.iter().filter_map(part_text).collect();
            if texts.is_empty() && !parts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        Value::Object(fields) => text_field(fields),
        _ => None,
    }
}

fn text_field(fields: &Map<String, Value>) -> Option<String> {
    ["text", "content", "parts"]
        .iter()
        .find_map(|key| fields.get(*key))
        .and_then(flatten_text)
}

fn part_text(part: &Value) -> Option<String> {
    match part {
        Value::String(s) => Some(s.clone()),
        Value::Object(fields) => match fields.get("text") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// An outbound envelope. Every variant serializes; see [`encode`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// One text delta. Clients accumulate deltas themselves.
    Response { text: String, turn: u64 },
    /// One chunk of output audio, base64 encoded.
    #[serde(rename = "audio")]
    AudioResponse {
        data: String,
        format: AudioFormat,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        turn: u64,
    },
    System { data: String },
    Error { data: String },
    #[serde(rename = "config_success")]
    ConfigAck {
        message: String,
        /// False when the config arrived after the upstream channel was
        /// already open and was therefore not applied.
        applied: bool,
        client_id: Option<String>,
        ip: Option<String>,
    },
    FunctionCall { data: FunctionCall, turn: u64 },
    TurnComplete { turn: u64 },
}

impl ServerEnvelope {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEnvelope::Error {
            data: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        ServerEnvelope::System {
            data: message.into(),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            ServerEnvelope::Response { .. } => Kind::Response,
            ServerEnvelope::AudioResponse { .. } => Kind::AudioResponse,
            ServerEnvelope::System { .. } => Kind::System,
            ServerEnvelope::Error { .. } => Kind::Error,
            ServerEnvelope::ConfigAck { .. } => Kind::ConfigAck,
            ServerEnvelope::FunctionCall { .. } => Kind::FunctionCall,
            ServerEnvelope::TurnComplete { .. } => Kind::TurnComplete,
        }
    }
}

/// Serializes an outbound envelope to its JSON text.
pub fn encode(envelope: &ServerEnvelope) -> String {
    match serde_json::to_string(envelope) {
        Ok(json) => json,
        Err(e) => {
            error!(kind = ?envelope.kind(), "Failed to serialize outgoing envelope: {}", e);
            serde_json::json!({ "type": "error", "data": "failed to encode server message" })
                .to_string()
        }
    }
}
