//! Input audio payloads.
//!
//! Clients send PCM16 audio as base64 inside an `audio` envelope. The bridge
//! never transcodes: anything that is not PCM is turned away.

use base64::Engine;
use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

/// Mime type assumed when a client sends a bare base64 string.
pub const DEFAULT_INPUT_MIME: &str = "audio/pcm";

/// Decoded client audio ready to forward upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioInput {
    pub data: Bytes,
    pub mime_type: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum AudioPayloadError {
    #[error("expected base64 audio data")]
    MissingData,

    #[error("audio data is not valid base64")]
    InvalidBase64,

    #[error("{0}")]
    Unsupported(String),
}

/// Parses the payload of an `audio` envelope.
///
/// The payload is either a base64 string or an object carrying the data under
/// `base64`, `data` or `b64`, with optional `mime_type`/`mimeType` and
/// `format`/`codec` hints.
pub fn parse_audio_payload(payload: &Value) -> Result<AudioInput, AudioPayloadError> {
    let (encoded, mime_type, format) = match payload {
        Value::String(s) => (Some(s.as_str()), None, None),
        Value::Object(fields) => (
            first_str(fields, &["base64", "data", "b64"]),
            first_str(fields, &["mime_type", "mimeType"]),
            first_str(fields, &["format", "codec"]),
        ),
        _ => (None, None, None),
    };

    let mime_type = mime_type.unwrap_or(DEFAULT_INPUT_MIME);
    if !is_pcm_mime(mime_type) {
        return Err(AudioPayloadError::Unsupported(mime_type.to_string()));
    }
    if let Some(format) = format
        && format.to_ascii_lowercase().contains("webm")
    {
        return Err(AudioPayloadError::Unsupported(format.to_string()));
    }

    let encoded = encoded
        .filter(|s| !s.is_empty())
        .ok_or(AudioPayloadError::MissingData)?;
    let data = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| AudioPayloadError::InvalidBase64)?;

    Ok(AudioInput {
        data: Bytes::from(data),
        mime_type: mime_type.to_string(),
    })
}

/// `audio/pcm`, optionally with parameters such as `;rate=16000`.
pub fn is_pcm_mime(mime: &str) -> bool {
    mime.split(';')
        .next()
        .is_some_and(|base| base.trim().eq_ignore_ascii_case("audio/pcm"))
}

/// Reads the `rate` parameter of a mime type like `audio/pcm;rate=24000`.
pub fn sample_rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("rate") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn first_str<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| fields.get(*k).and_then(Value::as_str))
}
