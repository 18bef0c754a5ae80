//! The upstream live-conversation channel, as seen by a session.
//!
//! A [`LiveConnector`] opens a duplex channel for one session and hands back a
//! [`LiveChannel`]: a shareable [`LiveHandle`] for writes and a stream of
//! [`UpstreamEvent`]s for reads. Provider crates implement these traits; the
//! session never sees provider wire formats.

use crate::translate::ConnectParams;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, pin::Pin, sync::Arc, time::Duration};
use thiserror::Error;

/// Sample rate of audio produced by the upstream channel.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Sample rate the upstream channel expects for input audio.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// One complete client-to-upstream conversational input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub content: String,
    pub end_of_turn: bool,
}

impl Turn {
    /// A terminal turn. Inbound messages are never chunked, so this is the only
    /// constructor the bridge uses.
    pub fn complete(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            end_of_turn: true,
        }
    }
}

/// Encoding of an audio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// 16-bit signed little-endian PCM, mono.
    Pcm16,
}

/// A function invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// The client's answer to a [`FunctionCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResult {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub response: Value,
}

/// Input forwarded from the client to the upstream channel.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamInput {
    Turn(Turn),
    /// Raw PCM16 input audio. Format conversion is the caller's job.
    Audio { data: Bytes, mime_type: String },
    FunctionResult(FunctionResult),
}

/// How bad an upstream error report is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Reported to the client; the session keeps running.
    Recoverable,
    /// The channel is unusable; the session must be torn down.
    Fatal,
}

/// An event read from the upstream channel.
///
/// Text and audio for the same turn are not ordered relative to each other;
/// only the order within each kind is meaningful.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    TextDelta(String),
    AudioChunk {
        data: Bytes,
        sample_rate: u32,
        format: AudioFormat,
    },
    SystemNotice(String),
    ErrorNotice {
        message: String,
        severity: Severity,
    },
    FunctionCall(FunctionCall),
    /// The model finished its response for the current turn.
    TurnComplete,
    Closed,
}

/// Stream of events for one open channel. Ends after [`UpstreamEvent::Closed`].
pub type EventStream = Pin<Box<dyn Stream<Item = UpstreamEvent> + Send>>;

/// An open upstream channel, split into its write and read halves.
pub struct LiveChannel {
    pub handle: Arc<dyn LiveHandle>,
    pub events: EventStream,
}

impl fmt::Debug for LiveChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveChannel").finish_non_exhaustive()
    }
}

/// Errors raised while opening the upstream channel.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection failed: {0}")]
    Transport(String),

    #[error("Upstream rejected the session: {0}")]
    Rejected(String),

    #[error("Upstream setup timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid connection parameters: {0}")]
    InvalidParams(String),
}

impl ConnectError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectError::Transport(_) | ConnectError::Timeout(_))
    }
}

/// Errors raised while writing to an open channel.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("upstream channel is closed")]
    Closed,

    #[error("failed to write to upstream channel: {0}")]
    Io(String),

    #[error("failed to encode upstream message: {0}")]
    Encode(String),
}

/// Write half of an open channel.
///
/// `send` must either deliver the input or fail; it never drops silently.
/// `close` is idempotent.
#[async_trait]
pub trait LiveHandle: Send + Sync {
    async fn send(&self, input: UpstreamInput) -> Result<(), SendError>;

    async fn close(&self);
}

/// Opens upstream channels. One call yields one exclusively-owned channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn open(&self, params: &ConnectParams) -> Result<LiveChannel, ConnectError>;
}
