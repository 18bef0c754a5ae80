//! Frames upstream events as outbound envelopes.

use crate::{
    envelope::ServerEnvelope,
    translate::{Modality, ModalitySet},
    upstream::{Severity, UpstreamEvent},
};
use base64::Engine;
use tracing::{debug, warn};

/// What the outbound pump should do with a routed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Write these envelopes to the client, in order.
    Envelopes(Vec<ServerEnvelope>),
    /// The channel failed; tear the session down and report this message.
    Fault(String),
    /// The channel closed; tear the session down quietly.
    Closed,
}

/// Classifies upstream events and tags them with the turn they belong to.
///
/// Turns are numbered from 1 and advance on every `TurnComplete`. Text is
/// never buffered across deltas. When AUDIO is configured, a turn that
/// produced audio but no text is closed with an empty `Response` so every
/// audio turn has a text counterpart; when AUDIO is not configured, audio
/// chunks are dropped.
#[derive(Debug)]
pub struct ModalityRouter {
    modalities: ModalitySet,
    turn: u64,
    text_seen: bool,
    audio_seen: bool,
}

impl ModalityRouter {
    pub fn new(modalities: ModalitySet) -> Self {
        Self {
            modalities,
            turn: 1,
            text_seen: false,
            audio_seen: false,
        }
    }

    /// The turn the next event will be attributed to.
    pub fn current_turn(&self) -> u64 {
        self.turn
    }

    pub fn route(&mut self, event: UpstreamEvent) -> Routed {
        let turn = self.turn;
        match event {
            UpstreamEvent::TextDelta(text) => {
                if text.is_empty() {
                    return Routed::Envelopes(Vec::new());
                }
                self.text_seen = true;
                Routed::Envelopes(vec![ServerEnvelope::Response { text, turn }])
            }
            UpstreamEvent::AudioChunk {
                data,
                sample_rate,
                format,
            } => {
                if !self.modalities.contains(Modality::Audio) {
                    warn!(turn, bytes = data.len(), "Dropping audio chunk: AUDIO modality not configured");
                    return Routed::Envelopes(Vec::new());
                }
                self.audio_seen = true;
                Routed::Envelopes(vec![ServerEnvelope::AudioResponse {
                    data: base64::engine::general_purpose::STANDARD.encode(&data),
                    format,
                    sample_rate,
                    turn,
                }])
            }
            UpstreamEvent::SystemNotice(message) => {
                Routed::Envelopes(vec![ServerEnvelope::system(message)])
            }
            UpstreamEvent::ErrorNotice {
                message,
                severity: Severity::Recoverable,
            } => Routed::Envelopes(vec![ServerEnvelope::error(message)]),
            UpstreamEvent::ErrorNotice {
                message,
                severity: Severity::Fatal,
            } => Routed::Fault(message),
            UpstreamEvent::FunctionCall(call) => {
                Routed::Envelopes(vec![ServerEnvelope::FunctionCall { data: call, turn }])
            }
            UpstreamEvent::TurnComplete => {
                let mut envelopes = Vec::with_capacity(2);
                if self.audio_seen && !self.text_seen {
                    debug!(turn, "Turn produced audio without text; emitting empty response");
                    envelopes.push(ServerEnvelope::Response {
                        text: String::new(),
                        turn,
                    });
                }
                envelopes.push(ServerEnvelope::TurnComplete { turn });
                self.turn += 1;
                self.text_seen = false;
                self.audio_seen = false;
                Routed::Envelopes(envelopes)
            }
            UpstreamEvent::Closed => Routed::Closed,
        }
    }
}
