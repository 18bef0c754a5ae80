//! Conversions between bridge types and Gemini Live wire messages.

use crate::types::{
    Blob, ClientContent, ClientMessage, Content, Empty, FunctionResponse, GenerationConfig, Part,
    PrebuiltVoiceConfig, RealtimeInput, ResponseModality, ServerMessage, Setup, SpeechConfig,
    Tool, ToolResponse, VoiceConfig,
};
use base64::Engine;
use bytes::Bytes;
use live_bridge_core::{
    ConnectParams, Modality, UpstreamEvent, UpstreamInput,
    audio::sample_rate_from_mime,
    upstream::{AudioFormat, FunctionCall, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE, Severity},
};
use tracing::warn;

/// Voice used for audio sessions that do not name one.
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Gemini expects fully qualified model names.
pub fn normalize_model(model: &str) -> String {
    let model = model.trim();
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

/// Builds the `setup` message for a new session.
///
/// Gemini Live answers in a single response modality. AUDIO wins when
/// requested; if TEXT was requested too, output audio transcription is
/// turned on and transcripts are surfaced as text deltas.
pub fn build_setup(params: &ConnectParams) -> Setup {
    let audio = params.modalities.contains(Modality::Audio);
    let text = params.modalities.contains(Modality::Text);

    let speech_config = audio.then(|| SpeechConfig {
        voice_config: VoiceConfig {
            prebuilt_voice_config: PrebuiltVoiceConfig {
                voice_name: params
                    .voice
                    .clone()
                    .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            },
        },
    });

    let mut tools = Vec::new();
    if params.tools.code_execution {
        tools.push(Tool {
            code_execution: Some(Empty {}),
            google_search: None,
        });
    }
    if params.tools.google_search {
        tools.push(Tool {
            code_execution: None,
            google_search: Some(Empty {}),
        });
    }

    Setup {
        model: normalize_model(&params.model),
        generation_config: GenerationConfig {
            response_modalities: vec![if audio {
                ResponseModality::Audio
            } else {
                ResponseModality::Text
            }],
            temperature: params.generation.temperature,
            max_output_tokens: params.generation.max_output_tokens,
            speech_config,
        },
        system_instruction: params.system_instruction.as_ref().map(|text| Content {
            role: None,
            parts: vec![Part { text: text.clone() }],
        }),
        tools,
        output_audio_transcription: (audio && text).then_some(Empty {}),
    }
}

/// Whether transcripts of output audio should be surfaced as text.
pub fn transcribes_audio(params: &ConnectParams) -> bool {
    params.modalities.contains(Modality::Audio) && params.modalities.contains(Modality::Text)
}

pub fn encode_input(input: UpstreamInput) -> ClientMessage {
    match input {
        UpstreamInput::Turn(turn) => ClientMessage::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part { text: turn.content }],
            }],
            turn_complete: turn.end_of_turn,
        }),
        UpstreamInput::Audio { data, mime_type } => {
            let mime_type = if sample_rate_from_mime(&mime_type).is_some() {
                mime_type
            } else {
                format!("audio/pcm;rate={INPUT_SAMPLE_RATE}")
            };
            ClientMessage::RealtimeInput(RealtimeInput {
                audio: Blob {
                    mime_type,
                    data: base64::engine::general_purpose::STANDARD.encode(&data),
                },
            })
        }
        UpstreamInput::FunctionResult(result) => ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id: result.id,
                name: result.name,
                response: result.response,
            }],
        }),
    }
}

/// Parses one server frame. Frames that are not valid server messages are
/// logged and skipped.
pub fn parse_server_message(raw: &[u8]) -> Option<ServerMessage> {
    match serde_json::from_slice::<ServerMessage>(raw) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, bytes = raw.len(), "Failed to parse Gemini message");
            None
        }
    }
}

/// Maps one server message to the events it carries, in wire order.
pub fn server_events(message: ServerMessage, transcribe_audio: bool) -> Vec<UpstreamEvent> {
    let mut events = Vec::new();

    if let Some(content) = message.server_content {
        if content.interrupted == Some(true) {
            events.push(UpstreamEvent::SystemNotice(
                "Response interrupted".to_string(),
            ));
        }
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                events.push(UpstreamEvent::TextDelta(text));
            }
            if let Some(blob) = part.inline_data {
                match base64::engine::general_purpose::STANDARD.decode(&blob.data) {
                    Ok(data) => events.push(UpstreamEvent::AudioChunk {
                        data: Bytes::from(data),
                        sample_rate: blob
                            .mime_type
                            .as_deref()
                            .and_then(sample_rate_from_mime)
                            .unwrap_or(OUTPUT_SAMPLE_RATE),
                        format: AudioFormat::Pcm16,
                    }),
                    Err(e) => {
                        warn!(error = %e, "Gemini sent undecodable audio");
                        events.push(UpstreamEvent::ErrorNotice {
                            message: "Received invalid audio data from upstream".to_string(),
                            severity: Severity::Recoverable,
                        });
                    }
                }
            }
        }
        if transcribe_audio
            && let Some(transcript) = content.output_transcription
            && !transcript.text.is_empty()
        {
            events.push(UpstreamEvent::TextDelta(transcript.text));
        }
        if content.turn_complete == Some(true) {
            events.push(UpstreamEvent::TurnComplete);
        }
    }

    if let Some(tool_call) = message.tool_call {
        events.extend(tool_call.function_calls.into_iter().map(|call| {
            UpstreamEvent::FunctionCall(FunctionCall {
                id: call.id,
                name: call.name,
                args: call.args,
            })
        }));
    }

    if let Some(go_away) = message.go_away {
        let notice = match go_away.time_left {
            Some(left) => format!("Upstream session ending soon (time left: {left})"),
            None => "Upstream session ending soon".to_string(),
        };
        events.push(UpstreamEvent::SystemNotice(notice));
    }

    events
}
