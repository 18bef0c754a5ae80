//! Translation of a client `config` envelope into upstream connection
//! parameters.

use crate::envelope::ConfigRequest;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Model used when neither the client nor the operator names one.
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

/// Valid temperature range accepted by the upstream service.
const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.0..=2.0;

/// An output channel kind the upstream channel can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Text,
    Audio,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Text => write!(f, "TEXT"),
            Modality::Audio => write!(f, "AUDIO"),
        }
    }
}

impl FromStr for Modality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Ok(Modality::Text),
            "AUDIO" => Ok(Modality::Audio),
            _ => Err(ConfigError::UnknownModality(s.to_string())),
        }
    }
}

/// A subset of {TEXT, AUDIO}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModalitySet {
    text: bool,
    audio: bool,
}

impl ModalitySet {
    pub const TEXT_ONLY: Self = Self {
        text: true,
        audio: false,
    };

    pub const TEXT_AND_AUDIO: Self = Self {
        text: true,
        audio: true,
    };

    pub fn with(mut self, modality: Modality) -> Self {
        match modality {
            Modality::Text => self.text = true,
            Modality::Audio => self.audio = true,
        }
        self
    }

    pub fn contains(&self, modality: Modality) -> bool {
        match modality {
            Modality::Text => self.text,
            Modality::Audio => self.audio,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.text && !self.audio
    }

    /// Members in a stable order (TEXT before AUDIO).
    pub fn iter(&self) -> impl Iterator<Item = Modality> + '_ {
        [Modality::Text, Modality::Audio]
            .into_iter()
            .filter(|m| self.contains(*m))
    }
}

impl FromIterator<Modality> for ModalitySet {
    fn from_iter<I: IntoIterator<Item = Modality>>(iter: I) -> Self {
        iter.into_iter()
            .fold(ModalitySet::default(), |set, m| set.with(m))
    }
}

/// Generation overrides. `None` leaves the provider default in place.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// Built-in upstream tools a session may enable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolToggles {
    pub code_execution: bool,
    pub google_search: bool,
}

/// Everything needed to open one upstream channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub model: String,
    pub generation: GenerationParams,
    pub modalities: ModalitySet,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    pub tools: ToolToggles,
}

impl ConnectParams {
    /// Parameters used when a session's first message arrives without a
    /// preceding config: TEXT only, the default model, no overrides.
    pub fn lazy_default(defaults: &TranslatorDefaults) -> Self {
        Self {
            model: defaults.model.clone(),
            generation: GenerationParams::default(),
            modalities: ModalitySet::TEXT_ONLY,
            voice: None,
            system_instruction: None,
            tools: defaults.tools,
        }
    }
}

/// Operator-level defaults the translator falls back on.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatorDefaults {
    pub model: String,
    pub tools: ToolToggles,
}

impl Default for TranslatorDefaults {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            tools: ToolToggles::default(),
        }
    }
}

impl TranslatorDefaults {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Copy of these defaults with different tool toggles, e.g. taken from a
    /// connection's query string.
    pub fn with_tools(&self, tools: ToolToggles) -> Self {
        Self {
            tools,
            ..self.clone()
        }
    }
}

/// Semantically invalid configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("model identifier must not be empty")]
    EmptyModel,

    #[error("at least one response modality is required")]
    EmptyModalities,

    #[error("unknown response modality '{0}' (expected TEXT or AUDIO)")]
    UnknownModality(String),

    #[error("a voice was requested but AUDIO is not among the response modalities")]
    VoiceWithoutAudio,

    #[error("temperature {0} is outside the accepted range 0.0 to 2.0")]
    TemperatureOutOfRange(f32),

    #[error("max output tokens must be positive, got {0}")]
    InvalidMaxOutputTokens(i64),
}

/// Validates a config request and turns it into connection parameters.
pub fn translate(
    request: &ConfigRequest,
    defaults: &TranslatorDefaults,
) -> Result<ConnectParams, ConfigError> {
    let model = match &request.model {
        Some(model) if model.trim().is_empty() => return Err(ConfigError::EmptyModel),
        Some(model) => model.trim().to_string(),
        None => defaults.model.clone(),
    };

    let modalities = match &request.modalities {
        None => ModalitySet::TEXT_ONLY,
        Some(values) => {
            let set = values
                .iter()
                .map(|v| v.parse::<Modality>())
                .collect::<Result<ModalitySet, _>>()?;
            if set.is_empty() {
                return Err(ConfigError::EmptyModalities);
            }
            set
        }
    };

    let voice = request
        .voice
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    if voice.is_some() && !modalities.contains(Modality::Audio) {
        return Err(ConfigError::VoiceWithoutAudio);
    }

    let nested = request.generation_config.clone().unwrap_or_default();
    let temperature = request.temperature.or(nested.temperature);
    if let Some(t) = temperature
        && !TEMPERATURE_RANGE.contains(&t)
    {
        return Err(ConfigError::TemperatureOutOfRange(t));
    }
    let max_output_tokens = match request.max_output_tokens.or(nested.max_output_tokens) {
        Some(n) if n <= 0 || n > i64::from(u32::MAX) => {
            return Err(ConfigError::InvalidMaxOutputTokens(n));
        }
        Some(n) => Some(n as u32),
        None => None,
    };

    let tools = ToolToggles {
        code_execution: request
            .enable_code_execution
            .unwrap_or(defaults.tools.code_execution),
        google_search: request
            .enable_google_search
            .unwrap_or(defaults.tools.google_search),
    };

    Ok(ConnectParams {
        model,
        generation: GenerationParams {
            temperature,
            max_output_tokens,
        },
        modalities,
        voice,
        system_instruction: request
            .system_instruction
            .clone()
            .filter(|s| !s.trim().is_empty()),
        tools,
    })
}
