use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

use crate::protocol::ToolDefinition;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_REALTIME_WS_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// The two realtime backends a session can be bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Signalling over HTTPS, audio on a media track, control on a data channel.
    WebRtc,
    /// One persistent message connection carrying JSON and base64 audio.
    WebSocket,
}

impl Provider {
    pub fn default_model(self) -> &'static str {
        match self {
            Provider::WebRtc => "gpt-4o-realtime-preview-2024-12-17",
            Provider::WebSocket => "gpt-4o-mini-realtime-preview-2024-12-17",
        }
    }

    pub fn default_voice(self) -> &'static str {
        match self {
            Provider::WebRtc => "verse",
            Provider::WebSocket => "alloy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "webrtc" | "media" | "media-track" => Some(Provider::WebRtc),
            "websocket" | "ws" | "message-stream" => Some(Provider::WebSocket),
            _ => None,
        }
    }
}

/// The media-track transport only exists when built with `webrtc`, so
/// without it the message stream is the default.
impl Default for Provider {
    fn default() -> Self {
        if cfg!(feature = "webrtc") {
            Provider::WebRtc
        } else {
            Provider::WebSocket
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::WebRtc => write!(f, "webrtc"),
            Provider::WebSocket => write!(f, "websocket"),
        }
    }
}

/// How the backend decides that the user's turn is over.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum TurnDetection {
    /// The client commits the input buffer explicitly when capture stops.
    #[default]
    Manual,
    /// The backend runs voice-activity detection on the incoming audio.
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

impl TurnDetection {
    pub fn server_vad() -> Self {
        TurnDetection::ServerVad {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Provider-specific knobs carried alongside the common connection fields.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionExtras {
    pub turn_detection: TurnDetection,
    pub modalities: Vec<String>,
    pub tools: Vec<ToolDefinition>,
}

impl ConnectionExtras {
    pub fn for_provider(provider: Provider) -> Self {
        let turn_detection = match provider {
            Provider::WebRtc => TurnDetection::server_vad(),
            Provider::WebSocket => TurnDetection::Manual,
        };
        Self {
            turn_detection,
            modalities: vec!["text".to_string(), "audio".to_string()],
            tools: Vec::new(),
        }
    }
}

/// Snapshot handed to a single connect attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub extras: ConnectionExtras,
}

impl ConnectionConfig {
    /// The configuration announced when a provider becomes active.
    pub fn defaults_for(provider: Provider) -> Self {
        Self {
            model: provider.default_model().to_string(),
            voice: provider.default_voice().to_string(),
            instructions: String::new(),
            extras: ConnectionExtras::for_provider(provider),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub provider: Provider,
    pub openai_api_key: Option<Arc<SecretString>>,
    pub websocket_api_key: Option<Arc<SecretString>>,
    pub api_base: String,
    pub websocket_url: String,
    pub ice_servers: Vec<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub step_timeout: Duration,
    pub batch_window: Duration,
    pub frame_samples: usize,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let provider = match std::env::var("REALTIME_PROVIDER") {
            Ok(provider_str) => Provider::parse(&provider_str).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "REALTIME_PROVIDER".to_string(),
                    format!("'{}' is not one of webrtc, websocket", provider_str),
                )
            })?,
            Err(_) => Provider::default(),
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .map(|key| Arc::new(SecretString::from(key)));
        let websocket_api_key = std::env::var("REALTIME_WS_API_KEY")
            .ok()
            .map(|key| Arc::new(SecretString::from(key)))
            .or_else(|| openai_api_key.clone());

        let api_base =
            std::env::var("OPENAI_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let websocket_url = std::env::var("OPENAI_REALTIME_WS_URL")
            .unwrap_or_else(|_| DEFAULT_REALTIME_WS_URL.to_string());
        let ice_servers: Vec<String> = std::env::var("REALTIME_ICE_SERVERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|_| vec![DEFAULT_ICE_SERVER.to_string()]);

        let model = std::env::var("REALTIME_MODEL").ok();
        let voice = std::env::var("REALTIME_VOICE").ok();
        let instructions = std::env::var("REALTIME_INSTRUCTIONS").ok();

        let step_timeout = Duration::from_secs(parse_var("REALTIME_STEP_TIMEOUT_SECS", 10)?);
        let batch_window = Duration::from_millis(parse_var("AUDIO_BATCH_WINDOW_MS", 100)?);
        let frame_samples = parse_var::<usize>("AUDIO_FRAME_SAMPLES", 480)?;
        if frame_samples == 0 {
            return Err(ConfigError::InvalidValue(
                "AUDIO_FRAME_SAMPLES".to_string(),
                "frame size must be positive".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        match provider {
            Provider::WebRtc => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'webrtc' provider".to_string(),
                    ));
                }
            }
            Provider::WebSocket => {
                if websocket_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "REALTIME_WS_API_KEY or OPENAI_API_KEY must be set for 'websocket' provider"
                            .to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            provider,
            openai_api_key,
            websocket_api_key,
            api_base,
            websocket_url,
            ice_servers,
            model,
            voice,
            instructions,
            step_timeout,
            batch_window,
            frame_samples,
            log_level,
        })
    }

    /// The connect snapshot for `provider`, with any environment overrides applied.
    pub fn connection_config(&self, provider: Provider) -> ConnectionConfig {
        let mut config = ConnectionConfig::defaults_for(provider);
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(voice) = &self.voice {
            config.voice = voice.clone();
        }
        if let Some(instructions) = &self.instructions {
            config.instructions = instructions.clone();
        }
        config
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
