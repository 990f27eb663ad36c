//! Call configuration loaded from TOML and environment.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | endpoint_url | Gemini Live BidiGenerateContent | WebSocket endpoint of the realtime model |
//! | model | models/gemini-2.0-flash-exp | Model identity sent in the setup message |
//! | voice | Puck | Prebuilt voice for audio responses |
//! | system_instruction | receptionist persona | Persona sent with the setup message |
//! | frame_size | 4096 | Samples per channel per captured block |
//! | base_retry_delay_ms | 2000 | Back-off unit (2s, 4s, 6s) |
//! | max_retries | 3 | Automatic reconnects before the call fails |
//! | connect_timeout_ms | 10000 | Handshake deadline |
//! | send_queue_capacity | 32 | Outbound frames buffered by the transport |
//!
//! The credential is never read from the file: see [`Credential::from_env`].

use crate::codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::error::{VoiceError, VoiceResult};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Bidirectional streaming endpoint of the Live API.
pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Realtime model used when none is configured.
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

pub const DEFAULT_VOICE: &str = "Puck";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are the voice receptionist for an AI lead-qualification service. \
Greet the caller warmly, find out what their business does, how many inbound leads they handle each month \
and which CRM they use, then offer to book a demo. Keep every answer short and conversational.";

/// Capture constraints handed to the input device layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Requested sample rate; the pipeline resamples if the device ignores it.
    pub sample_rate: u32,
    /// Requested channel count; the pipeline downmixes if the device ignores it.
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Configuration for one voice call.
#[derive(Debug, Clone, Deserialize)]
pub struct CallConfig {
    pub endpoint_url: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub base_retry_delay_ms: u64,
    pub max_retries: u32,
    pub connect_timeout_ms: u64,
    pub send_queue_capacity: usize,
    #[serde(default = "default_true")]
    pub echo_cancellation: bool,
    #[serde(default = "default_true")]
    pub noise_suppression: bool,
    #[serde(default = "default_true")]
    pub auto_gain_control: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            frame_size: 4096,
            base_retry_delay_ms: 2000,
            max_retries: 3,
            connect_timeout_ms: 10_000,
            send_queue_capacity: 32,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl CallConfig {
    /// Load config from file and environment. Precedence: env `LEADLINE_VOICE__*` > file
    /// (`LEADLINE_VOICE_CONFIG` path, else `config/voice_call.toml`) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("LEADLINE_VOICE_CONFIG").unwrap_or_else(|_| "config/voice_call".to_string());
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("endpoint_url", defaults.endpoint_url)?
            .set_default("model", defaults.model)?
            .set_default("voice", defaults.voice)?
            .set_default("system_instruction", defaults.system_instruction)?
            .set_default("input_sample_rate", defaults.input_sample_rate as i64)?
            .set_default("output_sample_rate", defaults.output_sample_rate as i64)?
            .set_default("frame_size", defaults.frame_size as i64)?
            .set_default("base_retry_delay_ms", defaults.base_retry_delay_ms as i64)?
            .set_default("max_retries", defaults.max_retries as i64)?
            .set_default("connect_timeout_ms", defaults.connect_timeout_ms as i64)?
            .set_default("send_queue_capacity", defaults.send_queue_capacity as i64)?;

        let path = Path::new(&config_path);
        let with_toml = path.with_extension("toml");
        let builder = if path.is_file() {
            builder.add_source(config::File::from(path))
        } else if with_toml.is_file() {
            builder.add_source(config::File::from(with_toml.as_path()))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("LEADLINE_VOICE").separator("__"))
            .build()?;

        let loaded: Self = built.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings the pipelines cannot honour.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.input_sample_rate != INPUT_SAMPLE_RATE {
            return Err(VoiceError::Config(format!(
                "input_sample_rate must be {}, got {}",
                INPUT_SAMPLE_RATE, self.input_sample_rate
            )));
        }
        if self.output_sample_rate != OUTPUT_SAMPLE_RATE {
            return Err(VoiceError::Config(format!(
                "output_sample_rate must be {}, got {}",
                OUTPUT_SAMPLE_RATE, self.output_sample_rate
            )));
        }
        if self.frame_size == 0 {
            return Err(VoiceError::Config("frame_size must be greater than 0".to_string()));
        }
        if self.send_queue_capacity == 0 {
            return Err(VoiceError::Config(
                "send_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.endpoint_url.trim().is_empty() {
            return Err(VoiceError::Config("endpoint_url is empty".to_string()));
        }
        Ok(())
    }

    /// Back-off policy built from `base_retry_delay_ms` and `max_retries`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.base_retry_delay_ms), self.max_retries)
    }

    /// Deadline for one connect attempt.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Microphone constraints for every acquired stream.
    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            sample_rate: self.input_sample_rate,
            channels: 1,
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
            auto_gain_control: self.auto_gain_control,
        }
    }
}

/// Opaque API credential for the realtime endpoint. Debug output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Create a new credential from a raw API key.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read from `LEADLINE_VOICE_API_KEY`, then `GEMINI_API_KEY`, then `API_KEY`.
    pub fn from_env() -> Option<Self> {
        ["LEADLINE_VOICE_API_KEY", "GEMINI_API_KEY", "API_KEY"]
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
            .map(Self)
    }

    /// The raw key. Only the transport should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Everything the transport needs to open one realtime session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub endpoint_url: String,
    pub credential: Credential,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_sample_rate: u32,
    pub send_queue_capacity: usize,
}

impl SessionParams {
    /// Create the connect parameters for one call.
    pub fn from_config(config: &CallConfig, credential: Credential) -> Self {
        Self {
            endpoint_url: config.endpoint_url.clone(),
            credential,
            model: config.model.clone(),
            voice: config.voice.clone(),
            system_instruction: config.system_instruction.clone(),
            input_sample_rate: config.input_sample_rate,
            send_queue_capacity: config.send_queue_capacity,
        }
    }
}
