//! Error types for the voice-call client

use thiserror::Error;

/// Result type alias for voice-call operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a voice call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Malformed audio payload: {0}")]
    Decode(String),

    #[error("Transport is closing: {0}")]
    Send(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl VoiceError {
    /// Transient failures that the session controller retries per the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VoiceError::Connect(_))
    }

    /// Failures that end the current call attempt and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::PermissionDenied(_) | VoiceError::DeviceUnavailable(_) | VoiceError::Auth(_)
        )
    }

    /// Failures recovered in place (drop one frame, ignore one write).
    pub fn is_local(&self) -> bool {
        matches!(self, VoiceError::Decode(_) | VoiceError::Send(_))
    }
}

impl From<std::io::Error> for VoiceError {
    fn from(err: std::io::Error) -> Self {
        VoiceError::Io(err.to_string())
    }
}

/// Backends report a refused microphone prompt as an opaque backend error.
fn backend_refusal(description: &str) -> VoiceError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        VoiceError::PermissionDenied(description.to_string())
    } else {
        VoiceError::AudioStream(description.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::BackendSpecific { err } => backend_refusal(&err.description),
            other => VoiceError::DeviceUnavailable(other.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::DeviceUnavailable("The requested device is no longer available".to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err } => backend_refusal(&err.description),
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => {
                VoiceError::DeviceUnavailable("The requested device is no longer available".to_string())
            }
            cpal::PlayStreamError::BackendSpecific { err } => backend_refusal(&err.description),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    VoiceError::Auth(format!("Endpoint rejected credential (HTTP {})", status))
                } else {
                    VoiceError::Connect(format!("Handshake failed (HTTP {})", status))
                }
            }
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                VoiceError::Send("Connection already closed".to_string())
            }
            other => VoiceError::Connect(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode(err.to_string())
    }
}
