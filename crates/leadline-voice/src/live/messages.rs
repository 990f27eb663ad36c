//! JSON envelope of the Live bidirectional streaming API.
//!
//! Client → server: one `setup` message, then `realtimeInput` media chunks.
//! Server → client: `setupComplete`, `serverContent` (model audio, turn/interrupt
//! flags) and `goAway`.

use crate::codec::EncodedFrame;
use crate::config::SessionParams;
use crate::transport::{InboundMessage, RemoteEvent};
use serde::{Deserialize, Serialize};

// =============================================================================
// Client messages
// =============================================================================

/// First client message: model, voice and persona.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl SetupMessage {
    /// Audio-only response modality, prebuilt voice and persona from `params`.
    pub fn from_params(params: &SessionParams) -> Self {
        let system_instruction = if params.system_instruction.trim().is_empty() {
            None
        } else {
            Some(Content {
                parts: vec![Part {
                    text: Some(params.system_instruction.clone()),
                    inline_data: None,
                }],
            })
        };
        Self {
            setup: Setup {
                model: params.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: params.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction,
            },
        }
    }
}

/// One outbound chunk of microphone audio.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

impl RealtimeInputMessage {
    /// Wrap an encoded frame in the `realtimeInput` envelope.
    pub fn from_frame(frame: EncodedFrame) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: frame.mime_type,
                    data: frame.data,
                }],
            },
        }
    }
}

// =============================================================================
// Server messages
// =============================================================================

/// Any message the server sends. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

impl ServerMessage {
    /// Parse one raw server frame.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Split into transport messages: one per audio part, then one per event.
    pub fn into_inbound(self) -> Vec<InboundMessage> {
        let mut out = Vec::new();
        if self.setup_complete.is_some() {
            out.push(InboundMessage::event(RemoteEvent::SetupComplete));
        }
        if let Some(content) = self.server_content {
            if content.interrupted {
                out.push(InboundMessage::event(RemoteEvent::Interrupted));
            }
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    match part.inline_data {
                        Some(blob) if blob.mime_type.starts_with("audio/") => {
                            out.push(InboundMessage::audio(blob.data));
                        }
                        Some(blob) => {
                            out.push(InboundMessage::event(RemoteEvent::Other(blob.mime_type)));
                        }
                        None => {}
                    }
                }
            }
            if content.turn_complete {
                out.push(InboundMessage::event(RemoteEvent::TurnComplete));
            }
        }
        if self.go_away.is_some() {
            out.push(InboundMessage::event(RemoteEvent::GoAway));
        }
        out
    }
}
