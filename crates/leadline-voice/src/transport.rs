//! Transport abstraction over a remote realtime audio model.
//!
//! A [`Connector`] opens sessions; a [`TransportSession`] sends audio and is closed
//! exactly once per successful `connect()`. Everything the remote pushes afterwards
//! (audio, lifecycle) arrives through the [`TransportEvents`] sink handed to `connect()`,
//! tagged with the generation of the attempt that created it.

use crate::codec::EncodedFrame;
use crate::config::SessionParams;
use crate::error::{VoiceError, VoiceResult};
use std::fmt;
use std::sync::Arc;

/// Non-audio signals from the remote model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    SetupComplete,
    /// The model finished its turn.
    TurnComplete,
    /// The caller barged in; audio not yet played should be discarded.
    Interrupted,
    /// Server announced it will drop the connection soon.
    GoAway,
    Other(String),
}

/// One inbound message: at most one audio chunk plus optional event data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    /// Base64 PCM16 at 24 kHz.
    pub audio: Option<String>,
    pub event: Option<RemoteEvent>,
}

impl InboundMessage {
    /// A message carrying one base64 audio chunk.
    pub fn audio(data: impl Into<String>) -> Self {
        Self {
            audio: Some(data.into()),
            event: None,
        }
    }

    /// A message carrying only a remote event.
    pub fn event(event: RemoteEvent) -> Self {
        Self {
            audio: None,
            event: Some(event),
        }
    }
}

/// Why the remote side went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseReason {
    /// WebSocket close code for a normal closure.
    pub const NORMAL: u16 = 1000;

    /// A clean close with code 1000.
    pub fn normal() -> Self {
        Self {
            code: Some(Self::NORMAL),
            reason: String::new(),
        }
    }

    /// A close without a status code, e.g. a dropped connection.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }

    /// A normal-closure code means the remote ended the conversation on purpose.
    pub fn is_clean(&self) -> bool {
        self.code == Some(Self::NORMAL)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) if self.reason.is_empty() => write!(f, "code {}", code),
            Some(code) => write!(f, "code {}: {}", code, self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

/// Lifecycle and data callbacks of an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    Closed(CloseReason),
    Error(VoiceError),
}

/// Callback sink for one `connect()` call.
///
/// Cheap to clone. Emitting after the receiving controller is gone is a no-op.
#[derive(Clone)]
pub struct TransportEvents {
    generation: u64,
    emit: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportEvents {
    /// Create a new sink tagging every event with `generation`.
    pub fn new(generation: u64, emit: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            generation,
            emit: Arc::new(emit),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward one inbound message.
    pub fn on_message(&self, message: InboundMessage) {
        (self.emit)(TransportEvent::Message(message));
    }

    pub fn on_close(&self, reason: CloseReason) {
        (self.emit)(TransportEvent::Closed(reason));
    }

    pub fn on_error(&self, error: VoiceError) {
        (self.emit)(TransportEvent::Error(error));
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Opens realtime sessions against a remote model endpoint.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Resolves once the remote signals "open". Fails with `VoiceError::Auth` for a
    /// missing or rejected credential and `VoiceError::Connect` for anything transient.
    async fn connect(
        &self,
        params: &SessionParams,
        events: TransportEvents,
    ) -> VoiceResult<Box<dyn TransportSession>>;
}

/// An open realtime session.
#[async_trait::async_trait]
pub trait TransportSession: Send {
    /// Queue one outbound frame. Best effort: returns `VoiceError::Send` once closing began.
    fn send(&mut self, frame: EncodedFrame) -> VoiceResult<()>;

    /// Release the remote session. Safe to call more than once.
    async fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Reject a missing credential before any network attempt.
pub fn require_credential(params: &SessionParams) -> VoiceResult<()> {
    if params.credential.is_blank() {
        return Err(VoiceError::Auth("No API credential configured".to_string()));
    }
    Ok(())
}
