//! # Leadline Voice - Real-time Voice Call Client
//!
//! Duplex voice sessions with a remote realtime audio model: the caller's microphone
//! is streamed up as 16 kHz PCM, the model's 24 kHz replies are played back gaplessly,
//! and a single controller task supervises connect, reconnect and teardown.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Session Controller                        │
//! │   status · retry/back-off · generation guard · teardown       │
//! │                                                              │
//! │  ┌────────────┐   frames   ┌────────────┐   JSON/WS  ┌────┐  │
//! │  │  Capture   │──────────▶│ Transport  │◀──────────▶│ AI │  │
//! │  │  (cpal)    │            │ (live)     │            └────┘  │
//! │  └────────────┘            └────────────┘                    │
//! │        │ rms                      │ audio chunks              │
//! │        ▼                          ▼                           │
//! │  ┌────────────┐            ┌────────────┐                    │
//! │  │ Visualizer │◀───pulse───│  Playback  │──▶ speaker (rodio) │
//! │  └────────────┘            └────────────┘                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use leadline_voice::{CallConfig, Credential, DeviceAudio, LiveConnector, VoiceCall};
//! use std::sync::Arc;
//!
//! # async fn run() -> leadline_voice::VoiceResult<()> {
//! let config = CallConfig::load()?;
//! let connector = Arc::new(LiveConnector::new(config.connect_timeout()));
//! let mut call = VoiceCall::new(config, connector, Arc::new(DeviceAudio::new()))
//!     .with_credential(Credential::from_env())
//!     .open();
//!
//! let mut statuses = call.take_status_receiver().expect("first take");
//! while let Some(change) = statuses.recv().await {
//!     println!("{}", change.status);
//!     if change.status.is_terminal() {
//!         break;
//!     }
//! }
//! call.hang_up().await;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod live;
pub mod playback;
pub mod retry;
pub mod session;
pub mod transport;
pub mod visualizer;

pub use audio::{AudioBackend, DeviceAudio, InputContext, MicrophoneStream, OutputContext, StreamGuard};
pub use capture::{CaptureHandle, CapturePipeline};
pub use codec::{AudioFrame, EncodedFrame, Resampler, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
pub use config::{CallConfig, CaptureConstraints, Credential, SessionParams};
pub use error::{VoiceError, VoiceResult};
pub use live::LiveConnector;
pub use playback::{PlaybackPipeline, PlaybackSchedule};
pub use retry::RetryPolicy;
pub use session::{CallHandle, CallSnapshot, CallStatus, FailureKind, StatusChange, VoiceCall};
pub use transport::{
    CloseReason, Connector, InboundMessage, RemoteEvent, TransportEvent, TransportEvents,
    TransportSession,
};
pub use visualizer::VisualizerFeed;
