//! Example: live voice call
//!
//! Opens a call against the configured realtime endpoint using the default
//! microphone and speakers, prints every status change and hangs up on Ctrl+C.
//!
//! ```bash
//! GEMINI_API_KEY=... cargo run --example voice_call
//! ```

use leadline_voice::{CallConfig, CallStatus, Credential, DeviceAudio, LiveConnector, VoiceCall};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CallConfig::load()?;
    info!("📞 Leadline voice call");
    info!("   Model: {}  Voice: {}", config.model, config.voice);

    match DeviceAudio::list_input_devices() {
        Ok(devices) => info!("   Input devices: {:?}", devices),
        Err(e) => warn!("   Could not list input devices: {}", e),
    }

    let credential = Credential::from_env();
    if credential.is_none() {
        warn!("No API key found (LEADLINE_VOICE_API_KEY / GEMINI_API_KEY / API_KEY)");
    }

    let connector = Arc::new(LiveConnector::new(config.connect_timeout()));
    let mut call = VoiceCall::new(config, connector, Arc::new(DeviceAudio::new()))
        .with_credential(credential)
        .on_fallback(|| info!("📝 Voice unavailable, open the lead form instead"))
        .open();

    let mut statuses = call
        .take_status_receiver()
        .ok_or_else(|| anyhow::anyhow!("status receiver already taken"))?;
    let feed = call.feed();
    let mut meter = tokio::time::interval(Duration::from_millis(500));

    info!("Press Ctrl+C to hang up.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("👋 Hanging up");
                break;
            }
            change = statuses.recv() => match change {
                Some(change) => {
                    info!("[{}] {}", change.at.format("%H:%M:%S"), change.status);
                    if change.status.is_terminal() {
                        if change.status == CallStatus::Error {
                            if let Some(kind) = call.snapshot().failure {
                                warn!("{}", kind.message());
                            }
                        }
                        break;
                    }
                }
                None => break,
            },
            _ = meter.tick() => {
                if call.status() == CallStatus::Connected {
                    let level = (feed.intensity() * 20.0) as usize;
                    info!("🔊 {}", "█".repeat(level));
                }
            }
        }
    }

    call.hang_up().await;
    info!("Call closed ({})", call.status());
    Ok(())
}
