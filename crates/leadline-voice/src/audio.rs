//! Audio device contexts: CPAL microphone capture and a Rodio output clock.
//!
//! A call opens one input context and one output context and keeps them for its
//! whole lifetime. Microphone streams are cheaper and are reopened on every
//! reconnect attempt. Device streams are `!Send` on some platforms, so each one
//! lives on its own thread and is controlled through channels. Opening a device is
//! awaited, never blocked on, so a pending permission prompt does not stall the
//! caller's runtime.

use crate::config::CaptureConstraints;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use rodio::{OutputStream, Sink, Source};
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Samples rendered per timeline lock taken by the output source.
const RENDER_CHUNK: usize = 240;

/// Factory for the OS-level audio contexts of one call.
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Open the input context the call will take microphone streams from.
    async fn open_input(&self) -> VoiceResult<Box<dyn InputContext>>;

    /// Open the output context playing mono audio at `sample_rate`.
    async fn open_output(&self, sample_rate: u32) -> VoiceResult<Box<dyn OutputContext>>;
}

/// Input side: hands out microphone streams.
#[async_trait::async_trait]
pub trait InputContext: Send {
    /// Open a live microphone stream, honouring `constraints` where the device allows.
    ///
    /// May wait on an OS permission prompt; dropping the future abandons the request.
    async fn acquire(&mut self, constraints: &CaptureConstraints) -> VoiceResult<MicrophoneStream>;

    /// Release the context. Safe to call more than once.
    fn close(&mut self);
}

/// Output side: a monotonic clock plus sample-accurate scheduling against it.
pub trait OutputContext: Send {
    /// Seconds rendered so far on the output clock.
    fn current_time(&self) -> f64;

    /// Queue mono samples to begin exactly at `start_at` (output clock seconds).
    fn schedule(&mut self, samples: Vec<f32>, start_at: f64) -> VoiceResult<()>;

    /// Drop everything queued but not yet rendered.
    fn flush(&mut self);

    /// Release the context. Safe to call more than once.
    fn close(&mut self);
}

/// Releases a device stream exactly once, on `stop()` or on drop.
pub struct StreamGuard {
    on_stop: Option<Box<dyn FnOnce() + Send>>,
    stopped: bool,
}

impl StreamGuard {
    /// Create a new guard that runs `on_stop` once.
    pub fn new(on_stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_stop: Some(Box::new(on_stop)),
            stopped: false,
        }
    }

    /// A guard with nothing to release.
    pub fn detached() -> Self {
        Self {
            on_stop: None,
            stopped: false,
        }
    }

    /// Release the stream. Only the first call does anything.
    pub fn stop(&mut self) {
        self.stopped = true;
        if let Some(f) = self.on_stop.take() {
            f();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A live microphone: raw interleaved blocks at the device's native format.
pub struct MicrophoneStream {
    blocks: mpsc::UnboundedReceiver<Vec<f32>>,
    native_rate: u32,
    channels: u16,
    guard: StreamGuard,
}

impl MicrophoneStream {
    /// Wrap a block channel fed by a device callback.
    pub fn new(
        blocks: mpsc::UnboundedReceiver<Vec<f32>>,
        native_rate: u32,
        channels: u16,
        guard: StreamGuard,
    ) -> Self {
        Self {
            blocks,
            native_rate,
            channels,
            guard,
        }
    }

    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Next raw block from the device; `None` once the stream has stopped.
    pub async fn next_block(&mut self) -> Option<Vec<f32>> {
        if self.guard.is_stopped() {
            return None;
        }
        self.blocks.recv().await
    }

    /// Stop the device stream. Idempotent.
    pub fn stop(&mut self) {
        self.guard.stop();
        self.blocks.close();
    }
}

/// CPAL/Rodio implementation of [`AudioBackend`].
#[derive(Debug, Clone, Default)]
pub struct DeviceAudio {
    /// Input device name; `None` uses the host default.
    pub input_device: Option<String>,
}

impl DeviceAudio {
    /// Create a new backend on the host's default devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the named input device instead of the default one.
    pub fn with_input_device(mut self, name: impl Into<String>) -> Self {
        self.input_device = Some(name.into());
        self
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

#[async_trait::async_trait]
impl AudioBackend for DeviceAudio {
    async fn open_input(&self) -> VoiceResult<Box<dyn InputContext>> {
        let wanted = self.input_device.clone();
        let name = tokio::task::spawn_blocking(move || {
            let device = find_input_device(wanted.as_deref())?;
            Ok::<_, VoiceError>(device.name().unwrap_or_else(|_| "Unknown".to_string()))
        })
        .await
        .map_err(|e| VoiceError::AudioStream(format!("Device lookup failed: {}", e)))??;
        info!("🎤 Input context ready on {}", name);
        Ok(Box::new(CpalInput {
            device_name: self.input_device.clone(),
            closed: false,
        }))
    }

    async fn open_output(&self, sample_rate: u32) -> VoiceResult<Box<dyn OutputContext>> {
        Ok(Box::new(RodioOutput::open(sample_rate).await?))
    }
}

/// Let a device thread wind down without blocking the caller.
///
/// Inside a runtime the join moves to the blocking pool; elsewhere it happens inline.
fn release_worker(worker: JoinHandle<()>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(move || {
                if worker.join().is_err() {
                    warn!("Audio device thread panicked");
                }
            });
        }
        Err(_) => {
            if worker.join().is_err() {
                warn!("Audio device thread panicked");
            }
        }
    }
}

fn find_input_device(name: Option<&str>) -> VoiceResult<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| VoiceError::DeviceUnavailable(format!("Input device '{}' not found", wanted))),
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string())),
    }
}

struct CpalInput {
    device_name: Option<String>,
    closed: bool,
}

#[async_trait::async_trait]
impl InputContext for CpalInput {
    async fn acquire(&mut self, constraints: &CaptureConstraints) -> VoiceResult<MicrophoneStream> {
        if self.closed {
            return Err(VoiceError::DeviceUnavailable("Input context is closed".to_string()));
        }

        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<(u32, u16)>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (block_tx, block_rx) = mpsc::unbounded_channel();
        let device_name = self.device_name.clone();
        let constraints = constraints.clone();

        let worker = thread::Builder::new()
            .name("leadline-mic".to_string())
            .spawn(move || {
                let opened = find_input_device(device_name.as_deref())
                    .and_then(|device| build_input_stream(&device, &constraints, block_tx));
                let stream = match opened {
                    Ok((stream, rate, channels)) => {
                        let _ = ready_tx.send(Ok((rate, channels)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Parked until the guard fires.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Microphone stream released");
            })?;

        // If this future is dropped while waiting, the guard still releases the thread.
        let mut guard = StreamGuard::new(move || {
            let _ = stop_tx.send(());
            release_worker(worker);
        });

        let (native_rate, channels) = match ready_rx.await {
            Ok(Ok(format)) => format,
            Ok(Err(e)) => {
                guard.stop();
                return Err(e);
            }
            Err(_) => {
                guard.stop();
                return Err(VoiceError::AudioStream(
                    "Microphone thread exited during setup".to_string(),
                ));
            }
        };

        info!("▶️ Microphone open ({}Hz, {} channel(s))", native_rate, channels);
        Ok(MicrophoneStream::new(block_rx, native_rate, channels, guard))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!("Input context closed");
        }
    }
}

/// Build and start a capture stream. Prefers the requested rate/channels when the device
/// supports them in f32, otherwise falls back to the device default.
fn build_input_stream(
    device: &cpal::Device,
    constraints: &CaptureConstraints,
    block_tx: mpsc::UnboundedSender<Vec<f32>>,
) -> VoiceResult<(Stream, u32, u16)> {
    if constraints.echo_cancellation || constraints.noise_suppression || constraints.auto_gain_control {
        debug!("Echo cancellation / noise suppression / AGC are left to the OS input chain");
    }

    let preferred = device.supported_input_configs().ok().and_then(|mut configs| {
        configs.find(|c| {
            c.channels() == constraints.channels
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate().0 <= constraints.sample_rate
                && c.max_sample_rate().0 >= constraints.sample_rate
        })
    });
    let supported = match preferred {
        Some(range) => range.with_sample_rate(cpal::SampleRate(constraints.sample_rate)),
        None => device.default_input_config()?,
    };

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let stream_config: StreamConfig = supported.clone().into();

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = block_tx.send(data.to_vec());
            },
            move |err| warn!("Audio stream error: {}", err),
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let block = data.iter().map(|&s| s as f32 / 32768.0).collect();
                let _ = block_tx.send(block);
            },
            move |err| warn!("Audio stream error: {}", err),
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let block = data.iter().map(|&s| (s as f32 - 32768.0) / 32768.0).collect();
                let _ = block_tx.send(block);
            },
            move |err| warn!("Audio stream error: {}", err),
            None,
        )?,
        other => {
            return Err(VoiceError::AudioStream(format!(
                "Unsupported sample format {:?} (need F32, I16 or U16)",
                other
            )))
        }
    };

    stream.play()?;
    Ok((stream, sample_rate, channels))
}

/// Sample-indexed playback timeline shared between the scheduler and the output source.
#[derive(Debug, Default)]
pub(crate) struct Timeline {
    rendered: u64,
    pending: VecDeque<Scheduled>,
    closed: bool,
}

#[derive(Debug)]
struct Scheduled {
    start: u64,
    samples: Vec<f32>,
}

impl Timeline {
    pub(crate) fn rendered(&self) -> u64 {
        self.rendered
    }

    pub(crate) fn push(&mut self, start: u64, samples: Vec<f32>) {
        if !samples.is_empty() {
            self.pending.push_back(Scheduled { start, samples });
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    /// Render the next output sample: scheduled audio if any covers it, silence otherwise.
    pub(crate) fn next_sample(&mut self) -> f32 {
        let now = self.rendered;
        self.rendered += 1;
        while let Some(front) = self.pending.front() {
            if now < front.start {
                return 0.0;
            }
            let idx = (now - front.start) as usize;
            if idx < front.samples.len() {
                return front.samples[idx];
            }
            self.pending.pop_front();
        }
        0.0
    }
}

/// Endless rodio source that renders the shared timeline.
struct TimelineSource {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    buffer: VecDeque<f32>,
}

impl Iterator for TimelineSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.buffer.is_empty() {
            let mut timeline = self.timeline.lock().ok()?;
            if timeline.closed {
                return None;
            }
            for _ in 0..RENDER_CHUNK {
                let s = timeline.next_sample();
                self.buffer.push_back(s);
            }
        }
        self.buffer.pop_front()
    }
}

impl Source for TimelineSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Output context backed by a rodio sink playing a [`TimelineSource`].
struct RodioOutput {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    guard: StreamGuard,
}

impl RodioOutput {
    async fn open(sample_rate: u32) -> VoiceResult<Self> {
        info!("🔊 Initializing audio output ({}Hz)", sample_rate);

        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let source_timeline = Arc::clone(&timeline);
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let worker = thread::Builder::new()
            .name("leadline-speaker".to_string())
            .spawn(move || {
                let (_stream, stream_handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable(e.to_string())));
                        return;
                    }
                };
                let sink = match Sink::try_new(&stream_handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                sink.append(TimelineSource {
                    timeline: source_timeline,
                    sample_rate,
                    buffer: VecDeque::with_capacity(RENDER_CHUNK),
                });
                sink.play();
                let _ = ready_tx.send(Ok(()));

                let _ = stop_rx.recv();
                sink.stop();
                debug!("Audio output released");
            })?;

        let guard_timeline = Arc::clone(&timeline);
        let mut guard = StreamGuard::new(move || {
            if let Ok(mut t) = guard_timeline.lock() {
                t.closed = true;
                t.clear();
            }
            let _ = stop_tx.send(());
            release_worker(worker);
        });

        let ready = ready_rx
            .await
            .map_err(|_| VoiceError::Playback("Output thread exited during setup".to_string()))
            .and_then(|opened| opened);
        if let Err(e) = ready {
            guard.stop();
            return Err(e);
        }

        info!("✅ Audio output initialized");
        Ok(Self {
            timeline,
            sample_rate,
            guard,
        })
    }
}

impl OutputContext for RodioOutput {
    fn current_time(&self) -> f64 {
        match self.timeline.lock() {
            Ok(t) => t.rendered() as f64 / self.sample_rate as f64,
            Err(_) => 0.0,
        }
    }

    fn schedule(&mut self, samples: Vec<f32>, start_at: f64) -> VoiceResult<()> {
        if self.guard.is_stopped() {
            return Err(VoiceError::Playback("Output context is closed".to_string()));
        }
        let start = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        let mut timeline = self
            .timeline
            .lock()
            .map_err(|_| VoiceError::Playback("Output timeline poisoned".to_string()))?;
        timeline.push(start, samples);
        Ok(())
    }

    fn flush(&mut self) {
        if let Ok(mut t) = self.timeline.lock() {
            t.clear();
        }
    }

    fn close(&mut self) {
        self.guard.stop();
    }
}
