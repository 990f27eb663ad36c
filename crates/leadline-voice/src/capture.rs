//! Capture pipeline: microphone blocks → fixed-size mono 16 kHz frames.
//!
//! Each reconnect attempt gets a fresh [`CaptureHandle`]; stale microphone streams
//! and processing tasks are never reused.

use crate::audio::MicrophoneStream;
use crate::codec::{self, AudioFrame, EncodedFrame, Resampler};
use crate::visualizer::VisualizerFeed;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Accumulates interleaved device samples into blocks of `frame_size` samples per channel.
#[derive(Debug)]
pub struct Framer {
    frame_len: usize,
    pending: Vec<f32>,
}

impl Framer {
    /// Create a new framer emitting `frame_size` samples per channel.
    pub fn new(frame_size: usize, channels: u16) -> Self {
        let frame_len = frame_size.max(1) * channels.max(1) as usize;
        Self {
            frame_len,
            pending: Vec::with_capacity(frame_len),
        }
    }

    /// Feed raw samples; returns every block that became complete.
    pub fn push(&mut self, raw: &[f32]) -> Vec<Vec<f32>> {
        let mut blocks = Vec::new();
        for &sample in raw {
            self.pending.push(sample);
            if self.pending.len() >= self.frame_len {
                blocks.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.frame_len),
                ));
            }
        }
        blocks
    }
}

/// Framer plus per-block processing: downmix, resample, meter.
///
/// The resampler keeps its phase across blocks, so the stream stays at exactly
/// `target_rate` over time.
#[derive(Debug)]
pub struct CapturePipeline {
    framer: Framer,
    resampler: Resampler,
    channels: u16,
    target_rate: u32,
    feed: VisualizerFeed,
}

impl CapturePipeline {
    /// Create a new pipeline for a device delivering `channels` at `native_rate`.
    pub fn new(
        frame_size: usize,
        native_rate: u32,
        channels: u16,
        target_rate: u32,
        feed: VisualizerFeed,
    ) -> Self {
        Self {
            framer: Framer::new(frame_size, channels),
            resampler: Resampler::new(native_rate, target_rate),
            channels,
            target_rate,
            feed,
        }
    }

    /// Turn raw device samples into zero or more outbound frames.
    pub fn process(&mut self, raw: &[f32]) -> Vec<AudioFrame> {
        self.framer
            .push(raw)
            .into_iter()
            .map(|block| {
                let mono = codec::downmix(&block, self.channels as usize);
                let samples = self.resampler.process(&mono);
                self.feed.publish_capture(codec::rms(&samples));
                AudioFrame::new(samples, self.target_rate)
            })
            .collect()
    }
}

/// Encode a captured frame for the transport (16-bit LE PCM, base64).
pub fn encode(frame: &AudioFrame) -> EncodedFrame {
    EncodedFrame::from_frame(frame)
}

/// A running capture: the microphone stream plus the task that frames it.
pub struct CaptureHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Start framing `mic`; every finished frame is passed to `deliver`.
    pub fn start<F>(mic: MicrophoneStream, frame_size: usize, target_rate: u32, feed: VisualizerFeed, deliver: F) -> Self
    where
        F: Fn(AudioFrame) + Send + 'static,
    {
        let pipeline = CapturePipeline::new(frame_size, mic.native_rate(), mic.channels(), target_rate, feed);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_capture(mic, pipeline, stop_rx, deliver));
        Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Stop the microphone, then wait for the processing task to finish. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Capture task ended abnormally: {}", e);
                }
            }
        }
    }

    /// Whether the processing task is still alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn run_capture<F>(
    mut mic: MicrophoneStream,
    mut pipeline: CapturePipeline,
    mut stop_rx: oneshot::Receiver<()>,
    deliver: F,
) where
    F: Fn(AudioFrame),
{
    info!(
        native_rate = mic.native_rate(),
        channels = mic.channels(),
        "Capture pipeline started"
    );
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            block = mic.next_block() => match block {
                Some(raw) => {
                    for frame in pipeline.process(&raw) {
                        deliver(frame);
                    }
                }
                None => {
                    warn!("Microphone stream ended");
                    break;
                }
            },
        }
    }
    mic.stop();
    debug!("Capture pipeline stopped");
}
