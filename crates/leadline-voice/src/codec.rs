//! PCM helpers shared by the capture and playback pipelines.
//!
//! Outbound audio is mono 16-bit little-endian PCM at 16 kHz, inbound audio is the
//! same sample format at 24 kHz. Both travel base64-encoded inside JSON envelopes.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use std::time::Duration;

/// Sample rate of captured, outbound frames.
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate of received, playback frames.
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// A fixed-duration block of mono samples, normalized to -1.0..=1.0.
///
/// Frames are immutable once built; each one is handed to exactly one consumer.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Create a new frame from mono samples at `sample_rate`.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs())
    }

    /// Give up the frame and keep its samples.
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// An outbound frame ready for the transport: MIME type plus base64 payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub mime_type: String,
    pub data: String,
}

impl EncodedFrame {
    /// Encode a captured frame as `audio/pcm;rate=<rate>`.
    pub fn from_frame(frame: &AudioFrame) -> Self {
        Self {
            mime_type: format!("audio/pcm;rate={}", frame.sample_rate()),
            data: encode_pcm16_base64(frame.samples()),
        }
    }
}

/// Convert one normalized sample to i16. Values outside -1..=1 are clamped first.
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert one 16-bit sample back to the normalized range.
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Float samples → 16-bit LE PCM bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&f32_to_i16(s).to_le_bytes());
    }
    bytes
}

/// 16-bit LE PCM bytes → float samples. An odd byte count is malformed.
pub fn decode_pcm16(bytes: &[u8]) -> VoiceResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16_to_f32(i16::from_le_bytes([c[0], c[1]])))
        .collect())
}

/// Float samples → base64 PCM16, the payload format of an outbound frame.
pub fn encode_pcm16_base64(samples: &[f32]) -> String {
    B64.encode(encode_pcm16(samples))
}

/// Base64 PCM16 → float samples. Surrounding whitespace is ignored.
pub fn decode_pcm16_base64(data: &str) -> VoiceResult<Vec<f32>> {
    let bytes = B64.decode(data.trim())?;
    decode_pcm16(&bytes)
}

/// Root-mean-square level of a block (0.0 for an empty block).
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Average interleaved channels down to mono.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|c| c.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Streaming linear-interpolation resampler for mono audio.
///
/// The read position and the last input sample are carried from one block to the
/// next, so a stream cut into blocks resamples exactly like the same stream in one
/// piece.
#[derive(Debug, Clone)]
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    /// Position of the next output sample, relative to the start of the next block.
    /// Lies in `-1.0..0.0` when it falls between the previous block's last sample
    /// and the next block's first one.
    position: f64,
    last: Option<f32>,
}

impl Resampler {
    /// Create a new resampler from `from_rate` to `to_rate`.
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            position: 0.0,
            last: None,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate || self.from_rate == 0 || self.to_rate == 0
    }

    /// Resample the next block of the stream.
    pub fn process(&mut self, block: &[f32]) -> Vec<f32> {
        if self.is_passthrough() || block.is_empty() {
            return block.to_vec();
        }
        let step = self.from_rate as f64 / self.to_rate as f64;
        let offset = usize::from(self.last.is_some());
        let input: Vec<f32> = self.last.into_iter().chain(block.iter().copied()).collect();

        let mut out = Vec::with_capacity((block.len() as f64 / step).ceil() as usize + 1);
        loop {
            let pos = self.position + offset as f64;
            let idx = pos.floor() as usize;
            if idx + 1 >= input.len() {
                break;
            }
            let frac = (pos - idx as f64) as f32;
            out.push(input[idx] + (input[idx + 1] - input[idx]) * frac);
            self.position += step;
        }

        self.position -= block.len() as f64;
        self.last = block.last().copied();
        out
    }

    /// Forget the carried phase, e.g. before reusing the resampler on a new stream.
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.last = None;
    }
}

/// One-shot resample of a complete mono buffer.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    Resampler::new(from_rate, to_rate).process(samples)
}
