//! Playback pipeline: base64 PCM16 chunks → gapless, in-order output.
//!
//! Scheduling works against the output clock: a chunk starts at
//! `max(now, next_start)` and pushes `next_start` forward by its own duration, so
//! consecutive chunks butt up against each other and late chunks start immediately.

use crate::audio::OutputContext;
use crate::codec::{self, AudioFrame};
use crate::error::VoiceResult;
use crate::visualizer::VisualizerFeed;
use tracing::{debug, warn};

/// The scheduling cursor, in output-clock seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackSchedule {
    next_start: f64,
}

impl PlaybackSchedule {
    /// Create a new cursor at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Where a chunk handed over at `now` would start, without reserving it.
    pub fn start_for(&self, now: f64) -> f64 {
        now.max(self.next_start)
    }

    /// Reserve `duration` seconds on the timeline; returns the start time.
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        let start = self.start_for(now);
        self.next_start = start + duration.max(0.0);
        start
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Forget everything queued after `now`.
    pub fn reset(&mut self, now: f64) {
        self.next_start = now;
    }
}

/// Decodes and schedules model audio on one output context.
pub struct PlaybackPipeline {
    output: Box<dyn OutputContext>,
    schedule: PlaybackSchedule,
    sample_rate: u32,
    feed: VisualizerFeed,
    closed: bool,
}

impl PlaybackPipeline {
    /// Create a new pipeline playing `sample_rate` audio on `output`.
    pub fn new(output: Box<dyn OutputContext>, sample_rate: u32, feed: VisualizerFeed) -> Self {
        Self {
            output,
            schedule: PlaybackSchedule::new(),
            sample_rate,
            feed,
            closed: false,
        }
    }

    /// Decode one payload into a frame at the output rate.
    pub fn decode(&self, payload: &str) -> VoiceResult<AudioFrame> {
        let samples = codec::decode_pcm16_base64(payload)?;
        Ok(AudioFrame::new(samples, self.sample_rate))
    }

    /// Schedule a decoded frame right after everything already queued.
    ///
    /// The cursor only moves once the output has accepted the samples.
    pub fn schedule(&mut self, frame: AudioFrame) -> VoiceResult<f64> {
        let duration = frame.duration_secs();
        let pulse = frame.duration();
        let now = self.output.current_time();
        let start = self.schedule.start_for(now);
        self.output.schedule(frame.into_samples(), start)?;
        self.schedule.schedule(now, duration);
        self.feed.publish_playback(pulse);
        Ok(start)
    }

    /// Decode and schedule. A bad chunk is dropped and the stream carries on.
    pub fn handle_payload(&mut self, payload: &str) -> Option<f64> {
        if self.closed {
            return None;
        }
        let frame = match self.decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping audio chunk: {}", e);
                return None;
            }
        };
        if frame.is_empty() {
            return None;
        }
        match self.schedule(frame) {
            Ok(start) => Some(start),
            Err(e) => {
                warn!("Failed to schedule audio chunk: {}", e);
                None
            }
        }
    }

    /// The caller barged in: discard queued audio and restart the cursor at "now".
    pub fn interrupt(&mut self) {
        if self.closed {
            return;
        }
        self.output.flush();
        let now = self.output.current_time();
        self.schedule.reset(now);
        debug!(at = now, "Playback interrupted, queue flushed");
    }

    /// Output-clock time at which the next chunk would start.
    pub fn next_start(&self) -> f64 {
        self.schedule.next_start()
    }

    /// Seconds on the output clock.
    pub fn current_time(&self) -> f64 {
        self.output.current_time()
    }

    /// Release the output context. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.output.flush();
            self.output.close();
            self.feed.reset();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_pcm16_base64;
    use crate::error::VoiceError;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        now: f64,
        scheduled: Vec<(f64, usize)>,
        flushes: usize,
        closes: usize,
        reject: bool,
    }

    struct FakeOutput(Arc<Mutex<Recorded>>);

    impl OutputContext for FakeOutput {
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().now
        }

        fn schedule(&mut self, samples: Vec<f32>, start_at: f64) -> VoiceResult<()> {
            let mut rec = self.0.lock().unwrap();
            if rec.reject {
                return Err(VoiceError::Playback("output stream stopped".into()));
            }
            rec.scheduled.push((start_at, samples.len()));
            Ok(())
        }

        fn flush(&mut self) {
            self.0.lock().unwrap().flushes += 1;
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closes += 1;
        }
    }

    fn pipeline() -> (PlaybackPipeline, Arc<Mutex<Recorded>>) {
        let rec = Arc::new(Mutex::new(Recorded::default()));
        let p = PlaybackPipeline::new(
            Box::new(FakeOutput(Arc::clone(&rec))),
            24000,
            VisualizerFeed::new(),
        );
        (p, rec)
    }

    fn chunk(seconds: f64) -> String {
        let n = (seconds * 24000.0) as usize;
        encode_pcm16_base64(&vec![0.25; n])
    }

    #[test]
    fn schedule_cursor_never_goes_backwards() {
        let mut s = PlaybackSchedule::new();
        assert_eq!(s.schedule(1.0, 0.5), 1.0);
        assert_eq!(s.schedule(1.1, 0.25), 1.5);
        assert_eq!(s.next_start(), 1.75);
        // Clock overtook the queue.
        assert_eq!(s.schedule(3.0, 0.5), 3.0);
    }

    #[test]
    fn back_to_back_chunks_are_gapless() {
        let (mut p, rec) = pipeline();
        rec.lock().unwrap().now = 2.0;
        let first = p.handle_payload(&chunk(0.5)).unwrap();
        let second = p.handle_payload(&chunk(0.3)).unwrap();
        assert_eq!(first, 2.0);
        assert!((second - (first + 0.5)).abs() < 1e-9);

        let rec = rec.lock().unwrap();
        assert_eq!(rec.scheduled, vec![(2.0, 12000), (second, 7200)]);
    }

    #[test]
    fn malformed_payload_is_dropped_without_moving_cursor() {
        let (mut p, rec) = pipeline();
        assert!(p.handle_payload("!!not base64!!").is_none());
        assert!(p.handle_payload("AAE").is_none());
        assert_eq!(p.next_start(), 0.0);
        assert!(rec.lock().unwrap().scheduled.is_empty());

        assert!(p.handle_payload(&chunk(0.1)).is_some());
    }

    #[test]
    fn rejected_chunk_leaves_no_gap() {
        let (mut p, rec) = pipeline();
        let feed = p.feed.clone();
        rec.lock().unwrap().reject = true;
        assert!(p.handle_payload(&chunk(0.5)).is_none());
        assert_eq!(p.next_start(), 0.0);
        assert_eq!(feed.intensity(), 0.0);

        rec.lock().unwrap().reject = false;
        assert_eq!(p.handle_payload(&chunk(0.2)), Some(0.0));
        assert!((p.next_start() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn interrupt_flushes_and_restarts_at_now() {
        let (mut p, rec) = pipeline();
        p.handle_payload(&chunk(1.0));
        p.handle_payload(&chunk(1.0));
        rec.lock().unwrap().now = 0.4;

        p.interrupt();
        assert_eq!(rec.lock().unwrap().flushes, 1);
        assert_eq!(p.next_start(), 0.4);
        assert_eq!(p.handle_payload(&chunk(0.1)), Some(0.4));
    }

    #[test]
    fn close_is_idempotent_and_stops_scheduling() {
        let (mut p, rec) = pipeline();
        p.close();
        p.close();
        drop(p);
        let rec = rec.lock().unwrap();
        assert_eq!(rec.closes, 1);
    }

    #[test]
    fn closed_pipeline_ignores_payloads() {
        let (mut p, rec) = pipeline();
        p.close();
        assert!(p.handle_payload(&chunk(0.1)).is_none());
        assert!(rec.lock().unwrap().scheduled.is_empty());
    }
}
