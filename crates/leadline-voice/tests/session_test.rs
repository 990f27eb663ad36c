//! Integration tests for the call session controller
//!
//! A scripted connector and a counting audio backend stand in for the network and
//! the sound card. Time is paused, so back-off delays elapse instantly.

use leadline_voice::{
    AudioBackend, CallConfig, CallHandle, CallStatus, CaptureConstraints, CloseReason, Connector,
    Credential, DeviceAudio, EncodedFrame, FailureKind, InboundMessage, InputContext,
    MicrophoneStream, OutputContext, RemoteEvent, SessionParams, StatusChange, StreamGuard,
    TransportEvents, TransportSession, VoiceCall, VoiceError, VoiceResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// Fakes
// =============================================================================

enum Outcome {
    Open,
    Fail(VoiceError),
    /// Never resolves, like a handshake the server never answers.
    Hang,
}

#[derive(Default)]
struct SessionLog {
    sent: Mutex<Vec<EncodedFrame>>,
    closes: AtomicUsize,
}

impl SessionLog {
    fn sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Script {
    outcomes: VecDeque<Outcome>,
    calls: usize,
    events: Vec<TransportEvents>,
    sessions: Vec<Arc<SessionLog>>,
}

#[derive(Clone, Default)]
struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    fn new(outcomes: Vec<Outcome>) -> Self {
        let connector = Self::default();
        connector.script.lock().unwrap().outcomes = outcomes.into();
        connector
    }

    fn calls(&self) -> usize {
        self.script.lock().unwrap().calls
    }

    fn events(&self, attempt: usize) -> TransportEvents {
        self.script.lock().unwrap().events[attempt].clone()
    }

    fn session(&self, index: usize) -> Arc<SessionLog> {
        Arc::clone(&self.script.lock().unwrap().sessions[index])
    }
}

#[async_trait::async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        params: &SessionParams,
        events: TransportEvents,
    ) -> VoiceResult<Box<dyn TransportSession>> {
        assert!(!params.credential.is_blank());
        let outcome = {
            let mut script = self.script.lock().unwrap();
            script.calls += 1;
            script.events.push(events);
            script
                .outcomes
                .pop_front()
                .unwrap_or_else(|| Outcome::Fail(VoiceError::Connect("script exhausted".into())))
        };
        match outcome {
            Outcome::Open => {
                let log = Arc::new(SessionLog::default());
                self.script.lock().unwrap().sessions.push(Arc::clone(&log));
                Ok(Box::new(FakeSession { log, open: true }))
            }
            Outcome::Fail(e) => Err(e),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

struct FakeSession {
    log: Arc<SessionLog>,
    open: bool,
}

#[async_trait::async_trait]
impl TransportSession for FakeSession {
    fn send(&mut self, frame: EncodedFrame) -> VoiceResult<()> {
        if !self.open {
            return Err(VoiceError::Send("closed".into()));
        }
        self.log.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&mut self) {
        self.open = false;
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[derive(Default)]
struct DeviceLog {
    input_opens: AtomicUsize,
    input_closes: AtomicUsize,
    output_opens: AtomicUsize,
    output_closes: AtomicUsize,
    mic_acquires: AtomicUsize,
    mic_stops: AtomicUsize,
    flushes: AtomicUsize,
    scheduled: Mutex<Vec<f64>>,
    mics: Mutex<Vec<mpsc::UnboundedSender<Vec<f32>>>>,
    deny_mic: AtomicBool,
    hold_mic: AtomicBool,
}

impl DeviceLog {
    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Push one block into the most recently acquired microphone.
    fn speak(&self, samples: usize) {
        if let Some(mic) = self.mics.lock().unwrap().last() {
            let _ = mic.send(vec![0.1; samples]);
        }
    }
}

#[derive(Clone, Default)]
struct FakeAudio {
    log: Arc<DeviceLog>,
}

#[async_trait::async_trait]
impl AudioBackend for FakeAudio {
    async fn open_input(&self) -> VoiceResult<Box<dyn InputContext>> {
        self.log.input_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInput {
            log: Arc::clone(&self.log),
        }))
    }

    async fn open_output(&self, _sample_rate: u32) -> VoiceResult<Box<dyn OutputContext>> {
        self.log.output_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeOutput {
            log: Arc::clone(&self.log),
        }))
    }
}

struct FakeInput {
    log: Arc<DeviceLog>,
}

#[async_trait::async_trait]
impl InputContext for FakeInput {
    async fn acquire(&mut self, constraints: &CaptureConstraints) -> VoiceResult<MicrophoneStream> {
        assert_eq!(constraints.sample_rate, 16000);
        if self.log.hold_mic.load(Ordering::SeqCst) {
            // The user never answers the permission prompt.
            std::future::pending::<()>().await;
        }
        if self.log.deny_mic.load(Ordering::SeqCst) {
            return Err(VoiceError::PermissionDenied("denied by user".into()));
        }
        self.log.mic_acquires.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.log.mics.lock().unwrap().push(tx);
        let log = Arc::clone(&self.log);
        let guard = StreamGuard::new(move || {
            log.mic_stops.fetch_add(1, Ordering::SeqCst);
        });
        Ok(MicrophoneStream::new(rx, 16000, 1, guard))
    }

    fn close(&mut self) {
        self.log.input_closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeOutput {
    log: Arc<DeviceLog>,
}

impl OutputContext for FakeOutput {
    fn current_time(&self) -> f64 {
        0.0
    }

    fn schedule(&mut self, _samples: Vec<f32>, start_at: f64) -> VoiceResult<()> {
        self.log.scheduled.lock().unwrap().push(start_at);
        Ok(())
    }

    fn flush(&mut self) {
        self.log.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) {
        self.log.output_closes.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn test_config() -> CallConfig {
    CallConfig {
        frame_size: 160,
        ..CallConfig::default()
    }
}

fn open_call(connector: &ScriptedConnector, audio: &FakeAudio) -> CallHandle {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    VoiceCall::new(test_config(), Arc::new(connector.clone()), Arc::new(audio.clone()))
        .with_credential(Some(Credential::new("test-key")))
        .open()
}

async fn next_status(rx: &mut mpsc::UnboundedReceiver<StatusChange>) -> CallStatus {
    tokio::time::timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("timed out waiting for a status change")
        .expect("status stream closed")
        .status
}

/// Let spawned tasks drain their queues.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn audio_chunk(seconds: f64) -> String {
    let samples = vec![0.2f32; (seconds * 24000.0) as usize];
    leadline_voice::codec::encode_pcm16_base64(&samples)
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn immediate_open_goes_straight_to_connected() {
    let connector = ScriptedConnector::new(vec![Outcome::Open]);
    let audio = FakeAudio::default();
    let mut call = open_call(&connector, &audio);
    let mut statuses = call.take_status_receiver().unwrap();
    assert!(call.take_status_receiver().is_none());

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Connected);
    assert_eq!(call.status(), CallStatus::Connected);
    assert_eq!(call.snapshot().retry_count, 0);

    assert_eq!(connector.calls(), 1);
    assert_eq!(DeviceLog::count(&audio.log.output_opens), 1);
    assert_eq!(DeviceLog::count(&audio.log.input_opens), 1);
    assert_eq!(DeviceLog::count(&audio.log.mic_acquires), 1);

    call.hang_up().await;
    assert_eq!(next_status(&mut statuses).await, CallStatus::Ended);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_is_enforced_strictly() {
    let connector = ScriptedConnector::new(vec![
        Outcome::Fail(VoiceError::Connect("refused".into())),
        Outcome::Fail(VoiceError::Connect("refused".into())),
        Outcome::Fail(VoiceError::Connect("refused".into())),
        // Would succeed, but the budget is already spent.
        Outcome::Open,
    ]);
    let audio = FakeAudio::default();
    let fallbacks = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fallbacks);
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut call = VoiceCall::new(test_config(), Arc::new(connector.clone()), Arc::new(audio.clone()))
        .with_credential(Some(Credential::new("test-key")))
        .on_fallback(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .open();
    let mut statuses = call.take_status_receiver().unwrap();

    let started = tokio::time::Instant::now();
    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(next_status(&mut statuses).await);
    }
    assert_eq!(
        seen,
        vec![
            CallStatus::Connecting,
            CallStatus::Reconnecting,
            CallStatus::Reconnecting,
            CallStatus::Reconnecting,
            CallStatus::Error,
        ]
    );
    // 2s + 4s + 6s of back-off
    assert!(started.elapsed() >= Duration::from_secs(12));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.calls(), 3);
    assert_eq!(DeviceLog::count(&audio.log.mic_acquires), 0);
    assert_eq!(call.snapshot().failure, Some(FailureKind::Connection));
    assert_eq!(fallbacks.load(Ordering::SeqCst), 1);

    // Terminal error releases both contexts.
    assert_eq!(DeviceLog::count(&audio.log.output_closes), 1);
    assert_eq!(DeviceLog::count(&audio.log.input_closes), 1);
    assert!(call.is_finished());
    call.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn hang_up_while_reconnecting_cancels_the_timer() {
    let connector = ScriptedConnector::new(vec![
        Outcome::Fail(VoiceError::Connect("refused".into())),
        Outcome::Open,
    ]);
    let audio = FakeAudio::default();
    let mut call = open_call(&connector, &audio);
    let mut statuses = call.take_status_receiver().unwrap();

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Reconnecting);

    call.hang_up().await;
    assert_eq!(next_status(&mut statuses).await, CallStatus::Ended);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.calls(), 1);
    assert_eq!(DeviceLog::count(&audio.log.output_closes), 1);
    assert_eq!(DeviceLog::count(&audio.log.input_closes), 1);
}

#[tokio::test(start_paused = true)]
async fn frames_captured_while_disconnected_are_never_replayed() {
    let connector = ScriptedConnector::new(vec![Outcome::Open, Outcome::Open]);
    let audio = FakeAudio::default();
    let mut call = open_call(&connector, &audio);
    let mut statuses = call.take_status_receiver().unwrap();

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Connected);

    audio.log.speak(320);
    settle().await;
    let first = connector.session(0);
    assert_eq!(first.sent(), 2);
    assert_eq!(first.sent.lock().unwrap()[0].mime_type, "audio/pcm;rate=16000");

    connector.events(0).on_close(CloseReason::abnormal("network reset"));
    assert_eq!(next_status(&mut statuses).await, CallStatus::Reconnecting);

    // Microphone of the dead attempt: nothing it produces may reach any session.
    audio.log.speak(1600);
    settle().await;
    assert_eq!(first.sent(), 2);

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connected);
    settle().await;
    let second = connector.session(1);
    assert_eq!(second.sent(), 0);

    // A fresh microphone was acquired for the new attempt.
    assert_eq!(DeviceLog::count(&audio.log.mic_acquires), 2);
    assert_eq!(DeviceLog::count(&audio.log.mic_stops), 1);
    audio.log.speak(160);
    settle().await;
    assert_eq!(second.sent(), 1);

    // Contexts survive the reconnect.
    assert_eq!(DeviceLog::count(&audio.log.output_opens), 1);
    assert_eq!(DeviceLog::count(&audio.log.input_opens), 1);

    call.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn teardown_is_idempotent_and_late_errors_are_ignored() {
    let connector = ScriptedConnector::new(vec![Outcome::Open, Outcome::Open]);
    let audio = FakeAudio::default();
    let mut call = open_call(&connector, &audio);
    let mut statuses = call.take_status_receiver().unwrap();

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Connected);

    let events = connector.events(0);
    events.on_close(CloseReason::abnormal("dropped"));
    events.on_error(VoiceError::Connect("late error".into()));
    assert_eq!(next_status(&mut statuses).await, CallStatus::Reconnecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Connected);
    assert_eq!(call.snapshot().retry_count, 0);
    assert_eq!(connector.calls(), 2);
    assert_eq!(connector.session(0).closes(), 1);

    call.hang_up().await;
    call.hang_up().await;
    drop(call);

    assert_eq!(next_status(&mut statuses).await, CallStatus::Ended);
    assert!(statuses.recv().await.is_none());
    assert_eq!(connector.session(0).closes(), 1);
    assert_eq!(connector.session(1).closes(), 1);
    assert_eq!(DeviceLog::count(&audio.log.mic_stops), 2);
    assert_eq!(DeviceLog::count(&audio.log.output_closes), 1);
    assert_eq!(DeviceLog::count(&audio.log.input_closes), 1);
}

#[tokio::test(start_paused = true)]
async fn clean_remote_close_ends_the_call() {
    let connector = ScriptedConnector::new(vec![Outcome::Open, Outcome::Open]);
    let audio = FakeAudio::default();
    let mut call = open_call(&connector, &audio);
    let mut statuses = call.take_status_receiver().unwrap();

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Connected);

    connector.events(0).on_close(CloseReason::normal());
    assert_eq!(next_status(&mut statuses).await, CallStatus::Ended);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.calls(), 1);
    assert_eq!(connector.session(0).closes(), 1);
    assert!(call.is_finished());
}

#[tokio::test(start_paused = true)]
async fn missing_credential_fails_before_any_connect() {
    let connector = ScriptedConnector::new(vec![Outcome::Open]);
    let audio = FakeAudio::default();
    let mut call = VoiceCall::new(test_config(), Arc::new(connector.clone()), Arc::new(audio.clone()))
        .with_credential(None)
        .open();
    let mut statuses = call.take_status_receiver().unwrap();

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Error);
    assert_eq!(call.snapshot().failure, Some(FailureKind::Auth));
    assert_eq!(connector.calls(), 0);
    assert_eq!(DeviceLog::count(&audio.log.output_opens), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_credential_is_not_retried() {
    let connector = ScriptedConnector::new(vec![Outcome::Fail(VoiceError::Auth("HTTP 403".into()))]);
    let audio = FakeAudio::default();
    let mut call = open_call(&connector, &audio);
    let mut statuses = call.take_status_receiver().unwrap();

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Error);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.calls(), 1);
    assert_eq!(call.snapshot().failure, Some(FailureKind::Auth));
}

#[tokio::test(start_paused = true)]
async fn socket_dropped_during_connect_is_retried() {
    let connector = ScriptedConnector::new(vec![
        Outcome::Fail(VoiceError::Send("Connection already closed".into())),
        Outcome::Open,
    ]);
    let audio = FakeAudio::default();
    let mut call = open_call(&connector, &audio);
    let mut statuses = call.take_status_receiver().unwrap();

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Reconnecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Connected);
    assert_eq!(connector.calls(), 2);

    call.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_connect_times_out_into_reconnecting() {
    let connector = ScriptedConnector::new(vec![Outcome::Hang, Outcome::Open]);
    let audio = FakeAudio::default();
    let mut call = open_call(&connector, &audio);
    let mut statuses = call.take_status_receiver().unwrap();
    let timeout = Duration::from_millis(test_config().connect_timeout_ms);

    let started = tokio::time::Instant::now();
    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Reconnecting);
    let waited = started.elapsed();
    assert!(waited >= timeout, "gave up after {waited:?}");
    assert!(waited < timeout + Duration::from_secs(1), "gave up after {waited:?}");
    assert_eq!(call.snapshot().retry_count, 1);

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connected);
    assert_eq!(connector.calls(), 2);

    call.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn hang_up_during_microphone_prompt_ends_the_call() {
    let connector = ScriptedConnector::new(vec![Outcome::Open]);
    let audio = FakeAudio::default();
    audio.log.hold_mic.store(true, Ordering::SeqCst);
    let mut call = open_call(&connector, &audio);
    let mut statuses = call.take_status_receiver().unwrap();

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    settle().await;
    assert_eq!(connector.calls(), 1);
    assert_eq!(call.status(), CallStatus::Connecting);

    tokio::time::timeout(Duration::from_secs(5), call.hang_up())
        .await
        .expect("hang up waited on the microphone");
    assert_eq!(next_status(&mut statuses).await, CallStatus::Ended);
    assert_eq!(connector.session(0).closes(), 1);
    assert_eq!(DeviceLog::count(&audio.log.mic_acquires), 0);
    assert_eq!(DeviceLog::count(&audio.log.input_closes), 1);
    assert_eq!(DeviceLog::count(&audio.log.output_closes), 1);
}

#[tokio::test(start_paused = true)]
async fn denied_microphone_is_fatal_and_closes_the_session() {
    let connector = ScriptedConnector::new(vec![Outcome::Open, Outcome::Open]);
    let audio = FakeAudio::default();
    audio.log.deny_mic.store(true, Ordering::SeqCst);
    let mut call = open_call(&connector, &audio);
    let mut statuses = call.take_status_receiver().unwrap();

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Error);
    assert_eq!(call.snapshot().failure, Some(FailureKind::Microphone));
    assert_eq!(connector.calls(), 1);
    assert_eq!(connector.session(0).closes(), 1);
    assert_eq!(DeviceLog::count(&audio.log.input_closes), 1);
}

#[tokio::test(start_paused = true)]
async fn inbound_audio_is_scheduled_back_to_back_and_flushed_on_interrupt() {
    let connector = ScriptedConnector::new(vec![Outcome::Open]);
    let audio = FakeAudio::default();
    let mut call = open_call(&connector, &audio);
    let mut statuses = call.take_status_receiver().unwrap();

    assert_eq!(next_status(&mut statuses).await, CallStatus::Connecting);
    assert_eq!(next_status(&mut statuses).await, CallStatus::Connected);

    let events = connector.events(0);
    events.on_message(InboundMessage::audio(audio_chunk(0.5)));
    events.on_message(InboundMessage::audio("%%% not base64 %%%"));
    events.on_message(InboundMessage::audio(audio_chunk(0.3)));
    events.on_message(InboundMessage::event(RemoteEvent::TurnComplete));
    settle().await;

    assert_eq!(*audio.log.scheduled.lock().unwrap(), vec![0.0, 0.5]);
    assert!(call.snapshot().intensity > 0.0);
    assert_eq!(call.status(), CallStatus::Connected);

    events.on_message(InboundMessage::event(RemoteEvent::Interrupted));
    settle().await;
    assert_eq!(DeviceLog::count(&audio.log.flushes), 1);

    events.on_message(InboundMessage::audio(audio_chunk(0.1)));
    settle().await;
    assert_eq!(audio.log.scheduled.lock().unwrap().last(), Some(&0.0));

    call.hang_up().await;
}

#[tokio::test]
#[ignore] // Requires audio hardware
async fn test_device_audio_contexts() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let backend = DeviceAudio::new();
    let mut output = backend.open_output(24000).await.expect("Failed to open output");
    let mut input = backend.open_input().await.expect("Failed to open input");

    let mut mic = input
        .acquire(&CaptureConstraints::default())
        .await
        .expect("Failed to acquire microphone");
    let block = tokio::time::timeout(Duration::from_secs(2), mic.next_block()).await;
    assert!(matches!(block, Ok(Some(_))));

    let now = output.current_time();
    output.schedule(vec![0.0; 2400], now).expect("schedule");
    mic.stop();
    input.close();
    output.close();
}
