//! Session controller: connect / retry / teardown state machine for one voice call.
//!
//! ```text
//! connecting ──open──▶ connected ──clean close / hang up──▶ ended
//!     │                   │
//!     │ error             │ error or unexpected close
//!     ▼                   ▼
//! reconnecting ◀──────────┘ ──budget spent──▶ error
//! ```
//!
//! Each failed attempt moves to `reconnecting` and arms the backoff timer. With a
//! budget of `max_retries`, the timer that fires after the `max_retries`-th
//! consecutive failure ends the call in `error` instead of starting another attempt.
//!
//! The controller is a single tokio task and the sole owner of every resource of
//! the call. Transport callbacks, captured frames and connect results are queued
//! as [`ControlEvent`]s tagged with the attempt generation; events from a
//! superseded attempt are discarded.

use crate::audio::{AudioBackend, InputContext};
use crate::capture::{self, CaptureHandle};
use crate::codec::AudioFrame;
use crate::config::{CallConfig, Credential, SessionParams};
use crate::error::VoiceError;
use crate::playback::PlaybackPipeline;
use crate::retry::RetryPolicy;
use crate::transport::{Connector, RemoteEvent, TransportEvent, TransportEvents, TransportSession};
use crate::visualizer::VisualizerFeed;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

/// Call status as rendered by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Ended,
}

impl CallStatus {
    /// User-visible label.
    pub fn label(&self) -> &'static str {
        match self {
            CallStatus::Connecting => "Connecting…",
            CallStatus::Connected => "Listening",
            CallStatus::Reconnecting => "Reconnecting…",
            CallStatus::Error => "Connection Failed",
            CallStatus::Ended => "Call Ended",
        }
    }

    /// `Error` and `Ended` are final; nothing leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Error | CallStatus::Ended)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a call ended in [`CallStatus::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Microphone,
    AudioOutput,
    Auth,
    Connection,
}

impl FailureKind {
    /// Classify the error that ended the call.
    pub fn from_error(error: &VoiceError) -> Self {
        match error {
            VoiceError::PermissionDenied(_)
            | VoiceError::DeviceUnavailable(_)
            | VoiceError::AudioStream(_) => FailureKind::Microphone,
            VoiceError::Playback(_) => FailureKind::AudioOutput,
            VoiceError::Auth(_) => FailureKind::Auth,
            _ => FailureKind::Connection,
        }
    }

    /// Text shown next to the failed call.
    pub fn message(&self) -> &'static str {
        match self {
            FailureKind::Microphone => "Please check your microphone permissions and try again.",
            FailureKind::AudioOutput => "Audio output is unavailable on this device.",
            FailureKind::Auth => "Voice service credentials are missing or invalid.",
            FailureKind::Connection => "Connection Failed",
        }
    }
}

/// Latest-value view of the call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub intensity: f32,
    pub failure: Option<FailureKind>,
    pub retry_count: u32,
}

/// One status transition, delivered in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub status: CallStatus,
    pub at: DateTime<Utc>,
}

/// Invoked when the host should open the non-voice fallback (the lead form).
pub type OnFallback = Option<Arc<dyn Fn() + Send + Sync>>;

enum Command {
    HangUp,
}

/// Everything the controller reacts to, in arrival order.
enum ControlEvent {
    Connected {
        generation: u64,
        session: Box<dyn TransportSession>,
    },
    ConnectFailed {
        generation: u64,
        error: VoiceError,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    FrameCaptured {
        generation: u64,
        frame: AudioFrame,
    },
}

impl ControlEvent {
    fn generation(&self) -> u64 {
        match self {
            ControlEvent::Connected { generation, .. }
            | ControlEvent::ConnectFailed { generation, .. }
            | ControlEvent::Transport { generation, .. }
            | ControlEvent::FrameCaptured { generation, .. } => *generation,
        }
    }
}

/// Builder for a voice call.
pub struct VoiceCall {
    config: CallConfig,
    connector: Arc<dyn Connector>,
    audio: Arc<dyn AudioBackend>,
    credential: Option<Credential>,
    on_fallback: OnFallback,
}

impl VoiceCall {
    /// Create a new call builder. Nothing is opened until [`VoiceCall::open`].
    pub fn new(config: CallConfig, connector: Arc<dyn Connector>, audio: Arc<dyn AudioBackend>) -> Self {
        Self {
            config,
            connector,
            audio,
            credential: None,
            on_fallback: None,
        }
    }

    /// Credential for the realtime endpoint. `None` fails the call with an auth error
    /// before any network attempt.
    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    /// Run `f` whenever the call ends in [`CallStatus::Error`].
    pub fn on_fallback(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_fallback = Some(Arc::new(f));
        self
    }

    /// Start the call. Must be called from within a tokio runtime.
    pub fn open(self) -> CallHandle {
        let feed = VisualizerFeed::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let initial = CallSnapshot {
            status: CallStatus::Connecting,
            intensity: 0.0,
            failure: None,
            retry_count: 0,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let session = CallSession {
            policy: self.config.retry_policy(),
            config: self.config,
            connector: self.connector,
            audio: self.audio,
            credential: self.credential,
            params: None,
            status: CallStatus::Connecting,
            retry_count: 0,
            generation: 0,
            failure: None,
            feed: feed.clone(),
            on_fallback: self.on_fallback.clone(),
            commands: commands_rx,
            events_tx,
            events_rx,
            status_tx,
            snapshot_tx,
            input: None,
            playback: None,
            transport: None,
            capture: None,
            connect_task: None,
            retry_timer: None,
        };
        let task = tokio::spawn(session.run());

        CallHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            status_rx: Some(status_rx),
            feed,
            task: Some(task),
            on_fallback: self.on_fallback,
        }
    }
}

/// Host-side handle of a running call. Dropping it hangs up.
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    status_rx: Option<mpsc::UnboundedReceiver<StatusChange>>,
    feed: VisualizerFeed,
    task: Option<JoinHandle<()>>,
    on_fallback: OnFallback,
}

impl CallHandle {
    /// Current call status.
    pub fn status(&self) -> CallStatus {
        self.snapshot.borrow().status
    }

    /// Current state with a fresh visualizer reading.
    pub fn snapshot(&self) -> CallSnapshot {
        let mut snapshot = self.snapshot.borrow().clone();
        snapshot.intensity = self.feed.intensity();
        snapshot
    }

    /// Latest-value stream for rendering.
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Every status transition in order. Can only be taken once.
    pub fn take_status_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<StatusChange>> {
        self.status_rx.take()
    }

    /// The intensity signal for the call indicator.
    pub fn feed(&self) -> VisualizerFeed {
        self.feed.clone()
    }

    /// End the call and wait until every resource is released. Idempotent.
    pub async fn hang_up(&mut self) {
        let _ = self.commands.send(Command::HangUp);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Call controller ended abnormally: {}", e);
            }
        }
    }

    /// Open the non-voice fallback.
    pub fn open_fallback(&self) {
        if let Some(f) = &self.on_fallback {
            f();
        }
    }

    /// Whether the controller task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::HangUp);
    }
}

/// The controller task's state. Owns every resource of the call.
struct CallSession {
    config: CallConfig,
    connector: Arc<dyn Connector>,
    audio: Arc<dyn AudioBackend>,
    credential: Option<Credential>,
    params: Option<SessionParams>,
    policy: RetryPolicy,

    status: CallStatus,
    retry_count: u32,
    generation: u64,
    failure: Option<FailureKind>,
    feed: VisualizerFeed,
    on_fallback: OnFallback,

    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    events_rx: mpsc::UnboundedReceiver<ControlEvent>,
    status_tx: mpsc::UnboundedSender<StatusChange>,
    snapshot_tx: watch::Sender<CallSnapshot>,

    input: Option<Box<dyn InputContext>>,
    playback: Option<PlaybackPipeline>,
    transport: Option<Box<dyn TransportSession>>,
    capture: Option<CaptureHandle>,
    connect_task: Option<JoinHandle<()>>,
    retry_timer: Option<Pin<Box<Sleep>>>,
}

async fn retry_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Await `work` unless the host hangs up first. `None` means it did.
async fn unless_hung_up<T>(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    work: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = commands.recv() => None,
        done = work => Some(done),
    }
}

impl CallSession {
    async fn run(mut self) {
        self.start().await;

        while !self.status.is_terminal() {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::HangUp) | None => self.end("hang up").await,
                },
                Some(event) = self.events_rx.recv() => self.handle(event).await,
                _ = retry_elapsed(&mut self.retry_timer) => {
                    self.retry_timer = None;
                    self.retry_due().await;
                }
            }
        }
        debug!(status = self.status.label(), "Call controller stopped");
    }

    async fn start(&mut self) {
        self.set_status(CallStatus::Connecting);

        let credential = match self.credential.clone().filter(|c| !c.is_blank()) {
            Some(c) => c,
            None => {
                let err = VoiceError::Auth("No API credential configured".to_string());
                self.fail(&err).await;
                return;
            }
        };
        self.params = Some(SessionParams::from_config(&self.config, credential));

        let rate = self.config.output_sample_rate;
        match unless_hung_up(&mut self.commands, self.audio.open_output(rate)).await {
            Some(Ok(output)) => {
                self.playback = Some(PlaybackPipeline::new(output, rate, self.feed.clone()))
            }
            Some(Err(e)) => {
                self.fail(&e).await;
                return;
            }
            None => {
                self.end("hang up").await;
                return;
            }
        }
        match unless_hung_up(&mut self.commands, self.audio.open_input()).await {
            Some(Ok(input)) => self.input = Some(input),
            Some(Err(e)) => {
                self.fail(&e).await;
                return;
            }
            None => {
                self.end("hang up").await;
                return;
            }
        }

        self.begin_attempt();
    }

    /// The backoff delay is over: retry, or give up once the budget is spent.
    async fn retry_due(&mut self) {
        if self.policy.is_exhausted(self.retry_count) {
            error!(retry_count = self.retry_count, "Retry budget exhausted");
            let err = VoiceError::Connect(format!(
                "Gave up after {} consecutive failed attempts",
                self.retry_count
            ));
            self.fail(&err).await;
        } else {
            self.begin_attempt();
        }
    }

    /// Launch one connect attempt under a fresh generation.
    fn begin_attempt(&mut self) {
        let Some(params) = self.params.clone() else {
            return;
        };
        self.generation += 1;
        let generation = self.generation;

        let sink = self.events_tx.clone();
        let events = TransportEvents::new(generation, move |event| {
            let _ = sink.send(ControlEvent::Transport { generation, event });
        });

        let connector = Arc::clone(&self.connector);
        let tx = self.events_tx.clone();
        let timeout = self.config.connect_timeout();
        info!(generation, retry_count = self.retry_count, "Connecting to realtime endpoint");

        self.connect_task = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(&params, events)).await {
                Ok(result) => result,
                Err(_) => Err(VoiceError::Connect(format!(
                    "Connect timed out after {}ms",
                    timeout.as_millis()
                ))),
            };
            match result {
                Ok(session) => {
                    if let Err(mpsc::error::SendError(ControlEvent::Connected { mut session, .. })) =
                        tx.send(ControlEvent::Connected { generation, session })
                    {
                        session.close().await;
                    }
                }
                Err(error) => {
                    let _ = tx.send(ControlEvent::ConnectFailed { generation, error });
                }
            }
        }));
    }

    async fn handle(&mut self, event: ControlEvent) {
        if event.generation() != self.generation {
            match event {
                ControlEvent::Connected { generation, mut session } => {
                    debug!(generation, "Closing session of a superseded attempt");
                    session.close().await;
                }
                other => debug!(generation = other.generation(), "Ignoring stale event"),
            }
            return;
        }

        match event {
            ControlEvent::Connected { session, .. } => self.on_open(session).await,
            ControlEvent::ConnectFailed { error, .. } => {
                self.connect_task = None;
                // No session exists to recover in place, so a local error still
                // counts as a failed attempt.
                let error = if error.is_local() {
                    VoiceError::Connect(error.to_string())
                } else {
                    error
                };
                self.on_failure(error).await;
            }
            ControlEvent::Transport { event, .. } => match event {
                TransportEvent::Message(message) => {
                    if let Some(audio) = message.audio {
                        if let Some(playback) = self.playback.as_mut() {
                            playback.handle_payload(&audio);
                        }
                    }
                    if let Some(remote) = message.event {
                        self.on_remote_event(remote);
                    }
                }
                TransportEvent::Closed(reason) => {
                    if reason.is_clean() && self.status == CallStatus::Connected {
                        info!(%reason, "Remote ended the call");
                        self.end("remote close").await;
                    } else {
                        self.on_failure(VoiceError::Connect(format!("Connection closed ({})", reason)))
                            .await;
                    }
                }
                TransportEvent::Error(error) => self.on_failure(error).await,
            },
            ControlEvent::FrameCaptured { frame, .. } => self.forward(frame),
        }
    }

    /// The transport is open: start a fresh microphone stream and go live.
    async fn on_open(&mut self, mut session: Box<dyn TransportSession>) {
        self.connect_task = None;

        let constraints = self.config.capture_constraints();
        let acquired = match self.input.as_mut() {
            Some(input) => unless_hung_up(&mut self.commands, input.acquire(&constraints)).await,
            None => Some(Err(VoiceError::DeviceUnavailable("Input context is closed".to_string()))),
        };
        let mic = match acquired {
            Some(Ok(mic)) => mic,
            Some(Err(e)) => {
                session.close().await;
                self.fail(&e).await;
                return;
            }
            None => {
                session.close().await;
                self.end("hang up").await;
                return;
            }
        };

        let generation = self.generation;
        let tx = self.events_tx.clone();
        self.capture = Some(CaptureHandle::start(
            mic,
            self.config.frame_size,
            self.config.input_sample_rate,
            self.feed.clone(),
            move |frame| {
                let _ = tx.send(ControlEvent::FrameCaptured { generation, frame });
            },
        ));
        self.transport = Some(session);
        self.retry_count = 0;
        self.set_status(CallStatus::Connected);
    }

    fn on_remote_event(&mut self, event: RemoteEvent) {
        match event {
            RemoteEvent::Interrupted => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.interrupt();
                }
            }
            RemoteEvent::TurnComplete => debug!(generation = self.generation, "Model turn complete"),
            RemoteEvent::SetupComplete => debug!(generation = self.generation, "Setup complete"),
            RemoteEvent::GoAway => info!(generation = self.generation, "Server announced disconnect"),
            RemoteEvent::Other(kind) => debug!(kind = %kind, "Ignoring non-audio payload"),
        }
    }

    /// Send a captured frame, or drop it when there is no live transport.
    fn forward(&mut self, frame: AudioFrame) {
        if self.status != CallStatus::Connected {
            return;
        }
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.send(capture::encode(&frame)) {
                debug!("Dropping captured frame: {}", e);
            }
        }
    }

    async fn on_failure(&mut self, error: VoiceError) {
        if self.status.is_terminal() {
            return;
        }
        if error.is_local() {
            debug!("Recovered transport error: {}", error);
            return;
        }

        self.retire_attempt().await;

        if !error.is_retryable() {
            self.fail(&error).await;
            return;
        }

        match self.policy.next_delay(self.retry_count) {
            Some(delay) => {
                self.retry_count += 1;
                warn!(
                    retry_count = self.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Connection lost: {}",
                    error
                );
                self.retry_timer = Some(Box::pin(tokio::time::sleep(delay)));
                self.set_status(CallStatus::Reconnecting);
            }
            None => {
                error!(retry_count = self.retry_count, "Retry budget exhausted: {}", error);
                self.fail(&error).await;
            }
        }
    }

    /// Discard the current attempt: its transport, microphone and pending connect.
    async fn retire_attempt(&mut self) {
        self.generation += 1;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop().await;
        }
    }

    async fn fail(&mut self, error: &VoiceError) {
        let kind = FailureKind::from_error(error);
        error!(failure = ?kind, "Call failed: {}", error);
        self.failure = Some(kind);
        self.teardown().await;
        self.set_status(CallStatus::Error);
        if let Some(f) = &self.on_fallback {
            f();
        }
    }

    async fn end(&mut self, cause: &str) {
        if self.status.is_terminal() {
            return;
        }
        info!(cause, "Ending call");
        self.teardown().await;
        self.set_status(CallStatus::Ended);
    }

    /// Release everything: timer, pending connect, transport, microphone, then both
    /// audio contexts. Every step is a no-op when already done.
    async fn teardown(&mut self) {
        self.retry_timer = None;
        self.generation += 1;

        if let Some(task) = self.connect_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop().await;
        }
        while let Ok(event) = self.events_rx.try_recv() {
            if let ControlEvent::Connected { mut session, .. } = event {
                session.close().await;
            }
        }
        if let Some(mut playback) = self.playback.take() {
            playback.close();
        }
        if let Some(mut input) = self.input.take() {
            input.close();
        }
        self.feed.reset();
    }

    fn set_status(&mut self, status: CallStatus) {
        self.status = status;
        info!(
            status = status.label(),
            generation = self.generation,
            retry_count = self.retry_count,
            "Call status changed"
        );
        let _ = self.status_tx.send(StatusChange { status, at: Utc::now() });
        self.snapshot_tx.send_replace(CallSnapshot {
            status,
            intensity: self.feed.intensity(),
            failure: self.failure,
            retry_count: self.retry_count,
        });
    }
}
