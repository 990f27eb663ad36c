//! WebSocket transport for the Gemini Live bidirectional streaming endpoint.
//!
//! `connect()` performs the WebSocket handshake, sends the setup message and waits
//! for `setupComplete` before resolving. After that a connection task owns the socket:
//! it drains the outbound queue and turns every inbound frame into
//! [`TransportEvents`] callbacks.

pub mod messages;

use crate::codec::EncodedFrame;
use crate::config::SessionParams;
use crate::error::{VoiceError, VoiceResult};
use crate::transport::{require_credential, CloseReason, Connector, TransportEvents, TransportSession};
use futures::{SinkExt, StreamExt};
use messages::{RealtimeInputMessage, ServerMessage, SetupMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close()` waits for the connection task to say goodbye.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// [`Connector`] for the Live API.
#[derive(Debug, Clone)]
pub struct LiveConnector {
    connect_timeout: Duration,
}

impl Default for LiveConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl LiveConnector {
    /// Create a new connector giving up on the handshake after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open(&self, params: &SessionParams) -> VoiceResult<WsStream> {
        let url = format!(
            "{}?key={}",
            params.endpoint_url,
            urlencoding::encode(params.credential.expose())
        );
        debug!(endpoint = %params.endpoint_url, "Opening realtime WebSocket");

        let (mut ws, _response) = connect_async(url.as_str()).await.map_err(handshake_error)?;

        let setup = serde_json::to_string(&SetupMessage::from_params(params))
            .map_err(|e| VoiceError::Connect(format!("Failed to encode setup message: {}", e)))?;
        ws.send(Message::Text(setup)).await.map_err(handshake_error)?;

        wait_for_setup(&mut ws).await?;
        Ok(ws)
    }
}

#[async_trait::async_trait]
impl Connector for LiveConnector {
    async fn connect(
        &self,
        params: &SessionParams,
        events: TransportEvents,
    ) -> VoiceResult<Box<dyn TransportSession>> {
        require_credential(params)?;

        let ws = tokio::time::timeout(self.connect_timeout, self.open(params))
            .await
            .map_err(|_| {
                VoiceError::Connect(format!(
                    "Handshake timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })??;

        info!(
            generation = events.generation(),
            model = %params.model,
            voice = %params.voice,
            "🔌 Realtime session open"
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(params.send_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let open = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_connection(
            ws,
            outbound_rx,
            shutdown_rx,
            events,
            Arc::clone(&open),
        ));

        Ok(Box::new(LiveSession {
            outbound: outbound_tx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
            open,
        }))
    }
}

/// Read until the server acknowledges the setup message.
async fn wait_for_setup(ws: &mut WsStream) -> VoiceResult<()> {
    while let Some(frame) = ws.next().await {
        let text = match frame.map_err(handshake_error)? {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(frame) => return Err(setup_refused(frame)),
            _ => continue,
        };
        match ServerMessage::parse(&text) {
            Ok(msg) if msg.is_setup_complete() => {
                debug!("Setup acknowledged");
                return Ok(());
            }
            Ok(_) => debug!("Ignoring message received before setupComplete"),
            Err(e) => warn!("Unparseable message during setup: {}", e),
        }
    }
    Err(VoiceError::Connect(
        "Connection ended before setup completed".to_string(),
    ))
}

/// Before setup completes there is no session to keep, so a dropped socket is a
/// failed connect rather than a recoverable write error.
fn handshake_error(err: tokio_tungstenite::tungstenite::Error) -> VoiceError {
    match VoiceError::from(err) {
        VoiceError::Send(reason) => VoiceError::Connect(reason),
        other => other,
    }
}

/// The endpoint rejects bad keys by closing the socket right after setup.
fn setup_refused(frame: Option<CloseFrame<'static>>) -> VoiceError {
    let reason = close_reason(frame);
    let lowered = reason.reason.to_lowercase();
    if lowered.contains("api key") || lowered.contains("permission") || lowered.contains("unauthenticated") {
        VoiceError::Auth(reason.to_string())
    } else {
        VoiceError::Connect(format!("Closed during setup ({})", reason))
    }
}

fn close_reason(frame: Option<CloseFrame<'static>>) -> CloseReason {
    match frame {
        Some(frame) => CloseReason {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.into_owned(),
        },
        None => CloseReason::abnormal("closed without status"),
    }
}

/// Parse one inbound frame and forward its parts. Malformed frames are dropped.
fn dispatch(raw: &str, events: &TransportEvents) {
    match ServerMessage::parse(raw) {
        Ok(msg) => {
            for inbound in msg.into_inbound() {
                events.on_message(inbound);
            }
        }
        Err(e) => warn!("Dropping unparseable server message: {}", e),
    }
}

async fn run_connection(
    mut ws: WsStream,
    mut outbound: mpsc::Receiver<String>,
    mut shutdown: oneshot::Receiver<()>,
    events: TransportEvents,
    open: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                let _ = ws.close(None).await;
                break;
            }
            queued = outbound.recv() => match queued {
                Some(text) => {
                    if let Err(e) = ws.send(Message::Text(text)).await {
                        open.store(false, Ordering::SeqCst);
                        events.on_error(e.into());
                        events.on_close(CloseReason::abnormal("write failed"));
                        break;
                    }
                }
                None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(&text, &events),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => dispatch(text, &events),
                    Err(_) => warn!(len = bytes.len(), "Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    open.store(false, Ordering::SeqCst);
                    let reason = close_reason(frame);
                    info!(generation = events.generation(), %reason, "Remote closed the session");
                    events.on_close(reason);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    open.store(false, Ordering::SeqCst);
                    let err = VoiceError::from(e);
                    warn!(generation = events.generation(), "WebSocket error: {}", err);
                    events.on_error(err);
                    events.on_close(CloseReason::abnormal("connection lost"));
                    break;
                }
                None => {
                    open.store(false, Ordering::SeqCst);
                    events.on_close(CloseReason::abnormal("stream ended"));
                    break;
                }
            },
        }
    }
    open.store(false, Ordering::SeqCst);
    debug!(generation = events.generation(), "Connection task finished");
}

/// An open Live session. Outbound frames go through a bounded queue; when it is full
/// the frame is dropped rather than delaying capture.
pub struct LiveSession {
    outbound: mpsc::Sender<String>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    open: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl TransportSession for LiveSession {
    fn send(&mut self, frame: EncodedFrame) -> VoiceResult<()> {
        if !self.is_open() {
            return Err(VoiceError::Send("Session is closed".to_string()));
        }
        let text = serde_json::to_string(&RealtimeInputMessage::from_frame(frame))
            .map_err(|e| VoiceError::Send(format!("Failed to encode frame: {}", e)))?;
        match self.outbound.try_send(text) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Outbound queue full, dropping frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(VoiceError::Send("Connection task has stopped".to_string()))
            }
        }
    }

    async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                warn!("Connection task did not finish within {:?}", CLOSE_GRACE);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.shutdown.is_some()
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
