//! Gemini Live (`BidiGenerateContent`) upstream for the live bridge.
//!
//! [`GeminiConnector`] opens one WebSocket per session, sends the `setup`
//! message and waits for `setupComplete` before handing the channel to the
//! session. Writes go through a single locked sink; a reader task turns
//! server messages into [`UpstreamEvent`]s.

pub mod convert;
pub mod types;

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use live_bridge_core::{
    ConnectError, ConnectParams, LiveChannel, LiveConnector, LiveHandle, SendError, UpstreamEvent,
    UpstreamInput, upstream::Severity,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self,
        protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode},
    },
};
use tracing::{Instrument, debug, error, info, warn};
use types::ClientMessage;

pub const DEFAULT_WS_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(15);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const EVENT_BUFFER: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Opens Gemini Live sessions with one API key.
#[derive(Clone)]
pub struct GeminiConnector {
    api_key: String,
    base_url: String,
    setup_timeout: Duration,
}

impl std::fmt::Debug for GeminiConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConnector")
            .field("base_url", &self.base_url)
            .field("setup_timeout", &self.setup_timeout)
            .finish_non_exhaustive()
    }
}

impl GeminiConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_WS_URL.to_string(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_setup_timeout(mut self, setup_timeout: Duration) -> Self {
        self.setup_timeout = setup_timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}?key={}", self.base_url, self.api_key)
    }
}

#[async_trait]
impl LiveConnector for GeminiConnector {
    async fn open(&self, params: &ConnectParams) -> Result<LiveChannel, ConnectError> {
        if params.model.trim().is_empty() {
            return Err(ConnectError::InvalidParams("model is empty".to_string()));
        }
        let setup = convert::build_setup(params);
        let setup_json = serde_json::to_string(&ClientMessage::Setup(setup))
            .map_err(|e| ConnectError::InvalidParams(e.to_string()))?;

        let (ws_stream, _) = connect_async(self.endpoint())
            .await
            .map_err(connect_error)?;
        info!(base_url = %self.base_url, model = %params.model, "Connected to Gemini Live WebSocket");
        let (mut sink, mut stream) = ws_stream.split();

        sink.send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        match timeout(self.setup_timeout, await_setup_complete(&mut stream)).await {
            Ok(Ok(())) => info!("Gemini session setup is complete"),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ConnectError::Timeout(self.setup_timeout)),
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(
            read_upstream(stream, tx, convert::transcribes_audio(params)).in_current_span(),
        );
        Ok(LiveChannel {
            handle: Arc::new(GeminiHandle {
                writer: Mutex::new(sink),
                closed: AtomicBool::new(false),
                reader,
            }),
            events: Box::pin(ReceiverStream::new(rx)),
        })
    }
}

fn connect_error(e: tungstenite::Error) -> ConnectError {
    match e {
        tungstenite::Error::Http(response) if response.status().is_client_error() => {
            ConnectError::Rejected(format!("HTTP {}", response.status()))
        }
        other => ConnectError::Transport(other.to_string()),
    }
}

async fn await_setup_complete(stream: &mut SplitStream<WsStream>) -> Result<(), ConnectError> {
    while let Some(message) = stream.next().await {
        let raw = match message {
            Ok(WsMessage::Text(text)) => text.as_bytes().to_vec(),
            Ok(WsMessage::Binary(data)) => data.to_vec(),
            Ok(WsMessage::Close(frame)) => {
                return Err(ConnectError::Rejected(close_reason(frame.as_ref())));
            }
            Ok(_) => continue,
            Err(e) => return Err(ConnectError::Transport(e.to_string())),
        };
        match convert::parse_server_message(&raw) {
            Some(message) if message.setup_complete.is_some() => return Ok(()),
            Some(message) => debug!(?message, "Ignoring message received before setupComplete"),
            None => {}
        }
    }
    Err(ConnectError::Transport(
        "connection closed during setup".to_string(),
    ))
}

fn close_reason(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(frame) if !frame.reason.is_empty() => {
            format!("{} ({})", frame.reason.as_str(), u16::from(frame.code))
        }
        Some(frame) => format!("closed with code {}", u16::from(frame.code)),
        None => "closed without a reason".to_string(),
    }
}

/// Reads server messages until the socket closes or the receiver goes away.
async fn read_upstream(
    mut stream: SplitStream<WsStream>,
    tx: mpsc::Sender<UpstreamEvent>,
    transcribe_audio: bool,
) {
    while let Some(message) = stream.next().await {
        let events = match message {
            Ok(WsMessage::Text(text)) => convert::parse_server_message(text.as_bytes())
                .map(|m| convert::server_events(m, transcribe_audio))
                .unwrap_or_default(),
            Ok(WsMessage::Binary(data)) => convert::parse_server_message(&data)
                .map(|m| convert::server_events(m, transcribe_audio))
                .unwrap_or_default(),
            Ok(WsMessage::Close(frame)) => {
                let event = match frame {
                    Some(ref f) if f.code != CloseCode::Normal => {
                        warn!(code = u16::from(f.code), reason = %f.reason.as_str(), "Gemini closed the connection");
                        UpstreamEvent::ErrorNotice {
                            message: format!("Upstream closed: {}", close_reason(frame.as_ref())),
                            severity: Severity::Fatal,
                        }
                    }
                    _ => {
                        info!("Gemini closed the connection");
                        UpstreamEvent::Closed
                    }
                };
                let _ = tx.send(event).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("Error reading from Gemini WebSocket: {}", e);
                let _ = tx
                    .send(UpstreamEvent::ErrorNotice {
                        message: format!("Upstream connection error: {e}"),
                        severity: Severity::Fatal,
                    })
                    .await;
                return;
            }
        };
        for event in events {
            if tx.send(event).await.is_err() {
                debug!("Event receiver dropped, stopping Gemini reader");
                return;
            }
        }
    }
    let _ = tx.send(UpstreamEvent::Closed).await;
}

/// Write half of one Gemini session.
pub struct GeminiHandle {
    writer: Mutex<WsSink>,
    closed: AtomicBool,
    reader: JoinHandle<()>,
}

#[async_trait]
impl LiveHandle for GeminiHandle {
    async fn send(&self, input: UpstreamInput) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        let json = serde_json::to_string(&convert::encode_input(input))
            .map_err(|e| SendError::Encode(e.to_string()))?;
        self.writer
            .lock()
            .await
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    SendError::Closed
                }
                other => SendError::Io(other.to_string()),
            })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(WsMessage::Close(None)).await {
                debug!(error = %e, "Gemini socket already closed");
            }
            let _ = writer.close().await;
        };
        if timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
            warn!("Timed out closing Gemini WebSocket");
        }
        self.reader.abort();
        info!("Gemini session closed");
    }
}

impl Drop for GeminiHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
