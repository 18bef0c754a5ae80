#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt, channel::mpsc};
use live_bridge_core::{
    ClientFrame, ClientInfo, ConnectError, ConnectParams, LiveChannel, LiveConnector, LiveHandle,
    Modality, SendError, SessionHandle, SessionPolicy, Supervisor, TransportError,
    TranslatorDefaults, UpstreamEvent, UpstreamInput,
    upstream::{AudioFormat, OUTPUT_SAMPLE_RATE},
};
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc as tokio_mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("live_bridge_core=debug")
        .with_test_writer()
        .try_init();
}

/// Upstream handle that records what it is sent and answers every turn.
pub struct FakeHandle {
    pub params: ConnectParams,
    sent: Mutex<Vec<UpstreamInput>>,
    close_calls: AtomicUsize,
    events: Mutex<Option<tokio_mpsc::UnboundedSender<UpstreamEvent>>>,
    auto_reply: bool,
}

impl FakeHandle {
    pub fn sent(&self) -> Vec<UpstreamInput> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Injects an event as if the upstream produced it.
    pub fn push(&self, event: UpstreamEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn reply(&self, input: &UpstreamInput) {
        match input {
            UpstreamInput::Turn(turn) => {
                if self.params.modalities.contains(Modality::Audio) {
                    self.push(UpstreamEvent::AudioChunk {
                        data: Bytes::from_static(&[0, 1, 2, 3]),
                        sample_rate: OUTPUT_SAMPLE_RATE,
                        format: AudioFormat::Pcm16,
                    });
                }
                self.push(UpstreamEvent::TextDelta(format!("echo: {}", turn.content)));
                self.push(UpstreamEvent::TurnComplete);
            }
            UpstreamInput::FunctionResult(result) => {
                self.push(UpstreamEvent::TextDelta(format!(
                    "result from {}",
                    result.name
                )));
                self.push(UpstreamEvent::TurnComplete);
            }
            UpstreamInput::Audio { .. } => {}
        }
    }
}

#[async_trait]
impl LiveHandle for FakeHandle {
    async fn send(&self, input: UpstreamInput) -> Result<(), SendError> {
        if self.events.lock().unwrap().is_none() {
            return Err(SendError::Closed);
        }
        self.sent.lock().unwrap().push(input.clone());
        if self.auto_reply {
            self.reply(&input);
        }
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }
}

/// Connector handing out [`FakeHandle`]s, optionally failing the first opens.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    handles: Arc<Mutex<Vec<Arc<FakeHandle>>>>,
    failures: Arc<Mutex<VecDeque<ConnectError>>>,
    opens: Arc<AtomicUsize>,
    silent: bool,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles that never answer on their own; tests push events instead.
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub fn fail_next(&self, error: ConnectError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn handles(&self) -> Vec<Arc<FakeHandle>> {
        self.handles.lock().unwrap().clone()
    }

    /// The most recently opened handle.
    pub fn handle(&self) -> Arc<FakeHandle> {
        self.handles()
            .last()
            .cloned()
            .expect("no upstream channel opened")
    }
}

#[async_trait]
impl LiveConnector for ScriptedConnector {
    async fn open(&self, params: &ConnectParams) -> Result<LiveChannel, ConnectError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let handle = Arc::new(FakeHandle {
            params: params.clone(),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            events: Mutex::new(Some(tx)),
            auto_reply: !self.silent,
        });
        self.handles.lock().unwrap().push(handle.clone());
        Ok(LiveChannel {
            handle,
            events: UnboundedReceiverStream::new(rx).boxed(),
        })
    }
}

pub fn supervisor(connector: &ScriptedConnector, policy: SessionPolicy) -> Supervisor {
    init_tracing();
    Supervisor::new(
        Arc::new(connector.clone()),
        TranslatorDefaults::default(),
        policy,
    )
}

/// The client end of a session.
pub struct TestClient {
    pub session: SessionHandle,
    tx: mpsc::UnboundedSender<Result<ClientFrame, TransportError>>,
    rx: mpsc::UnboundedReceiver<ClientFrame>,
}

impl TestClient {
    pub fn connect(supervisor: &Supervisor) -> Self {
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, out_rx) = mpsc::unbounded();
        let session = supervisor.accept(
            in_rx,
            out_tx.sink_map_err(|e| TransportError(e.to_string())),
            ClientInfo {
                ip: Some("203.0.113.7".into()),
            },
            None,
        );
        Self {
            session,
            tx: in_tx,
            rx: out_rx,
        }
    }

    pub fn send(&self, value: Value) {
        self.send_raw(value.to_string());
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        self.tx
            .unbounded_send(Ok(ClientFrame::Text(text.into())))
            .expect("session stopped reading");
    }

    pub fn send_close(&self) {
        let _ = self.tx.unbounded_send(Ok(ClientFrame::Close));
    }

    pub fn fail_transport(&self) {
        let _ = self
            .tx
            .unbounded_send(Err(TransportError("connection reset".into())));
    }

    /// Drops the client's read side as if the socket vanished.
    pub fn disconnect(&self) {
        self.tx.close_channel();
    }

    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.next())
            .await
            .expect("timed out waiting for a frame")
    }

    pub async fn next_envelope(&mut self) -> Value {
        match self.next_frame().await {
            Some(ClientFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected an envelope, got {other:?}"),
        }
    }

    /// Envelopes until one of type `kind` arrives, inclusive.
    pub async fn until(&mut self, kind: &str) -> Vec<Value> {
        let mut seen = Vec::new();
        loop {
            let envelope = self.next_envelope().await;
            let done = envelope["type"] == kind;
            seen.push(envelope);
            if done {
                return seen;
            }
        }
    }

    /// Every envelope delivered before the close frame.
    pub async fn until_closed(&mut self) -> Vec<Value> {
        let mut seen = Vec::new();
        loop {
            match self.next_frame().await {
                Some(ClientFrame::Text(text)) => seen.push(serde_json::from_str(&text).unwrap()),
                Some(ClientFrame::Close) => return seen,
                other => panic!("expected an envelope or close, got {other:?}"),
            }
        }
    }

    pub async fn closed(&self) {
        tokio::time::timeout(RECV_TIMEOUT, self.session.closed())
            .await
            .expect("session did not close");
    }
}
