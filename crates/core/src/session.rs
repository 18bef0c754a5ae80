//! The session bridge.
//!
//! A [`Session`] owns one client connection and at most one upstream channel.
//! Once the channel is open two pumps run concurrently:
//!
//! - the inbound pump (the session's own task) reads client frames, decodes
//!   them, opens the channel on the first config or message, and forwards
//!   turns, audio and function results upstream in arrival order;
//! - the outbound pump (a spawned task) reads upstream events, routes them
//!   through the [`ModalityRouter`] and queues envelopes for the client.
//!
//! All client writes go through a single writer task fed by a bounded queue.
//! Teardown is claimed exactly once by whichever side fails or closes first;
//! the session task then stops the outbound pump, closes the upstream handle,
//! flushes what is already queued and closes the client connection.

use crate::{
    client::{ClientContext, ClientFrame, ClientInfo, TransportError},
    envelope::{ClientRequest, ConfigRequest, ProtocolError, ServerEnvelope, decode, encode},
    policy::SessionPolicy,
    router::{ModalityRouter, Routed},
    state::{SessionState, StateCell},
    translate::{ConnectParams, TranslatorDefaults, translate},
    upstream::{ConnectError, EventStream, LiveChannel, LiveConnector, LiveHandle, UpstreamInput},
};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::{
    ops::ControlFlow,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, sleep, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

const CONFIG_ACK_MESSAGE: &str = "Configuration acknowledged";

/// Why a session was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ClientDisconnected,
    Transport(String),
    ConnectFailed(String),
    UpstreamFault(String),
    UpstreamClosed,
    IdleTimeout,
    Rejected(String),
    Shutdown,
}

impl CloseReason {
    /// Text of the single `Error` envelope this reason is reported with.
    fn client_error(&self) -> Option<String> {
        match self {
            CloseReason::ConnectFailed(message) => {
                Some(format!("Failed to connect to upstream: {message}"))
            }
            CloseReason::UpstreamFault(message) | CloseReason::Rejected(message) => {
                Some(message.clone())
            }
            CloseReason::IdleTimeout => Some("Connection closed due to inactivity".to_string()),
            _ => None,
        }
    }

    fn is_upstream_fault(&self) -> bool {
        matches!(
            self,
            CloseReason::ConnectFailed(_) | CloseReason::UpstreamFault(_)
        )
    }
}

enum Outbound {
    Envelope(ServerEnvelope),
    Close,
}

/// State both pumps and the writer share.
struct Shared {
    id: Uuid,
    state: StateCell,
    cancel: CancellationToken,
    closing: AtomicBool,
    reason: OnceLock<CloseReason>,
    out_tx: mpsc::Sender<Outbound>,
    flush_timeout: Duration,
}

impl Shared {
    fn transition(&self, to: SessionState) {
        if let Err(e) = self.state.transition(to) {
            warn!(session_id = %self.id, "{}", e);
        }
    }

    /// Queues an envelope for the client. False once the session is
    /// cancelled or the writer is gone.
    async fn emit(&self, envelope: ServerEnvelope) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.out_tx.send(Outbound::Envelope(envelope)) => sent.is_ok(),
        }
    }

    /// Claims teardown. Only the first caller reports anything to the client
    /// and moves the state machine; later callers return `false`.
    async fn shut_down(&self, reason: CloseReason) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            debug!(session_id = %self.id, ?reason, "Teardown already in progress");
            return false;
        }
        info!(session_id = %self.id, ?reason, "Session closing");

        if let Some(message) = reason.client_error() {
            if reason.is_upstream_fault() {
                self.transition(SessionState::Error);
            }
            let report = self
                .out_tx
                .send(Outbound::Envelope(ServerEnvelope::error(message)));
            match timeout(self.flush_timeout, report).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!(session_id = %self.id, "Client writer gone; error not delivered"),
                Err(_) => warn!(session_id = %self.id, "Timed out queueing error for client"),
            }
        }

        let _ = self.reason.set(reason);
        self.transition(SessionState::Closing);
        self.cancel.cancel();
        true
    }
}

/// A cheap view of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state.get())
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Why the session closed, once teardown has been claimed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason.get().cloned()
    }

    /// Asks the session to close as if the server were shutting down.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Resolves once the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }
}

/// One client connection bridged to at most one upstream channel.
pub struct Session {
    shared: Arc<Shared>,
    out_rx: Option<mpsc::Receiver<Outbound>>,
    connector: Arc<dyn LiveConnector>,
    defaults: TranslatorDefaults,
    policy: SessionPolicy,
    context: ClientContext,
    upstream: Option<Arc<dyn LiveHandle>>,
    outbound_pump: Option<JoinHandle<()>>,
    rejection: Option<String>,
}

impl Session {
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        defaults: TranslatorDefaults,
        policy: SessionPolicy,
        client: &ClientInfo,
        cancel: CancellationToken,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::channel(policy.outbound_buffer.max(1));
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            state: StateCell::new(),
            cancel,
            closing: AtomicBool::new(false),
            reason: OnceLock::new(),
            out_tx,
            flush_timeout: policy.flush_timeout,
        });
        Self {
            shared,
            out_rx: Some(out_rx),
            connector,
            defaults,
            policy,
            context: ClientContext::from_info(client),
            upstream: None,
            outbound_pump: None,
            rejection: None,
        }
    }

    /// Makes the session report `message` and close immediately when run.
    pub fn rejected(mut self, message: impl Into<String>) -> Self {
        self.rejection = Some(message.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Drives the session until it is `Closed`.
    pub async fn run<R, W>(mut self, incoming: R, outgoing: W)
    where
        R: Stream<Item = Result<ClientFrame, TransportError>> + Unpin + Send,
        W: Sink<ClientFrame, Error = TransportError> + Unpin + Send + 'static,
    {
        let Some(out_rx) = self.out_rx.take() else {
            return;
        };
        let writer = tokio::spawn(
            write_client(outgoing, out_rx, self.shared.clone()).in_current_span(),
        );

        match self.rejection.take() {
            Some(message) => {
                self.shared.shut_down(CloseReason::Rejected(message)).await;
            }
            None => self.pump_inbound(incoming).await,
        }

        self.finish(writer).await;
    }

    async fn pump_inbound<R>(&mut self, mut incoming: R)
    where
        R: Stream<Item = Result<ClientFrame, TransportError>> + Unpin,
    {
        let cancel = self.shared.cancel.clone();
        let idle_timeout = self.policy.idle_timeout;
        let mut deadline = idle_timeout.map(|t| Instant::now() + t);

        loop {
            let idle = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = idle => {
                    warn!("Session idle for {:?}, closing", idle_timeout.unwrap_or_default());
                    self.shared.shut_down(CloseReason::IdleTimeout).await;
                    break;
                }
                frame = incoming.next() => frame,
            };
            deadline = idle_timeout.map(|t| Instant::now() + t);

            let raw = match frame {
                Some(Ok(ClientFrame::Text(text))) => Bytes::from(text),
                Some(Ok(ClientFrame::Binary(data))) => data,
                Some(Ok(ClientFrame::Close)) => {
                    info!("Client sent close frame");
                    self.shared.shut_down(CloseReason::ClientClosed).await;
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Error receiving from client");
                    self.shared.shut_down(CloseReason::Transport(e.0)).await;
                    break;
                }
                None => {
                    info!("Client disconnected");
                    self.shared.shut_down(CloseReason::ClientDisconnected).await;
                    break;
                }
            };

            if self.handle_frame(&raw).await.is_break() {
                break;
            }
        }
        debug!("Inbound pump stopped");
    }

    async fn handle_frame(&mut self, raw: &[u8]) -> ControlFlow<()> {
        debug!(bytes = raw.len(), "Received client frame");
        let request = match decode(raw)
            .map_err(ProtocolError::from)
            .and_then(ClientRequest::try_from)
        {
            Ok(request) => request,
            Err(err @ ProtocolError::UnsupportedAudio(_)) => {
                info!(%err, "Ignoring non-PCM audio");
                return self.emit(ServerEnvelope::system(err.to_string())).await;
            }
            Err(err) => {
                warn!(%err, "Rejected client message");
                return self.emit(ServerEnvelope::error(err.to_string())).await;
            }
        };

        match request {
            ClientRequest::Config(config) => self.handle_config(*config).await,
            ClientRequest::Message(turn) => {
                debug!(chars = turn.content.len(), "Forwarding turn upstream");
                self.forward(UpstreamInput::Turn(turn)).await
            }
            ClientRequest::Audio(audio) => {
                self.forward(UpstreamInput::Audio {
                    data: audio.data,
                    mime_type: audio.mime_type,
                })
                .await
            }
            ClientRequest::FunctionResult(result) => {
                if self.upstream.is_none() {
                    return self
                        .emit(ServerEnvelope::error(
                            "No active upstream session for function result",
                        ))
                        .await;
                }
                self.forward(UpstreamInput::FunctionResult(result)).await
            }
        }
    }

    async fn handle_config(&mut self, config: ConfigRequest) -> ControlFlow<()> {
        self.context.merge(&config);

        if self.upstream.is_some() {
            info!("Config received on an open channel; acknowledging without re-applying");
            return self.emit(self.config_ack(false)).await;
        }

        self.shared.transition(SessionState::Connecting);
        match translate(&config, &self.defaults) {
            Ok(params) => self.connect(params, true).await,
            Err(e) => {
                warn!(error = %e, "Invalid session config");
                self.shared.transition(SessionState::Init);
                self.emit(ServerEnvelope::error(format!("Invalid configuration: {e}")))
                    .await
            }
        }
    }

    /// Forwards one input, opening the channel with default parameters if no
    /// config came first.
    async fn forward(&mut self, input: UpstreamInput) -> ControlFlow<()> {
        if self.upstream.is_none() {
            info!("No config received; opening upstream with default parameters");
            self.shared.transition(SessionState::Connecting);
            self.connect(ConnectParams::lazy_default(&self.defaults), false)
                .await?;
        }
        let Some(handle) = self.upstream.clone() else {
            return ControlFlow::Break(());
        };

        let sent = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return ControlFlow::Break(()),
            sent = handle.send(input) => sent,
        };
        if let Err(e) = sent {
            error!(error = %e, "Failed to forward to upstream");
            self.shared
                .shut_down(CloseReason::UpstreamFault(format!(
                    "Failed to send to upstream: {e}"
                )))
                .await;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    async fn connect(&mut self, params: ConnectParams, acknowledge: bool) -> ControlFlow<()> {
        let channel = match self.open_with_retry(&params).await {
            Some(Ok(channel)) => channel,
            Some(Err(e)) => {
                error!(error = %e, model = %params.model, "Failed to open upstream channel");
                self.shared
                    .shut_down(CloseReason::ConnectFailed(e.to_string()))
                    .await;
                return ControlFlow::Break(());
            }
            None => return ControlFlow::Break(()),
        };
        info!(
            model = %params.model,
            modalities = ?params.modalities.iter().collect::<Vec<_>>(),
            "Upstream channel open"
        );

        let LiveChannel { handle, events } = channel;
        self.upstream = Some(handle);
        if acknowledge {
            self.emit(self.config_ack(true)).await?;
        }

        let router = ModalityRouter::new(params.modalities);
        self.outbound_pump = Some(tokio::spawn(
            pump_outbound(self.shared.clone(), events, router).in_current_span(),
        ));
        self.shared.transition(SessionState::Active);
        ControlFlow::Continue(())
    }

    /// Opens the channel, retrying transient failures as the policy allows.
    /// `None` means the session was cancelled meanwhile.
    async fn open_with_retry(
        &self,
        params: &ConnectParams,
    ) -> Option<Result<LiveChannel, ConnectError>> {
        let cancel = &self.shared.cancel;
        let retry = self.policy.retry;
        let mut retries = 0;
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                attempt = self.connector.open(params) => attempt,
            };
            match attempt {
                Ok(channel) => return Some(Ok(channel)),
                Err(e) if e.is_transient() && retry.should_retry(retries) => {
                    retries += 1;
                    let delay = retry.delay_for(retries);
                    warn!(error = %e, retry = retries, ?delay, "Upstream connect failed, retrying");
                    let notice = format!(
                        "Upstream connection failed, retrying ({retries}/{})",
                        retry.max_retries
                    );
                    if !self.shared.emit(ServerEnvelope::system(notice)).await {
                        return None;
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = sleep(delay) => {}
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn config_ack(&self, applied: bool) -> ServerEnvelope {
        ServerEnvelope::ConfigAck {
            message: CONFIG_ACK_MESSAGE.to_string(),
            applied,
            client_id: self.context.effective_client_id(),
            ip: self.context.ip.clone(),
        }
    }

    async fn emit(&self, envelope: ServerEnvelope) -> ControlFlow<()> {
        if self.shared.emit(envelope).await {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }

    async fn finish(mut self, writer: JoinHandle<()>) {
        self.shared.shut_down(CloseReason::Shutdown).await;

        if let Some(pump) = self.outbound_pump.take()
            && let Err(e) = pump.await
        {
            warn!(error = %e, "Outbound pump ended abnormally");
        }
        if let Some(handle) = self.upstream.take() {
            debug!("Closing upstream channel");
            handle.close().await;
        }

        let abort = writer.abort_handle();
        let out_tx = self.shared.out_tx.clone();
        let flushed = timeout(self.policy.flush_timeout, async move {
            let _ = out_tx.send(Outbound::Close).await;
            writer.await
        })
        .await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Client writer ended abnormally"),
            Err(_) => {
                warn!("Timed out flushing outbound envelopes, discarding the rest");
                abort.abort();
            }
        }

        self.shared.transition(SessionState::Closed);
        info!(reason = ?self.shared.reason.get(), "Session closed");
    }
}

/// Outbound pump: upstream events to client envelopes, in upstream order.
async fn pump_outbound(shared: Arc<Shared>, mut events: EventStream, mut router: ModalityRouter) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            event = events.next() => event,
        };
        let Some(event) = event else {
            info!("Upstream event stream ended");
            shared.shut_down(CloseReason::UpstreamClosed).await;
            break;
        };

        match router.route(event) {
            Routed::Envelopes(envelopes) => {
                for envelope in envelopes {
                    if !shared.emit(envelope).await {
                        debug!("Outbound pump stopped");
                        return;
                    }
                }
            }
            Routed::Fault(message) => {
                error!(%message, "Upstream fault");
                shared.shut_down(CloseReason::UpstreamFault(message)).await;
                break;
            }
            Routed::Closed => {
                info!("Upstream channel closed");
                shared.shut_down(CloseReason::UpstreamClosed).await;
                break;
            }
        }
    }
    debug!("Outbound pump stopped");
}

/// The only writer of the client connection.
async fn write_client<W>(mut sink: W, mut rx: mpsc::Receiver<Outbound>, shared: Arc<Shared>)
where
    W: Sink<ClientFrame, Error = TransportError> + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Envelope(envelope) => {
                if let Err(e) = sink.send(ClientFrame::Text(encode(&envelope))).await {
                    warn!(error = %e, "Failed to send to client");
                    shared.shut_down(CloseReason::Transport(e.0)).await;
                    return;
                }
            }
            Outbound::Close => break,
        }
    }
    if let Err(e) = sink.send(ClientFrame::Close).await {
        debug!(error = %e, "Client already gone before close frame");
    }
    let _ = sink.close().await;
}
