//! Runs one session per client connection and keeps count of live ones.

use crate::{
    client::{ClientFrame, ClientInfo, TransportError},
    policy::SessionPolicy,
    session::{Session, SessionHandle},
    translate::{ToolToggles, TranslatorDefaults},
    upstream::LiveConnector,
};
use futures::{Sink, Stream, future::join_all};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

type Registry = Arc<Mutex<HashMap<Uuid, SessionHandle>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<Uuid, SessionHandle>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn count_live(sessions: &HashMap<Uuid, SessionHandle>) -> usize {
    sessions.values().filter(|h| !h.state().is_terminal()).count()
}

/// Removes a session from the registry when its task ends, however it ends.
struct Registration {
    registry: Registry,
    id: Uuid,
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.id);
    }
}

pub struct Supervisor {
    connector: Arc<dyn LiveConnector>,
    defaults: TranslatorDefaults,
    policy: SessionPolicy,
    sessions: Registry,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        defaults: TranslatorDefaults,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            connector,
            defaults,
            policy,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn defaults(&self) -> &TranslatorDefaults {
        &self.defaults
    }

    /// Number of sessions that have not reached `Closed`.
    pub fn live_sessions(&self) -> usize {
        count_live(&lock(&self.sessions))
    }

    pub fn session(&self, id: Uuid) -> Option<SessionHandle> {
        lock(&self.sessions)
            .get(&id)
            .filter(|h| !h.state().is_terminal())
            .cloned()
    }

    /// Starts a session for a newly accepted client connection.
    ///
    /// `tools` overrides the default tool toggles for this connection only.
    /// Past `max_sessions`, the client receives one `Error` envelope and is
    /// disconnected without an upstream channel ever being opened.
    pub fn accept<R, W>(
        &self,
        incoming: R,
        outgoing: W,
        client: ClientInfo,
        tools: Option<ToolToggles>,
    ) -> SessionHandle
    where
        R: Stream<Item = Result<ClientFrame, TransportError>> + Unpin + Send + 'static,
        W: Sink<ClientFrame, Error = TransportError> + Unpin + Send + 'static,
    {
        let defaults = match tools {
            Some(tools) => self.defaults.with_tools(tools),
            None => self.defaults.clone(),
        };
        let mut session = Session::new(
            self.connector.clone(),
            defaults,
            self.policy.clone(),
            &client,
            self.shutdown.child_token(),
        );
        let id = session.id();
        let handle = session.handle();

        let registration = {
            let mut sessions = lock(&self.sessions);
            let live = count_live(&sessions);
            match self.policy.max_sessions {
                Some(max) if live >= max => {
                    warn!(session_id = %id, live, max, "Rejecting connection: session limit reached");
                    session = session.rejected(format!(
                        "Server at capacity ({max} sessions), try again later"
                    ));
                    None
                }
                _ => {
                    sessions.insert(id, handle.clone());
                    Some(Registration {
                        registry: self.sessions.clone(),
                        id,
                    })
                }
            }
        };

        info!(session_id = %id, ip = ?client.ip, "Accepted client connection");
        let span = info_span!("session", session_id = %id);
        tokio::spawn(
            async move {
                let _registration = registration;
                session.run(incoming, outgoing).await;
            }
            .instrument(span),
        );
        handle
    }

    /// Closes every live session and waits for each to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<SessionHandle> = lock(&self.sessions).values().cloned().collect();
        info!(sessions = handles.len(), "Shutting down live sessions");
        join_all(handles.iter().map(|h| h.closed())).await;
    }
}
