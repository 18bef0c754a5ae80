//! Core of the live bridge: the client envelope protocol, config translation,
//! modality routing and the per-connection session bridge.
//!
//! Nothing here depends on a web framework or on a particular upstream
//! provider. A listener adapts its socket into a stream and sink of
//! [`ClientFrame`]s and hands them to a [`Supervisor`]; a provider crate
//! implements [`LiveConnector`].

pub mod audio;
pub mod client;
pub mod envelope;
pub mod policy;
pub mod router;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod translate;
pub mod upstream;

pub use client::{ClientFrame, ClientInfo, TransportError};
pub use envelope::{ClientRequest, Envelope, Kind, ServerEnvelope};
pub use policy::{RetryPolicy, SessionPolicy};
pub use session::{CloseReason, Session, SessionHandle};
pub use state::SessionState;
pub use supervisor::Supervisor;
pub use translate::{ConnectParams, Modality, ModalitySet, ToolToggles, TranslatorDefaults};
pub use upstream::{
    ConnectError, EventStream, LiveChannel, LiveConnector, LiveHandle, SendError, UpstreamEvent,
    UpstreamInput,
};
