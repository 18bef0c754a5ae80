//! The client side of a session, independent of any web framework.

use crate::envelope::ConfigRequest;
use bytes::Bytes;
use thiserror::Error;

/// One frame read from or written to the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

/// The client connection failed. No envelope can be delivered after this.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("client transport error: {0}")]
pub struct TransportError(pub String);

/// What the listener knows about a client at accept time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: Option<String>,
}

/// Identification a client supplies through `config` envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub app: Option<String>,
    pub client_id: Option<String>,
    pub device: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    pub ip: Option<String>,
}

impl ClientContext {
    pub fn from_info(info: &ClientInfo) -> Self {
        Self {
            ip: info.ip.clone(),
            ..Default::default()
        }
    }

    /// Overwrites every field the config sets; absent fields keep their value.
    pub fn merge(&mut self, config: &ConfigRequest) {
        let fields = [
            (&mut self.app, &config.app),
            (&mut self.client_id, &config.client_id),
            (&mut self.device, &config.device),
            (&mut self.user_id, &config.user_id),
            (&mut self.session_id, &config.session_id),
            (&mut self.request_id, &config.request_id),
        ];
        for (slot, value) in fields {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
    }

    /// The client id, falling back to the client's ip.
    pub fn effective_client_id(&self) -> Option<String> {
        self.client_id.clone().or_else(|| self.ip.clone())
    }
}
