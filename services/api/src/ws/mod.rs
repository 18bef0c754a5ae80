//! WebSocket Endpoint
//!
//! Upgrades `/api/gemini/ws` requests and hands each socket to the session
//! supervisor.
//!
//! - `socket`: adapts an axum `WebSocket` into the client frame stream and sink
//!   the bridge sessions consume.

mod socket;

use crate::state::AppState;
use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade, ws::WebSocket},
    http::HeaderMap,
    response::Response,
};
use live_bridge_core::{ClientInfo, ToolToggles};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, info};

/// Largest single client frame accepted, sized for base64 audio chunks.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Per-connection tool toggles taken from the query string.
#[derive(Debug, Default, Deserialize)]
pub struct ToolParams {
    pub enable_code_execution: Option<bool>,
    pub enable_google_search: Option<bool>,
}

impl ToolParams {
    /// Tool toggles for this connection, or `None` when the query leaves both
    /// at their defaults.
    pub fn toggles(&self, defaults: ToolToggles) -> Option<ToolToggles> {
        if self.enable_code_execution.is_none() && self.enable_google_search.is_none() {
            return None;
        }
        Some(ToolToggles {
            code_execution: self.enable_code_execution.unwrap_or(defaults.code_execution),
            google_search: self.enable_google_search.unwrap_or(defaults.google_search),
        })
    }
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ToolParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let client = ClientInfo {
        ip: Some(client_ip(&headers, peer)),
    };
    let tools = params.toggles(state.supervisor.defaults().tools);
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, client, tools))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    client: ClientInfo,
    tools: Option<ToolToggles>,
) {
    let (incoming, outgoing) = socket::split(socket);
    let handle = state.supervisor.accept(incoming, outgoing, client, tools);
    debug!(session_id = %handle.id(), "WebSocket handed to session");
    handle.closed().await;
    info!(
        session_id = %handle.id(),
        reason = ?handle.close_reason(),
        "WebSocket session finished"
    );
}

fn first_header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Client address from `Forwarded: for=...`, first element only.
fn forwarded_for(headers: &HeaderMap) -> Option<&str> {
    first_header_value(headers, "forwarded")?
        .split(';')
        .map(str::trim)
        .find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("for")
                .then(|| value.trim().trim_matches('"'))
        })
        .filter(|v| !v.is_empty())
}

/// Resolves the client address: `X-Forwarded-For`, then `Forwarded`, then
/// `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    first_header_value(headers, "x-forwarded-for")
        .or_else(|| forwarded_for(headers))
        .or_else(|| first_header_value(headers, "x-real-ip"))
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}
