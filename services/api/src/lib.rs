//! Live Bridge API Library Crate
//!
//! The HTTP side of the bridge: configuration, shared state, REST handlers,
//! the WebSocket endpoint and routing. The `api` binary is a thin wrapper
//! around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
