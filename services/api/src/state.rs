//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the session
//! supervisor and the loaded configuration.

use crate::config::Config;
use chrono::{DateTime, Utc};
use live_bridge_core::Supervisor;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub config: Arc<Config>,
    pub started_at: DateTime<Utc>,
}
