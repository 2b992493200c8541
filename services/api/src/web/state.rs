//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use skillswap_core::engine::SessionEngine;
use skillswap_core::ports::SessionStore;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
///
/// Handlers go through the engine for everything session-related; the store is
/// exposed directly only for the auth and rate-limiting concerns that sit in
/// front of the engine.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
    pub store: Arc<dyn SessionStore>,
    pub config: Arc<Config>,
}
