pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod store;

use std::sync::Arc;

use auth::cache::SessionCache;
use auth::verifier::TokenVerifier;
use config::Config;
use gateway::fanout::{Fanout, RelayHub};
use gateway::registry::ConnectionRegistry;
use store::RoomStore;

/// Shared application state available to every connection handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub verifier: Arc<TokenVerifier>,
    pub sessions: Arc<SessionCache>,
    pub registry: Arc<ConnectionRegistry>,
    pub hub: RelayHub,
    pub fanout: Arc<Fanout>,
    pub store: Arc<dyn RoomStore>,
}
