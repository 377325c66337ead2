// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the Parley meeting relay server.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod meeting;
pub mod metric_keys;
pub mod participant;
pub mod relay;
pub mod store;
pub mod ws_router;

use std::sync::Arc;

use crate::auth::TokenService;
use crate::config::Settings;
use crate::meeting::MeetingLifecycle;
use crate::participant::ParticipantRegistry;
use crate::relay::ConnectionRegistry;
use crate::store::Store;

/// Application state shared across all handlers
pub struct AppState<S> {
    /// Settings manager
    pub settings: Arc<Settings>,
    /// Session token service
    pub tokens: TokenService<S>,
    /// Meeting lifecycle manager
    pub meetings: MeetingLifecycle<S>,
    /// Participant registry
    pub participants: ParticipantRegistry<S>,
    /// Live relay connections
    pub connections: ConnectionRegistry,
}

impl<S: Store + Clone> AppState<S> {
    /// Create a new application state on top of a storage backend
    pub fn new(store: S, settings: Settings) -> Self {
        let tokens = TokenService::new(store.clone(), &settings);
        let meetings = MeetingLifecycle::new(store.clone(), &settings);
        let participants = ParticipantRegistry::new(store);
        Self {
            settings: Arc::new(settings),
            tokens,
            meetings,
            participants,
            connections: ConnectionRegistry::new(),
        }
    }
}
