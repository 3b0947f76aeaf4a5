//! Application state.

use huddle_core::engine::TextGenerator;
use huddle_core::{auth::ServiceToken, Database};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::services::{SessionService, StreamRegistry};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Database connection
    pub db: Arc<Database>,
    /// Service token for frontend authentication
    pub service_token: Arc<ServiceToken>,
    /// Text-generation backend used by the merge engine
    pub generator: Arc<dyn TextGenerator>,
    /// Session and entry-log operations
    pub sessions: Arc<SessionService>,
    /// Live-stream exclusivity registry
    pub streams: Arc<StreamRegistry>,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: Config,
        db: Database,
        service_token: ServiceToken,
        generator: Arc<dyn TextGenerator>,
    ) -> Arc<Self> {
        let db = Arc::new(db);
        Arc::new(Self {
            config: Arc::new(config),
            sessions: Arc::new(SessionService::new(Arc::clone(&db))),
            db,
            service_token: Arc::new(service_token),
            generator,
            streams: Arc::new(StreamRegistry::new()),
            start_time: Instant::now(),
        })
    }
}
