use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use crate::call::InstantCallOrchestrator;
use crate::config::ConfigService;
use crate::meeting::repository::MeetingRepository;
use crate::presence::PresenceTracker;
use crate::room::RoomManager;
use crate::signaling::connection_manager::ConnectionManager;
use crate::store::CacheStore;
use crate::timer::MeetingTimerEngine;

/// Shared application state containing all dependencies
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<dyn CacheStore>,
    pub meeting_repository: Arc<dyn MeetingRepository>,
    pub connections: Arc<dyn ConnectionManager>,
    pub presence: Arc<PresenceTracker>,
    pub rooms: Arc<RoomManager>,
    pub timers: Arc<MeetingTimerEngine>,
    pub calls: Arc<InstantCallOrchestrator>,
}

impl AppState {
    /// Wires the service graph from its injected infrastructure pieces.
    ///
    /// The shared cache is the only cross-instance boundary; everything else
    /// is process-local state owned by the returned services.
    pub fn build(
        cache: Arc<dyn CacheStore>,
        meeting_repository: Arc<dyn MeetingRepository>,
        connections: Arc<dyn ConnectionManager>,
        config: Arc<ConfigService>,
        redirect_url: String,
    ) -> Self {
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&cache),
            Arc::clone(&connections),
        ));
        let rooms = Arc::new(RoomManager::new(Arc::clone(&cache)));
        let timers = Arc::new(MeetingTimerEngine::new(
            Arc::clone(&cache),
            Arc::clone(&meeting_repository),
            Arc::clone(&rooms),
            Arc::clone(&connections),
            config,
            redirect_url,
        ));
        let calls = Arc::new(InstantCallOrchestrator::new(
            Arc::clone(&cache),
            Arc::clone(&presence),
            Arc::clone(&connections),
        ));

        Self {
            cache,
            meeting_repository,
            connections,
            presence,
            rooms,
            timers,
            calls,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::CacheError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Cache error: {}", msg),
            ),
            AppError::DatabaseError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Database error: {}", msg),
            ),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::PreconditionFailed(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use crate::config::MeetingTimerConfig;
    use crate::meeting::repository::InMemoryMeetingRepository;
    use crate::signaling::connection_manager::InMemoryConnectionManager;
    use crate::store::InMemoryCacheStore;

    /// Builder for creating AppState with overrides for testing
    pub struct AppStateBuilder {
        cache: Option<Arc<dyn CacheStore>>,
        meeting_repository: Option<Arc<dyn MeetingRepository>>,
        connections: Option<Arc<dyn ConnectionManager>>,
        timer_config: MeetingTimerConfig,
        redirect_url: String,
    }

    impl AppStateBuilder {
        pub fn new() -> Self {
            Self {
                cache: None,
                meeting_repository: None,
                connections: None,
                timer_config: MeetingTimerConfig::default(),
                redirect_url: "/dashboard".to_string(),
            }
        }

        pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
            self.cache = Some(cache);
            self
        }

        pub fn with_meeting_repository(mut self, repo: Arc<dyn MeetingRepository>) -> Self {
            self.meeting_repository = Some(repo);
            self
        }

        pub fn with_connections(mut self, connections: Arc<dyn ConnectionManager>) -> Self {
            self.connections = Some(connections);
            self
        }

        pub fn with_timer_config(mut self, config: MeetingTimerConfig) -> Self {
            self.timer_config = config;
            self
        }

        pub fn build(self) -> AppState {
            let cache = self
                .cache
                .unwrap_or_else(|| Arc::new(InMemoryCacheStore::new()));
            let config = Arc::new(ConfigService::with_config(
                Arc::clone(&cache),
                self.timer_config,
            ));
            AppState::build(
                cache,
                self.meeting_repository
                    .unwrap_or_else(|| Arc::new(InMemoryMeetingRepository::new())),
                self.connections
                    .unwrap_or_else(|| Arc::new(InMemoryConnectionManager::new())),
                config,
                self.redirect_url,
            )
        }
    }

    impl Default for AppStateBuilder {
        fn default() -> Self {
            Self::new()
        }
    }
}
