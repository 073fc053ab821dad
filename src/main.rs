use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meetbridge::config::ConfigService;
use meetbridge::meeting::repository::{InMemoryMeetingRepository, PostgresMeetingRepository};
use meetbridge::meeting::MeetingRepository;
use meetbridge::shared::AppState;
use meetbridge::signaling::connection_manager::InMemoryConnectionManager;
use meetbridge::signaling::{websocket_handler, MessageRouter};
use meetbridge::store::{CacheStore, InMemoryCacheStore, RedisCacheStore};

const CONFIG_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const PRESENCE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meetbridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting meeting session-coordination server");

    // Shared ephemeral store: Redis when configured, in-memory otherwise
    // (single-instance development mode).
    let cache: Arc<dyn CacheStore> = match std::env::var("REDIS_URL") {
        Ok(redis_url) => {
            let store = RedisCacheStore::connect(&redis_url)
                .await
                .expect("Failed to connect to Redis");
            info!("Connected to Redis");
            Arc::new(store)
        }
        Err(_) => {
            info!("REDIS_URL not set, using in-memory store");
            Arc::new(InMemoryCacheStore::new())
        }
    };

    // Meeting records: PostgreSQL when configured, in-memory otherwise.
    let meeting_repository: Arc<dyn MeetingRepository> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = sqlx::PgPool::connect(&database_url)
                .await
                .expect("Failed to connect to database");
            info!("Connected to PostgreSQL");
            Arc::new(PostgresMeetingRepository::new(pool))
        }
        Err(_) => {
            info!("DATABASE_URL not set, using in-memory meeting repository");
            Arc::new(InMemoryMeetingRepository::new())
        }
    };

    let redirect_url =
        std::env::var("REDIRECT_URL").unwrap_or_else(|_| "/dashboard".to_string());

    let config = Arc::new(ConfigService::new(Arc::clone(&cache)));
    config.refresh().await;
    Arc::clone(&config).spawn_refresh_task(CONFIG_REFRESH_INTERVAL);

    let app_state = AppState::build(
        cache,
        meeting_repository,
        Arc::new(InMemoryConnectionManager::new()),
        config,
        redirect_url,
    );

    // Resume timers persisted by a previous process before accepting
    // connections.
    app_state.timers.recover().await;

    Arc::clone(&app_state.presence).spawn_refresh_task(PRESENCE_REFRESH_INTERVAL);

    let router = Arc::new(MessageRouter::new(app_state));

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(router);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind listener");
    info!(bind_addr = %bind_addr, "Server running");
    axum::serve(listener, app).await.expect("Server error");
}
