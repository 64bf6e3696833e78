use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_api::auth::cache::SessionCache;
use relay_api::auth::verifier::TokenVerifier;
use relay_api::config::Config;
use relay_api::gateway::fanout::{Fanout, RelayHub};
use relay_api::gateway::registry::ConnectionRegistry;
use relay_api::store::{HttpRoomStore, RoomStore};
use relay_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let verifier = Arc::new(TokenVerifier::new(&config.relay_secret));
    let sessions = Arc::new(SessionCache::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let hub = RelayHub::new();

    // The fan-out strategy is decided exactly once, here. A shared-stream
    // initialization failure degrades to in-process fan-out inside init.
    let fanout = Arc::new(Fanout::init(&config, hub.clone(), registry.clone()).await);

    let store: Arc<dyn RoomStore> = Arc::new(HttpRoomStore::new(&config.room_store_url));

    tracing::info!(
        strategy = ?config.storage_strategy,
        shared = fanout.is_shared(),
        room_store = %config.room_store_url,
        "relay-api configured"
    );

    let state = AppState {
        config: Arc::new(config),
        verifier,
        sessions,
        registry,
        hub,
        fanout,
        store,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = relay_api::gateway::server::router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "relay-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
