/// How relay events fan out across server instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStrategy {
    /// Broadcasts only reach connections on this instance.
    Memory,
    /// Broadcasts are also published to a shared redis stream consumed
    /// by every instance.
    Stream,
}

/// Relay API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster-shared HS256 secret used to verify client credentials.
    pub relay_secret: String,
    /// Base URL of the Room Store (e.g. `http://localhost:4001`).
    pub room_store_url: String,
    /// Fan-out strategy, decided once at startup.
    pub storage_strategy: StorageStrategy,
    /// Redis connection string (used when `storage_strategy` is `Stream`).
    pub redis_url: String,
    /// Port the server binds to.
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            relay_secret: required_var("RELAY_JWT_SECRET"),
            room_store_url: required_var("ROOM_STORE_URL"),
            storage_strategy: storage_strategy_var(),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4003),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn storage_strategy_var() -> StorageStrategy {
    match std::env::var("STORAGE_STRATEGY").as_deref() {
        Ok("stream") | Ok("redis-stream") => StorageStrategy::Stream,
        Ok("memory") | Err(_) => StorageStrategy::Memory,
        Ok(other) => {
            tracing::warn!(strategy = %other, "unknown STORAGE_STRATEGY, using memory");
            StorageStrategy::Memory
        }
    }
}
