use std::sync::Arc;
use std::time::Instant;

use crate::auth::{IdentityResolver, JwtIdentityResolver, JwtValidator};
use crate::broker::{create_broker, Broker};
use crate::config::Settings;
use crate::connection_manager::ConnectionManager;
use crate::error::AppError;
use crate::fanout::{FanoutBridge, FanoutConfig};
use crate::postgres::PostgresPool;
use crate::presence::{create_presence_store, PresenceStore, PresenceTracker, PresenceWriterConfig};
use crate::redis::RedisPool;
use crate::store::{create_chat_store, ChatStore, PostgresChatStore};
use crate::websocket::{DeliveryEndpoint, EndpointConfig};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub start_time: Instant,
    pub connection_manager: Arc<ConnectionManager>,
    pub presence: Arc<PresenceTracker>,
    pub store: Arc<dyn ChatStore>,
    pub identity: Arc<dyn IdentityResolver>,
    pub endpoint: Arc<DeliveryEndpoint>,
    pub redis_pool: Option<Arc<RedisPool>>,
    pub postgres_pool: Option<PostgresPool>,
}

impl AppState {
    /// Connect the configured backends and wire every component together.
    pub async fn build(settings: Settings) -> Result<Self, AppError> {
        let needs_redis =
            settings.broker.backend == "redis" || settings.presence.backend == "redis";
        let redis_pool = if needs_redis {
            let pool = RedisPool::new(settings.redis.clone())
                .map_err(|e| AppError::Internal(format!("Failed to create Redis pool: {}", e)))?;
            match pool.ping().await {
                Ok(()) => tracing::info!(url = %pool.url_masked(), "Redis connection established"),
                Err(e) => tracing::warn!(
                    url = %pool.url_masked(),
                    error = %e,
                    "Redis not reachable yet, operations will retry"
                ),
            }
            Some(Arc::new(pool))
        } else {
            None
        };

        let postgres_pool = if settings.database.backend == "postgres" {
            let pool = PostgresPool::new(&settings.database)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to connect to PostgreSQL: {}", e)))?;
            PostgresChatStore::new(pool.clone()).ensure_schema().await?;
            tracing::info!(url = %pool.database_url_masked(), "Chat schema ready");
            Some(pool)
        } else {
            None
        };

        let store = create_chat_store(&settings.database, postgres_pool.clone());
        let broker = create_broker(&settings.broker, redis_pool.clone());
        let presence_store = create_presence_store(
            &settings.presence,
            &settings.redis,
            &settings.server.id,
            redis_pool.clone(),
        );
        let identity: Arc<dyn IdentityResolver> = Arc::new(JwtIdentityResolver::new(
            JwtValidator::new(&settings.jwt),
            Arc::clone(&store),
        ));

        let mut state = Self::from_parts(settings, store, broker, presence_store, identity);
        state.redis_pool = redis_pool;
        state.postgres_pool = postgres_pool;
        Ok(state)
    }

    /// Wire components around already-constructed backends.
    /// Must be called from within a Tokio runtime.
    pub fn from_parts(
        settings: Settings,
        store: Arc<dyn ChatStore>,
        broker: Arc<dyn Broker>,
        presence_store: Arc<dyn PresenceStore>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        let bridge = Arc::new(FanoutBridge::new(
            broker,
            FanoutConfig::from_settings(&settings.redis, &settings.broker),
        ));
        let presence = PresenceTracker::new(
            presence_store,
            PresenceWriterConfig::from_settings(&settings.presence),
        );
        let connection_manager = ConnectionManager::new(bridge, Arc::clone(&presence));
        let endpoint = Arc::new(DeliveryEndpoint::new(
            Arc::clone(&connection_manager),
            Arc::clone(&store),
            Arc::clone(&identity),
            EndpointConfig::from_settings(&settings.websocket),
        ));

        Self {
            settings: Arc::new(settings),
            start_time: Instant::now(),
            connection_manager,
            presence,
            store,
            identity,
            endpoint,
            redis_pool: None,
            postgres_pool: None,
        }
    }
}
