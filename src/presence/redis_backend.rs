//! Redis presence store.
//!
//! Keys:
//! - `{key}`: set of online user ids
//! - `{key}:holders:{user_id}`: set of server ids holding that user's sessions

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use redis::{AsyncCommands, Script};

use crate::chat::UserId;
use crate::metrics::BackendMetrics;
use crate::redis::RedisPool;

use super::{PresenceError, PresenceStore};

/// Removes the calling server from a user's holders and drops the user from
/// the online set once no holder remains, in one atomic step.
const RELEASE_SCRIPT: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
if redis.call('SCARD', KEYS[1]) == 0 then
    redis.call('SREM', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

pub struct RedisPresenceStore {
    pool: Arc<RedisPool>,
    key: String,
    server_id: String,
    release: Script,
}

impl RedisPresenceStore {
    pub fn new(pool: Arc<RedisPool>, key: String, server_id: String) -> Self {
        Self {
            pool,
            key,
            server_id,
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn holders_key(&self, user_id: UserId) -> String {
        format!("{}:holders:{}", self.key, user_id)
    }

    fn record<T>(&self, operation: &str, started: Instant, result: &Result<T, PresenceError>) {
        BackendMetrics::record_latency("redis", operation, started.elapsed().as_secs_f64());
        if result.is_err() {
            BackendMetrics::record_error("redis", operation);
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn add(&self, user_id: UserId) -> Result<(), PresenceError> {
        let started = Instant::now();
        let holders = self.holders_key(user_id);
        let online = self.key.clone();
        let server_id = self.server_id.clone();

        let result = self
            .pool
            .execute(|mut conn| async move {
                let _: () = redis::pipe()
                    .atomic()
                    .sadd(&holders, &server_id)
                    .ignore()
                    .sadd(&online, user_id)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            })
            .await
            .map_err(PresenceError::from);

        self.record("presence_add", started, &result);
        result
    }

    async fn remove(&self, user_id: UserId) -> Result<(), PresenceError> {
        let started = Instant::now();
        let holders = self.holders_key(user_id);
        let online = self.key.clone();
        let server_id = self.server_id.clone();
        let script = self.release.clone();

        let result = self
            .pool
            .execute(|mut conn| async move {
                let went_offline: i32 = script
                    .key(&holders)
                    .key(&online)
                    .arg(&server_id)
                    .arg(user_id)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(went_offline)
            })
            .await
            .map_err(PresenceError::from);

        self.record("presence_remove", started, &result);
        if let Ok(1) = result {
            tracing::debug!(user_id = user_id, "User has no remaining holders");
        }
        result.map(|_| ())
    }

    async fn members(&self) -> Result<BTreeSet<UserId>, PresenceError> {
        let key = self.key.clone();
        let ids: Vec<UserId> = self
            .pool
            .execute(|mut conn| async move { conn.smembers(&key).await })
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn contains(&self, user_id: UserId) -> Result<bool, PresenceError> {
        let key = self.key.clone();
        let found: bool = self
            .pool
            .execute(|mut conn| async move { conn.sismember(&key, user_id).await })
            .await?;
        Ok(found)
    }
}
