//! PostgreSQL chat store.
//!
//! Tables:
//! - `users`, `channels`, `channel_members` (membership join table)
//! - `messages` with a `status` column holding `sent` / `delivered` / `read`

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::chat::{Channel, ChannelId, ChannelKind, Message, MessageStatus, User, UserId, UserStatus};
use crate::metrics::BackendMetrics;
use crate::postgres::PostgresPool;

use super::{ChatStore, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL DEFAULT 'user',
        status TEXT NOT NULL DEFAULT 'offline',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS channels (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS channel_members (
        user_id BIGINT NOT NULL REFERENCES users(id),
        channel_id BIGINT NOT NULL REFERENCES channels(id),
        PRIMARY KEY (user_id, channel_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id BIGSERIAL PRIMARY KEY,
        content TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'sent',
        sender_id BIGINT NOT NULL REFERENCES users(id),
        channel_id BIGINT NOT NULL REFERENCES channels(id),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_channel_created ON messages (channel_id, created_at DESC)",
];

const MESSAGE_COLUMNS: &str = "id, content, sender_id, channel_id, status, created_at";

type UserRow = (i64, String, String, String, DateTime<Utc>);
type ChannelRow = (i64, String, String, DateTime<Utc>);
type MessageRow = (i64, String, i64, i64, String, DateTime<Utc>);

fn user_from_row(row: UserRow) -> Result<User, StoreError> {
    let (id, username, role, status, created_at) = row;
    let status = UserStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("user {} has status '{}'", id, status)))?;
    Ok(User {
        id,
        username,
        role,
        status,
        created_at,
    })
}

fn channel_from_row(row: ChannelRow) -> Result<Channel, StoreError> {
    let (id, name, kind, created_at) = row;
    let kind = ChannelKind::parse(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("channel {} has kind '{}'", id, kind)))?;
    Ok(Channel {
        id,
        name,
        kind,
        created_at,
    })
}

fn message_from_row(row: MessageRow) -> Result<Message, StoreError> {
    let (id, content, sender_id, channel_id, status, created_at) = row;
    let status = MessageStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("message {} has status '{}'", id, status)))?;
    Ok(Message {
        id,
        content,
        sender_id,
        channel_id,
        status,
        created_at,
    })
}

pub struct PostgresChatStore {
    pool: PgPool,
}

impl PostgresChatStore {
    pub fn new(pool: PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// Create the chat tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Chat store schema ready");
        Ok(())
    }

    fn observe<T>(
        &self,
        operation: &str,
        started: Instant,
        result: Result<T, sqlx::Error>,
    ) -> Result<T, StoreError> {
        BackendMetrics::record_latency("postgres", operation, started.elapsed().as_secs_f64());
        result.map_err(|e| {
            BackendMetrics::record_error("postgres", operation);
            tracing::error!(operation = %operation, error = %e, "Chat store query failed");
            StoreError::Postgres(e)
        })
    }
}

#[async_trait]
impl ChatStore for PostgresChatStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        let started = Instant::now();
        let row: Option<UserRow> = self.observe(
            "find_user",
            started,
            sqlx::query_as(
                "SELECT id, username, role, status, created_at FROM users WHERE id = $1",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await,
        )?;
        row.map(user_from_row).transpose()
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let started = Instant::now();
        let row: Option<UserRow> = self.observe(
            "find_user_by_username",
            started,
            sqlx::query_as(
                "SELECT id, username, role, status, created_at FROM users WHERE username = $1",
            )
            .bind(username)
            .fetch_optional(&self.pool)
            .await,
        )?;
        row.map(user_from_row).transpose()
    }

    async fn find_channel(&self, channel_id: ChannelId) -> Result<Option<Channel>, StoreError> {
        let started = Instant::now();
        let row: Option<ChannelRow> = self.observe(
            "find_channel",
            started,
            sqlx::query_as("SELECT id, name, kind, created_at FROM channels WHERE id = $1")
                .bind(channel_id)
                .fetch_optional(&self.pool)
                .await,
        )?;
        row.map(channel_from_row).transpose()
    }

    async fn is_member(&self, user_id: UserId, channel_id: ChannelId) -> Result<bool, StoreError> {
        let started = Instant::now();
        let (exists,): (bool,) = self.observe(
            "is_member",
            started,
            sqlx::query_as(
                "SELECT EXISTS(SELECT 1 FROM channel_members WHERE user_id = $1 AND channel_id = $2)",
            )
            .bind(user_id)
            .bind(channel_id)
            .fetch_one(&self.pool)
            .await,
        )?;
        Ok(exists)
    }

    async fn create_message(
        &self,
        channel_id: ChannelId,
        sender_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        let started = Instant::now();
        let sql = format!(
            "INSERT INTO messages (content, status, sender_id, channel_id) \
             VALUES ($1, 'sent', $2, $3) RETURNING {}",
            MESSAGE_COLUMNS
        );
        let row: MessageRow = self.observe(
            "create_message",
            started,
            sqlx::query_as(&sql)
                .bind(content)
                .bind(sender_id)
                .bind(channel_id)
                .fetch_one(&self.pool)
                .await,
        )?;
        message_from_row(row)
    }

    async fn set_user_status(&self, user_id: UserId, status: UserStatus) -> Result<(), StoreError> {
        let started = Instant::now();
        let result = self.observe(
            "set_user_status",
            started,
            sqlx::query("UPDATE users SET status = $2 WHERE id = $1")
                .bind(user_id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await,
        )?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound(user_id));
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        channel_id: ChannelId,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let started = Instant::now();
        let sql = format!(
            "SELECT {} FROM messages WHERE channel_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
            MESSAGE_COLUMNS
        );
        let rows: Vec<MessageRow> = self.observe(
            "list_messages",
            started,
            sqlx::query_as(&sql)
                .bind(channel_id)
                .bind(limit.max(0))
                .bind(skip.max(0))
                .fetch_all(&self.pool)
                .await,
        )?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn mark_channel_read(
        &self,
        channel_id: ChannelId,
        reader: UserId,
    ) -> Result<Vec<Message>, StoreError> {
        let started = Instant::now();
        let sql = format!(
            "UPDATE messages SET status = 'read' \
             WHERE channel_id = $1 AND sender_id <> $2 AND status <> 'read' \
             RETURNING {}",
            MESSAGE_COLUMNS
        );
        let rows: Vec<MessageRow> = self.observe(
            "mark_channel_read",
            started,
            sqlx::query_as(&sql)
                .bind(channel_id)
                .bind(reader)
                .fetch_all(&self.pool)
                .await,
        )?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn advance_message_status(
        &self,
        message_id: i64,
        status: MessageStatus,
    ) -> Result<Message, StoreError> {
        let started = Instant::now();
        let mut tx = self.observe("advance_message_status", started, self.pool.begin().await)?;

        // Row lock keeps the read-check-write atomic against concurrent updates
        let select = format!("SELECT {} FROM messages WHERE id = $1 FOR UPDATE", MESSAGE_COLUMNS);
        let row: Option<MessageRow> = self.observe(
            "advance_message_status",
            started,
            sqlx::query_as(&select)
                .bind(message_id)
                .fetch_optional(&mut *tx)
                .await,
        )?;
        let mut message = message_from_row(row.ok_or(StoreError::MessageNotFound(message_id))?)?;

        if message.status == status {
            return Ok(message);
        }
        if !message.status.can_advance_to(status) {
            return Err(StoreError::StatusRegression {
                from: message.status,
                to: status,
            });
        }

        self.observe(
            "advance_message_status",
            started,
            sqlx::query("UPDATE messages SET status = $2 WHERE id = $1")
                .bind(message_id)
                .bind(status.as_str())
                .execute(&mut *tx)
                .await,
        )?;
        self.observe("advance_message_status", started, tx.commit().await)?;

        message.status = status;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_row_conversion() {
        let now = Utc::now();
        let message =
            message_from_row((3, "hi".to_string(), 1, 7, "delivered".to_string(), now)).unwrap();
        assert_eq!(message.status, MessageStatus::Delivered);
        assert_eq!(message.channel_id, 7);
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let result = user_from_row((1, "alice".to_string(), "user".to_string(), "busy".to_string(), Utc::now()));
        assert!(matches!(result, Err(StoreError::Corrupt(_))));

        let result = channel_from_row((1, "general".to_string(), "broadcast".to_string(), Utc::now()));
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }
}
