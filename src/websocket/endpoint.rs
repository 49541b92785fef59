//! Per-connection chat lifecycle, independent of the socket itself.
//!
//! `Connecting -> Authenticated -> Active -> Closing -> Closed`, with
//! `Rejected` reachable before a session exists.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::close_code;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::auth::IdentityResolver;
use crate::chat::{Channel, ChannelId, Message, User, UserStatus};
use crate::config::WebSocketConfig;
use crate::connection_manager::{ConnectError, ConnectionManager, Outbound, Session};
use crate::metrics::DeliveryMetrics;
use crate::store::{ChatStore, StoreError};

use super::message::{DeliveryEvent, InboundFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
    Rejected,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Connecting, Rejected)
                | (Authenticated, Active)
                | (Authenticated, Rejected)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    /// Move to `next`, logging transitions that should not happen.
    pub fn advance(self, next: SessionState) -> SessionState {
        if !self.can_transition_to(next) {
            tracing::warn!(from = ?self, to = ?next, "Unexpected session state transition");
        }
        next
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Rejected)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Not allowed: {0}")]
    AuthorizationFailure(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Invalid message: {0}")]
    DecodeFailure(String),

    #[error("Message could not be saved: {0}")]
    PersistenceFailure(#[from] StoreError),

    #[error("Connection refused: {0}")]
    Connect(#[from] ConnectError),
}

impl DeliveryError {
    /// WebSocket close code used when this error ends a connection
    pub fn close_code(&self) -> u16 {
        match self {
            DeliveryError::AuthFailure(_) | DeliveryError::AuthorizationFailure(_) => {
                close_code::POLICY
            }
            DeliveryError::Connect(ConnectError::ShuttingDown) => close_code::AWAY,
            _ => close_code::ERROR,
        }
    }

    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryError::AuthFailure(_) => "auth",
            DeliveryError::AuthorizationFailure(_) => "forbidden",
            DeliveryError::TransportFailure(_) => "transport",
            DeliveryError::DecodeFailure(_) => "decode",
            DeliveryError::PersistenceFailure(_) => "store",
            DeliveryError::Connect(_) => "connect",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub max_message_length: usize,
    pub outbound_queue_capacity: usize,
    pub write_timeout: Duration,
}

impl EndpointConfig {
    pub fn from_settings(config: &WebSocketConfig) -> Self {
        Self {
            max_message_length: config.max_message_length,
            outbound_queue_capacity: config.outbound_queue_capacity,
            write_timeout: Duration::from_millis(config.write_timeout_ms),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::from_settings(&WebSocketConfig::default())
    }
}

/// A registered session together with who and where it is
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub session: Arc<Session>,
    pub user: User,
    pub channel: Channel,
}

pub struct DeliveryEndpoint {
    manager: Arc<ConnectionManager>,
    store: Arc<dyn ChatStore>,
    identity: Arc<dyn IdentityResolver>,
    config: EndpointConfig,
}

impl DeliveryEndpoint {
    pub fn new(
        manager: Arc<ConnectionManager>,
        store: Arc<dyn ChatStore>,
        identity: Arc<dyn IdentityResolver>,
        config: EndpointConfig,
    ) -> Self {
        Self {
            manager,
            store,
            identity,
            config,
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// `Connecting -> Authenticated`
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<User, DeliveryError> {
        let credential = credential
            .filter(|c| !c.is_empty())
            .ok_or_else(|| DeliveryError::AuthFailure("missing token".to_string()))?;

        self.identity
            .resolve_identity(credential)
            .await
            .ok_or_else(|| DeliveryError::AuthFailure("invalid token".to_string()))
    }

    /// Channel must exist and the user must be one of its members.
    pub async fn authorize(
        &self,
        user: &User,
        channel_id: Option<ChannelId>,
    ) -> Result<Channel, DeliveryError> {
        let channel_id = channel_id.ok_or_else(|| {
            DeliveryError::AuthorizationFailure("channel_id is required".to_string())
        })?;

        let channel = self.store.find_channel(channel_id).await?.ok_or_else(|| {
            DeliveryError::AuthorizationFailure(format!("channel {} does not exist", channel_id))
        })?;

        if !self.store.is_member(user.id, channel.id).await? {
            return Err(DeliveryError::AuthorizationFailure(format!(
                "user {} is not a member of channel {}",
                user.id, channel.id
            )));
        }

        Ok(channel)
    }

    /// `Authenticated -> Active`: register the session, persist the user as
    /// online and announce the join to the channel.
    #[tracing::instrument(
        name = "endpoint.activate",
        skip(self, user, channel),
        fields(user_id = user.id, channel_id = channel.id)
    )]
    pub async fn activate(
        &self,
        user: User,
        channel: Channel,
    ) -> Result<(ActiveSession, mpsc::Receiver<Outbound>), DeliveryError> {
        let (session, receiver) =
            Session::new(user.id, channel.id, self.config.outbound_queue_capacity);
        self.manager.connect(Arc::clone(&session)).await?;

        if let Err(e) = self.store.set_user_status(user.id, UserStatus::Online).await {
            tracing::warn!(error = %e, "Failed to persist online status");
        }

        if let Err(e) = self
            .manager
            .publish(channel.id, DeliveryEvent::joined(channel.id, &user))
            .await
        {
            tracing::warn!(error = %e, "Join notification not delivered");
        }

        Ok((
            ActiveSession {
                session,
                user,
                channel,
            },
            receiver,
        ))
    }

    /// Handle one text frame of an active session.
    ///
    /// On failure the error is reported to this session only and nothing is
    /// published; the session stays open.
    #[tracing::instrument(
        name = "endpoint.text",
        skip(self, active, text),
        fields(user_id = active.user.id, channel_id = active.channel.id)
    )]
    pub async fn handle_text(
        &self,
        active: &ActiveSession,
        text: &str,
    ) -> Result<Message, DeliveryError> {
        active.session.touch();

        match self.accept_message(active, text).await {
            Ok(message) => Ok(message),
            Err(e) => {
                tracing::debug!(error = %e, "Inbound frame rejected");
                self.report_error(active, e.to_string());
                Err(e)
            }
        }
    }

    async fn accept_message(
        &self,
        active: &ActiveSession,
        text: &str,
    ) -> Result<Message, DeliveryError> {
        let frame: InboundFrame = serde_json::from_str(text)
            .map_err(|e| DeliveryError::DecodeFailure(e.to_string()))?;
        let content = self.validate(active, &frame)?;

        let message = self
            .store
            .create_message(active.channel.id, active.user.id, content)
            .await?;
        DeliveryMetrics::record_persisted();

        if let Err(e) = self
            .manager
            .publish(active.channel.id, DeliveryEvent::message(&message))
            .await
        {
            tracing::error!(error = %e, message_id = message.id, "Persisted message was not published");
        }

        Ok(message)
    }

    fn validate<'a>(
        &self,
        active: &ActiveSession,
        frame: &'a InboundFrame,
    ) -> Result<&'a str, DeliveryError> {
        let content = frame.content.trim();
        if content.is_empty() {
            return Err(DeliveryError::DecodeFailure(
                "Message content cannot be empty".to_string(),
            ));
        }
        if content.chars().count() > self.config.max_message_length {
            return Err(DeliveryError::DecodeFailure(format!(
                "Message exceeds {} characters",
                self.config.max_message_length
            )));
        }
        if let Some(channel_id) = frame.channel_id {
            if channel_id != active.channel.id {
                return Err(DeliveryError::DecodeFailure(format!(
                    "channel_id {} does not match this connection",
                    channel_id
                )));
            }
        }
        Ok(content)
    }

    /// Binary frames are not part of the chat protocol.
    pub fn handle_binary(&self, active: &ActiveSession) {
        active.session.touch();
        self.report_error(active, "Binary messages are not supported");
    }

    fn report_error(&self, active: &ActiveSession, message: impl Into<String>) {
        let event = Arc::new(DeliveryEvent::error(active.channel.id, message));
        if active.session.try_deliver(event).is_err() {
            active.session.close();
        }
    }

    /// `Closing -> Closed`: release the session, announce the departure
    /// and persist the user as offline once no process holds a session
    /// for them.
    #[tracing::instrument(
        name = "endpoint.close",
        skip(self, active),
        fields(user_id = active.user.id, channel_id = active.channel.id)
    )]
    pub async fn close(&self, active: &ActiveSession) -> SessionState {
        let ActiveSession {
            session,
            user,
            channel,
        } = active;
        self.manager.disconnect_session(session).await;

        // A replacement session for the same pair keeps the user in the channel
        if !self.manager.is_in_channel(user.id, channel.id) {
            if let Err(e) = self
                .manager
                .publish(channel.id, DeliveryEvent::left(channel.id, user))
                .await
            {
                tracing::warn!(error = %e, "Leave notification not delivered");
            }
        }

        // Local presence first, then the shared set: another process may
        // still hold a session for this user
        if !self.manager.is_present(user.id) {
            match self.manager.presence().is_online(user.id).await {
                Ok(false) => {
                    if let Err(e) = self.store.set_user_status(user.id, UserStatus::Offline).await {
                        tracing::warn!(error = %e, "Failed to persist offline status");
                    }
                }
                Ok(true) => {
                    tracing::debug!("User still connected through another process");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Presence unavailable, offline status not persisted");
                }
            }
        }

        SessionState::Closed
    }
}
