//! In-memory chat store using DashMap.
//!
//! Data lives only as long as the process. Seeding helpers
//! (`add_user`, `add_channel`, `add_member`) stand in for the signup and
//! channel-management flows that live outside this service.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::chat::{Channel, ChannelId, ChannelKind, Message, MessageStatus, User, UserId, UserStatus};

use super::{ChatStore, StoreError};

pub struct MemoryChatStore {
    users: DashMap<UserId, User>,
    channels: DashMap<ChannelId, Channel>,
    /// Channel id -> member user ids
    members: DashMap<ChannelId, HashSet<UserId>>,
    /// Append-only message log; ids are assigned in insertion order
    messages: RwLock<Vec<Message>>,
    next_user_id: AtomicI64,
    next_channel_id: AtomicI64,
    next_message_id: AtomicI64,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            channels: DashMap::new(),
            members: DashMap::new(),
            messages: RwLock::new(Vec::new()),
            next_user_id: AtomicI64::new(1),
            next_channel_id: AtomicI64::new(1),
            next_message_id: AtomicI64::new(1),
        }
    }

    /// Register a user with role `user` and status `offline`.
    pub fn add_user(&self, username: &str) -> User {
        let user = User {
            id: self.next_user_id.fetch_add(1, Ordering::Relaxed),
            username: username.to_string(),
            role: "user".to_string(),
            status: UserStatus::Offline,
            created_at: Utc::now(),
        };
        self.users.insert(user.id, user.clone());
        user
    }

    /// Create a channel with the given members.
    pub fn add_channel(&self, name: &str, kind: ChannelKind, members: &[UserId]) -> Channel {
        let channel = Channel {
            id: self.next_channel_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            kind,
            created_at: Utc::now(),
        };
        self.channels.insert(channel.id, channel.clone());
        self.members
            .insert(channel.id, members.iter().copied().collect());
        channel
    }

    pub fn add_member(&self, channel_id: ChannelId, user_id: UserId) -> Result<(), StoreError> {
        if !self.channels.contains_key(&channel_id) {
            return Err(StoreError::ChannelNotFound(channel_id));
        }
        if !self.users.contains_key(&user_id) {
            return Err(StoreError::UserNotFound(user_id));
        }
        self.members.entry(channel_id).or_default().insert(user_id);
        Ok(())
    }

    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }
}

impl Default for MemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn find_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|entry| entry.username == username)
            .map(|entry| entry.value().clone()))
    }

    async fn find_channel(&self, channel_id: ChannelId) -> Result<Option<Channel>, StoreError> {
        Ok(self.channels.get(&channel_id).map(|c| c.clone()))
    }

    async fn is_member(&self, user_id: UserId, channel_id: ChannelId) -> Result<bool, StoreError> {
        Ok(self
            .members
            .get(&channel_id)
            .map(|m| m.contains(&user_id))
            .unwrap_or(false))
    }

    async fn create_message(
        &self,
        channel_id: ChannelId,
        sender_id: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        if !self.channels.contains_key(&channel_id) {
            return Err(StoreError::ChannelNotFound(channel_id));
        }

        let message = Message {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            content: content.to_string(),
            sender_id,
            channel_id,
            status: MessageStatus::Sent,
            created_at: Utc::now(),
        };
        self.messages.write().push(message.clone());
        Ok(message)
    }

    async fn set_user_status(&self, user_id: UserId, status: UserStatus) -> Result<(), StoreError> {
        match self.users.get_mut(&user_id) {
            Some(mut user) => {
                user.status = status;
                Ok(())
            }
            None => Err(StoreError::UserNotFound(user_id)),
        }
    }

    async fn list_messages(
        &self,
        channel_id: ChannelId,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.read();
        // Ids grow with insertion time, so reverse log order is newest first
        Ok(messages
            .iter()
            .rev()
            .filter(|m| m.channel_id == channel_id)
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_channel_read(
        &self,
        channel_id: ChannelId,
        reader: UserId,
    ) -> Result<Vec<Message>, StoreError> {
        let mut messages = self.messages.write();
        let mut changed = Vec::new();
        for message in messages.iter_mut() {
            if message.channel_id == channel_id
                && message.sender_id != reader
                && message.status != MessageStatus::Read
            {
                message.status = MessageStatus::Read;
                changed.push(message.clone());
            }
        }
        Ok(changed)
    }

    async fn advance_message_status(
        &self,
        message_id: i64,
        status: MessageStatus,
    ) -> Result<Message, StoreError> {
        let mut messages = self.messages.write();
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;

        if message.status == status {
            return Ok(message.clone());
        }
        if !message.status.can_advance_to(status) {
            return Err(StoreError::StatusRegression {
                from: message.status,
                to: status,
            });
        }
        message.status = status;
        Ok(message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (MemoryChatStore, User, User, Channel) {
        let store = MemoryChatStore::new();
        let alice = store.add_user("alice");
        let bob = store.add_user("bob");
        let channel = store.add_channel("general", ChannelKind::Group, &[alice.id, bob.id]);
        (store, alice, bob, channel)
    }

    #[tokio::test]
    async fn test_membership() {
        let (store, alice, _bob, channel) = seeded();
        let carol = store.add_user("carol");

        assert!(store.is_member(alice.id, channel.id).await.unwrap());
        assert!(!store.is_member(carol.id, channel.id).await.unwrap());

        store.add_member(channel.id, carol.id).unwrap();
        assert!(store.is_member(carol.id, channel.id).await.unwrap());
        assert!(!store.is_member(alice.id, 999).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_message_starts_as_sent() {
        let (store, alice, _bob, channel) = seeded();

        let message = store.create_message(channel.id, alice.id, "hi").await.unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.sender_id, alice.id);
        assert_eq!(store.message_count(), 1);

        let missing = store.create_message(999, alice.id, "hi").await;
        assert!(matches!(missing, Err(StoreError::ChannelNotFound(999))));
    }

    #[tokio::test]
    async fn test_list_messages_newest_first_with_paging() {
        let (store, alice, _bob, channel) = seeded();
        for i in 0..5 {
            store
                .create_message(channel.id, alice.id, &format!("m{}", i))
                .await
                .unwrap();
        }

        let page = store.list_messages(channel.id, 2, 1).await.unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m2"]);
    }

    #[tokio::test]
    async fn test_mark_channel_read_skips_own_messages() {
        let (store, alice, bob, channel) = seeded();
        store.create_message(channel.id, alice.id, "from alice").await.unwrap();
        store.create_message(channel.id, bob.id, "from bob").await.unwrap();

        let changed = store.mark_channel_read(channel.id, bob.id).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].content, "from alice");

        // Second pass has nothing left to change
        assert!(store.mark_channel_read(channel.id, bob.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let (store, alice, _bob, channel) = seeded();
        let message = store.create_message(channel.id, alice.id, "hi").await.unwrap();

        let read = store
            .advance_message_status(message.id, MessageStatus::Read)
            .await
            .unwrap();
        assert_eq!(read.status, MessageStatus::Read);

        let result = store
            .advance_message_status(message.id, MessageStatus::Delivered)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::StatusRegression {
                from: MessageStatus::Read,
                to: MessageStatus::Delivered
            })
        ));

        // Same status is accepted as a no-op
        let again = store
            .advance_message_status(message.id, MessageStatus::Read)
            .await
            .unwrap();
        assert_eq!(again.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_set_user_status() {
        let (store, alice, _bob, _channel) = seeded();

        store.set_user_status(alice.id, UserStatus::Online).await.unwrap();
        let found = store.find_user_by_username("alice").await.unwrap().unwrap();
        assert_eq!(found.status, UserStatus::Online);

        let missing = store.set_user_status(999, UserStatus::Online).await;
        assert!(matches!(missing, Err(StoreError::UserNotFound(999))));
    }
}
