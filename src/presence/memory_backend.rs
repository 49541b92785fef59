//! Process-local presence store.
//!
//! `with_peer` hands out a view of the same state under another server id,
//! which lets tests run several connection managers against one presence
//! set the way separate processes share one Redis.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::chat::UserId;

use super::{PresenceError, PresenceStore};

pub struct MemoryPresenceStore {
    /// User id -> ids of the processes holding a session for that user
    holders: Arc<DashMap<UserId, HashSet<String>>>,
    server_id: String,
}

impl MemoryPresenceStore {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            holders: Arc::new(DashMap::new()),
            server_id: server_id.into(),
        }
    }

    /// Another process's view of the same presence state.
    pub fn with_peer(&self, server_id: impl Into<String>) -> Self {
        Self {
            holders: Arc::clone(&self.holders),
            server_id: server_id.into(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn add(&self, user_id: UserId) -> Result<(), PresenceError> {
        self.holders
            .entry(user_id)
            .or_default()
            .insert(self.server_id.clone());
        Ok(())
    }

    async fn remove(&self, user_id: UserId) -> Result<(), PresenceError> {
        if let Some(mut holders) = self.holders.get_mut(&user_id) {
            holders.remove(&self.server_id);
        }
        self.holders.remove_if(&user_id, |_, holders| holders.is_empty());
        Ok(())
    }

    async fn members(&self) -> Result<BTreeSet<UserId>, PresenceError> {
        Ok(self
            .holders
            .iter()
            .filter(|entry| !entry.is_empty())
            .map(|entry| *entry.key())
            .collect())
    }

    async fn contains(&self, user_id: UserId) -> Result<bool, PresenceError> {
        Ok(self
            .holders
            .get(&user_id)
            .map(|holders| !holders.is_empty())
            .unwrap_or(false))
    }
}
