//! In-process table of live sessions. Pure bookkeeping, no I/O: the
//! connection manager acts on the transitions it reports.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::chat::{ChannelId, UserId};

use super::session::Session;

/// What changed when a session was inserted
#[derive(Debug)]
pub struct Registration {
    /// Older session for the same (user, channel), now replaced
    pub superseded: Option<Arc<Session>>,
    /// The channel had no local subscriber before this insert
    pub channel_opened: bool,
    /// The user had no local session in any channel before this insert
    pub user_first_session: bool,
}

/// What changed when a session was removed
#[derive(Debug)]
pub struct Removal {
    pub session: Arc<Session>,
    /// The channel has no local subscriber left
    pub channel_emptied: bool,
    /// The user has no local session left in any channel
    pub user_last_session: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    /// (user_id, channel_id) -> session; at most one per pair
    sessions: HashMap<(UserId, ChannelId), Arc<Session>>,
    /// channel_id -> users with a session in that channel
    channels: HashMap<ChannelId, HashSet<UserId>>,
    /// user_id -> channels the user has a session in
    user_channels: HashMap<UserId, HashSet<ChannelId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Arc<Session>) -> Registration {
        let user_id = session.user_id;
        let channel_id = session.channel_id;
        let superseded = self.sessions.insert((user_id, channel_id), session);

        let members = self.channels.entry(channel_id).or_default();
        let channel_opened = members.is_empty();
        members.insert(user_id);

        let joined = self.user_channels.entry(user_id).or_default();
        let user_first_session = joined.is_empty();
        joined.insert(channel_id);

        Registration {
            superseded,
            channel_opened,
            user_first_session,
        }
    }

    /// Remove whatever session is registered for the pair.
    pub fn remove(&mut self, user_id: UserId, channel_id: ChannelId) -> Option<Removal> {
        let session = self.sessions.remove(&(user_id, channel_id))?;
        Some(self.unlink(session))
    }

    /// Remove `session` only if it is still the registered one for its pair,
    /// so cleanup of a superseded session never evicts its replacement.
    pub fn remove_if(&mut self, session: &Session) -> Option<Removal> {
        let key = (session.user_id, session.channel_id);
        match self.sessions.get(&key) {
            Some(current) if current.id == session.id => {}
            _ => return None,
        }
        let session = self.sessions.remove(&key)?;
        Some(self.unlink(session))
    }

    fn unlink(&mut self, session: Arc<Session>) -> Removal {
        let user_id = session.user_id;
        let channel_id = session.channel_id;

        let channel_emptied = match self.channels.get_mut(&channel_id) {
            Some(members) => {
                members.remove(&user_id);
                members.is_empty()
            }
            None => true,
        };
        if channel_emptied {
            self.channels.remove(&channel_id);
        }

        let user_last_session = match self.user_channels.get_mut(&user_id) {
            Some(joined) => {
                joined.remove(&channel_id);
                joined.is_empty()
            }
            None => true,
        };
        if user_last_session {
            self.user_channels.remove(&user_id);
        }

        Removal {
            session,
            channel_emptied,
            user_last_session,
        }
    }

    pub fn get(&self, user_id: UserId, channel_id: ChannelId) -> Option<Arc<Session>> {
        self.sessions.get(&(user_id, channel_id)).cloned()
    }

    pub fn contains(&self, user_id: UserId, channel_id: ChannelId) -> bool {
        self.sessions.contains_key(&(user_id, channel_id))
    }

    pub fn has_user(&self, user_id: UserId) -> bool {
        self.user_channels.contains_key(&user_id)
    }

    /// Sessions of every local subscriber of the channel, copied out.
    pub fn channel_snapshot(&self, channel_id: ChannelId) -> Vec<Arc<Session>> {
        self.channels
            .get(&channel_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|user_id| self.sessions.get(&(*user_id, channel_id)).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn channel_subscriber_count(&self, channel_id: ChannelId) -> usize {
        self.channels.get(&channel_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn channel_counts(&self) -> HashMap<ChannelId, usize> {
        self.channels
            .iter()
            .map(|(channel_id, members)| (*channel_id, members.len()))
            .collect()
    }

    pub fn users(&self) -> Vec<UserId> {
        self.user_channels.keys().copied().collect()
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn user_count(&self) -> usize {
        self.user_channels.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Remove every session at once.
    pub fn drain(&mut self) -> Vec<Arc<Session>> {
        self.channels.clear();
        self.user_channels.clear();
        self.sessions.drain().map(|(_, session)| session).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user_id: UserId, channel_id: ChannelId) -> Arc<Session> {
        Session::new(user_id, channel_id, 4).0
    }

    #[test]
    fn test_first_insert_opens_channel_and_user() {
        let mut registry = SessionRegistry::new();

        let first = registry.insert(session(1, 7));
        assert!(first.channel_opened);
        assert!(first.user_first_session);
        assert!(first.superseded.is_none());

        let second = registry.insert(session(2, 7));
        assert!(!second.channel_opened);
        assert!(second.user_first_session);

        let third = registry.insert(session(1, 8));
        assert!(third.channel_opened);
        assert!(!third.user_first_session);
    }

    #[test]
    fn test_same_pair_supersedes() {
        let mut registry = SessionRegistry::new();
        let old = session(1, 7);
        registry.insert(Arc::clone(&old));

        let registration = registry.insert(session(1, 7));
        let superseded = registration.superseded.unwrap();
        assert_eq!(superseded.id, old.id);
        assert!(!registration.channel_opened);
        assert!(!registration.user_first_session);
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.channel_subscriber_count(7), 1);
    }

    #[test]
    fn test_remove_reports_emptied_channel_and_last_session() {
        let mut registry = SessionRegistry::new();
        registry.insert(session(1, 7));
        registry.insert(session(2, 7));
        registry.insert(session(1, 8));

        let removal = registry.remove(1, 7).unwrap();
        assert!(!removal.channel_emptied);
        assert!(!removal.user_last_session);

        let removal = registry.remove(1, 8).unwrap();
        assert!(removal.channel_emptied);
        assert!(removal.user_last_session);
        assert!(!registry.has_user(1));

        assert!(registry.remove(1, 8).is_none());
    }

    #[test]
    fn test_remove_if_ignores_replaced_session() {
        let mut registry = SessionRegistry::new();
        let old = session(1, 7);
        registry.insert(Arc::clone(&old));
        let new = session(1, 7);
        registry.insert(Arc::clone(&new));

        assert!(registry.remove_if(&old).is_none());
        assert!(registry.contains(1, 7));

        let removal = registry.remove_if(&new).unwrap();
        assert_eq!(removal.session.id, new.id);
        assert!(removal.channel_emptied);
    }

    #[test]
    fn test_snapshot_is_detached_from_registry() {
        let mut registry = SessionRegistry::new();
        registry.insert(session(1, 7));
        registry.insert(session(2, 7));

        let snapshot = registry.channel_snapshot(7);
        registry.remove(2, 7);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.channel_snapshot(7).len(), 1);
    }

    #[test]
    fn test_drain_clears_everything() {
        let mut registry = SessionRegistry::new();
        registry.insert(session(1, 7));
        registry.insert(session(2, 8));

        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.user_count(), 0);
        assert_eq!(registry.channel_count(), 0);
    }
}
