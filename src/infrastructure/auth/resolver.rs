//! Resolves handshake credentials into chat users.

use std::sync::Arc;

use async_trait::async_trait;

use crate::chat::User;
use crate::store::ChatStore;

use super::JwtValidator;

/// Auth collaborator consulted by the delivery endpoint.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Returns the user a credential belongs to, or `None` when the
    /// credential is invalid, expired, or names an unknown user.
    async fn resolve_identity(&self, credential: &str) -> Option<User>;
}

/// JWT bearer tokens whose `sub` claim is a username.
pub struct JwtIdentityResolver {
    validator: JwtValidator,
    store: Arc<dyn ChatStore>,
}

impl JwtIdentityResolver {
    pub fn new(validator: JwtValidator, store: Arc<dyn ChatStore>) -> Self {
        Self { validator, store }
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve_identity(&self, credential: &str) -> Option<User> {
        let claims = match self.validator.validate(credential) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!(error = %e, "JWT validation failed");
                return None;
            }
        };

        match self.store.find_user_by_username(claims.username()).await {
            Ok(user) => user,
            Err(e) => {
                tracing::error!(error = %e, username = %claims.username(), "User lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{sign_token, Claims};
    use crate::config::JwtConfig;
    use crate::store::MemoryChatStore;

    fn config() -> JwtConfig {
        JwtConfig {
            secret: "resolver-secret".to_string(),
            issuer: None,
            audience: None,
        }
    }

    #[tokio::test]
    async fn test_resolves_known_user() {
        let store = Arc::new(MemoryChatStore::new());
        let alice = store.add_user("alice");
        let resolver = JwtIdentityResolver::new(JwtValidator::new(&config()), store);

        let token = sign_token(&config(), &Claims::new("alice", 600)).unwrap();
        let user = resolver.resolve_identity(&token).await.unwrap();
        assert_eq!(user.id, alice.id);
    }

    #[tokio::test]
    async fn test_unknown_user_resolves_to_none() {
        let store = Arc::new(MemoryChatStore::new());
        let resolver = JwtIdentityResolver::new(JwtValidator::new(&config()), store);

        let token = sign_token(&config(), &Claims::new("ghost", 600)).unwrap();
        assert!(resolver.resolve_identity(&token).await.is_none());
    }

    #[tokio::test]
    async fn test_garbage_credential_resolves_to_none() {
        let store = Arc::new(MemoryChatStore::new());
        store.add_user("alice");
        let resolver = JwtIdentityResolver::new(JwtValidator::new(&config()), store);

        assert!(resolver.resolve_identity("not-a-jwt").await.is_none());
    }
}
