//! Config-seeded implementations of the identity seams.
//!
//! The production user, API-key, and token stores are external systems; a
//! standalone daemon resolves principals from entries in its own config
//! file instead. Bearer verification here is opaque-token lookup — token
//! issuance and signature schemes stay outside the core.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use pf_core::catalog::TierCatalog;
use pf_core::config::AuthConfig;
use pf_core::identity::{
    ApiKeyRecord, ApiKeyStore, IdentityResolver, TokenClaims, TokenVerifier, UserRecord, UserStore,
};

/// Static identity store built from the `[auth]` config section.
pub struct StaticAuthStore {
    users: Vec<UserRecord>,
    api_keys: HashMap<String, ApiKeyRecord>,
    bearer_tokens: HashMap<String, TokenClaims>,
}

impl StaticAuthStore {
    pub fn from_config(auth: &AuthConfig) -> Self {
        let users = auth
            .users
            .iter()
            .map(|u| UserRecord {
                id: u.id,
                email: u.email.clone(),
                is_active: u.is_active,
                tier: u.tier.clone(),
            })
            .collect();

        let api_keys = auth
            .api_keys
            .iter()
            .map(|k| {
                (
                    k.key.clone(),
                    ApiKeyRecord {
                        id: k.id,
                        user_id: k.user_id,
                        is_active: k.is_active,
                        expires_at: parse_expiry(k.expires_at.as_deref()),
                    },
                )
            })
            .collect();

        let bearer_tokens = auth
            .bearer_tokens
            .iter()
            .map(|t| {
                (
                    t.token.clone(),
                    TokenClaims {
                        subject: t.subject.clone(),
                        expires_at: parse_expiry(t.expires_at.as_deref())
                            .unwrap_or(DateTime::<Utc>::MAX_UTC),
                    },
                )
            })
            .collect();

        Self {
            users,
            api_keys,
            bearer_tokens,
        }
    }

    /// Build a full resolver over this store.
    pub fn resolver(self, catalog: Arc<TierCatalog>) -> IdentityResolver {
        let store = Arc::new(self);
        IdentityResolver::new(catalog, store.clone(), store.clone(), store)
    }
}

/// Malformed timestamps are treated as already expired, not ignored.
fn parse_expiry(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            warn!(raw, error = %e, "unparseable expiry in auth config, treating as expired");
            Some(DateTime::<Utc>::MIN_UTC)
        }
    }
}

#[async_trait]
impl ApiKeyStore for StaticAuthStore {
    async fn lookup(&self, key: &str) -> Option<ApiKeyRecord> {
        self.api_keys.get(key).cloned()
    }
}

#[async_trait]
impl UserStore for StaticAuthStore {
    async fn by_id(&self, id: i64) -> Option<UserRecord> {
        self.users.iter().find(|u| u.id == id).cloned()
    }

    async fn by_email(&self, email: &str) -> Option<UserRecord> {
        self.users.iter().find(|u| u.email == email).cloned()
    }
}

impl TokenVerifier for StaticAuthStore {
    fn verify(&self, token: &str) -> Option<TokenClaims> {
        self.bearer_tokens.get(token).cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
