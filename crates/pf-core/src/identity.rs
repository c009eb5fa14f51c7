//! Identity resolution: credentials in, [`Principal`] out.
//!
//! The auth and subscription stores are external collaborators; this module
//! only defines the trait seams and the resolution order:
//!
//! 1. API key, if present, must be valid — an invalid key fails the request.
//! 2. A bearer token is best-effort — an invalid token degrades the caller
//!    to anonymous instead of failing.
//! 3. Anonymous callers are bucketed by a stable hash of their address.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::catalog::TierCatalog;
use crate::error::CoreError;
use crate::types::{Principal, PrincipalId};

// ---------------------------------------------------------------------------
// Store seams
// ---------------------------------------------------------------------------

/// An API key record as the external key store reports it.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub user_id: i64,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

/// A user record as the external account store reports it.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub is_active: bool,
    /// Name of the user's subscription tier, if any.
    pub tier: Option<String>,
}

/// Verified claims extracted from a bearer token.
#[derive(Debug, Clone)]
pub struct TokenClaims {
    /// Subject — the user's email address.
    pub subject: String,
    pub expires_at: DateTime<Utc>,
}

/// Read-only view of the external API key store.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn lookup(&self, key: &str) -> Option<ApiKeyRecord>;
}

/// Read-only view of the external user/subscription store.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn by_id(&self, id: i64) -> Option<UserRecord>;
    async fn by_email(&self, email: &str) -> Option<UserRecord>;
}

/// Verifies bearer tokens (signature and expiry). Token issuance lives
/// outside the core.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<TokenClaims>;
}

// ---------------------------------------------------------------------------
// IdentityResolver
// ---------------------------------------------------------------------------

/// Credentials extracted from one inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestCredentials<'a> {
    pub api_key: Option<&'a str>,
    pub bearer: Option<&'a str>,
    pub client_addr: &'a str,
}

/// Resolves request credentials into a [`Principal`] with a tier snapshot.
pub struct IdentityResolver {
    catalog: Arc<TierCatalog>,
    api_keys: Arc<dyn ApiKeyStore>,
    users: Arc<dyn UserStore>,
    tokens: Arc<dyn TokenVerifier>,
}

impl IdentityResolver {
    pub fn new(
        catalog: Arc<TierCatalog>,
        api_keys: Arc<dyn ApiKeyStore>,
        users: Arc<dyn UserStore>,
        tokens: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            catalog,
            api_keys,
            users,
            tokens,
        }
    }

    /// Resolve credentials to a principal.
    ///
    /// Fails only for an API key that is present but unusable; every other
    /// path yields a principal (possibly anonymous).
    pub async fn resolve(&self, creds: RequestCredentials<'_>) -> Result<Principal, CoreError> {
        let now = Utc::now();

        if let Some(key) = creds.api_key {
            let record = self
                .api_keys
                .lookup(key)
                .await
                .filter(|rec| rec.is_usable_at(now))
                .ok_or_else(|| CoreError::Unauthenticated("invalid or expired API key".into()))?;

            let user = self
                .users
                .by_id(record.user_id)
                .await
                .filter(|u| u.is_active)
                .ok_or_else(|| {
                    CoreError::Unauthenticated("API key is not tied to an active user".into())
                })?;

            return Ok(Principal {
                id: PrincipalId::User(user.id),
                tier: self.catalog.resolve(user.tier.as_deref()),
                api_key_id: Some(record.id),
            });
        }

        if let Some(token) = creds.bearer {
            match self.tokens.verify(token).filter(|c| c.expires_at > now) {
                Some(claims) => {
                    if let Some(user) = self
                        .users
                        .by_email(&claims.subject)
                        .await
                        .filter(|u| u.is_active)
                    {
                        return Ok(Principal {
                            id: PrincipalId::User(user.id),
                            tier: self.catalog.resolve(user.tier.as_deref()),
                            api_key_id: None,
                        });
                    }
                    tracing::debug!(subject = %claims.subject, "bearer subject unknown, degrading to anonymous");
                }
                None => {
                    tracing::debug!("bearer token failed verification, degrading to anonymous");
                }
            }
        }

        Ok(self.anonymous(creds.client_addr))
    }

    /// Build the anonymous principal for a client address.
    pub fn anonymous(&self, client_addr: &str) -> Principal {
        Principal {
            id: PrincipalId::Anonymous(ip_bucket(client_addr)),
            tier: self.catalog.default_limits(),
            api_key_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Anonymous bucketing
// ---------------------------------------------------------------------------

/// Stable bucket for an unauthenticated client address.
///
/// FNV-1a rather than the std hasher: the bucket must be identical across
/// processes and restarts, and `DefaultHasher` is randomly seeded.
pub fn ip_bucket(addr: &str) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in addr.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % 1_000_000) as u32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
