use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pf_core::catalog::TierCatalog;
use pf_core::error::CoreError;
use pf_core::identity::{
    ApiKeyRecord, ApiKeyStore, IdentityResolver, RequestCredentials, TokenClaims, TokenVerifier,
    UserRecord, UserStore,
};
use pf_core::types::PrincipalId;

// ---------------------------------------------------------------------------
// Fixture stores
// ---------------------------------------------------------------------------

struct FixtureKeys(HashMap<String, ApiKeyRecord>);

#[async_trait]
impl ApiKeyStore for FixtureKeys {
    async fn lookup(&self, key: &str) -> Option<ApiKeyRecord> {
        self.0.get(key).cloned()
    }
}

struct FixtureUsers(Vec<UserRecord>);

#[async_trait]
impl UserStore for FixtureUsers {
    async fn by_id(&self, id: i64) -> Option<UserRecord> {
        self.0.iter().find(|u| u.id == id).cloned()
    }

    async fn by_email(&self, email: &str) -> Option<UserRecord> {
        self.0.iter().find(|u| u.email == email).cloned()
    }
}

struct FixtureTokens(HashMap<String, TokenClaims>);

impl TokenVerifier for FixtureTokens {
    fn verify(&self, token: &str) -> Option<TokenClaims> {
        self.0.get(token).cloned()
    }
}

fn resolver() -> IdentityResolver {
    let now = Utc::now();
    let keys = FixtureKeys(HashMap::from([
        (
            "key-live".to_string(),
            ApiKeyRecord {
                id: 11,
                user_id: 1,
                is_active: true,
                expires_at: Some(now + Duration::hours(1)),
            },
        ),
        (
            "key-expired".to_string(),
            ApiKeyRecord {
                id: 12,
                user_id: 1,
                is_active: true,
                expires_at: Some(now - Duration::hours(1)),
            },
        ),
    ]));
    let users = FixtureUsers(vec![
        UserRecord {
            id: 1,
            email: "ops@example.net".to_string(),
            is_active: true,
            tier: Some("standard".to_string()),
        },
        UserRecord {
            id: 2,
            email: "gone@example.net".to_string(),
            is_active: false,
            tier: Some("enterprise".to_string()),
        },
    ]);
    let tokens = FixtureTokens(HashMap::from([
        (
            "bearer-good".to_string(),
            TokenClaims {
                subject: "ops@example.net".to_string(),
                expires_at: now + Duration::hours(1),
            },
        ),
        (
            "bearer-inactive-user".to_string(),
            TokenClaims {
                subject: "gone@example.net".to_string(),
                expires_at: now + Duration::hours(1),
            },
        ),
    ]));

    IdentityResolver::new(
        Arc::new(TierCatalog::with_builtin_tiers()),
        Arc::new(keys),
        Arc::new(users),
        Arc::new(tokens),
    )
}

// ---------------------------------------------------------------------------
// Resolution order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn api_key_wins_and_snapshots_tier() {
    let principal = resolver()
        .resolve(RequestCredentials {
            api_key: Some("key-live"),
            bearer: None,
            client_addr: "198.51.100.4",
        })
        .await
        .expect("resolve");

    assert_eq!(principal.id, PrincipalId::User(1));
    assert_eq!(principal.api_key_id, Some(11));
    assert_eq!(principal.tier.name, "standard");
}

#[tokio::test]
async fn bad_api_key_fails_the_request() {
    for key in ["key-expired", "key-unknown"] {
        let err = resolver()
            .resolve(RequestCredentials {
                api_key: Some(key),
                bearer: Some("bearer-good"),
                client_addr: "198.51.100.4",
            })
            .await
            .expect_err("present-but-bad key must fail");
        assert!(matches!(err, CoreError::Unauthenticated(_)), "{key}: {err}");
    }
}

#[tokio::test]
async fn bearer_resolves_by_subject_email() {
    let principal = resolver()
        .resolve(RequestCredentials {
            api_key: None,
            bearer: Some("bearer-good"),
            client_addr: "198.51.100.4",
        })
        .await
        .expect("resolve");

    assert_eq!(principal.id, PrincipalId::User(1));
    assert_eq!(principal.api_key_id, None);
}

#[tokio::test]
async fn bad_bearer_degrades_to_anonymous() {
    for bearer in ["bearer-forged", "bearer-inactive-user"] {
        let principal = resolver()
            .resolve(RequestCredentials {
                api_key: None,
                bearer: Some(bearer),
                client_addr: "198.51.100.4",
            })
            .await
            .expect("invalid bearer must not fail");
        assert!(
            matches!(principal.id, PrincipalId::Anonymous(_)),
            "{bearer} should degrade to anonymous"
        );
        assert_eq!(principal.tier.name, "default");
    }
}

#[tokio::test]
async fn anonymous_bucket_is_stable_per_address() {
    let r = resolver();
    let a = r
        .resolve(RequestCredentials {
            api_key: None,
            bearer: None,
            client_addr: "203.0.113.50",
        })
        .await
        .unwrap();
    let b = r
        .resolve(RequestCredentials {
            api_key: None,
            bearer: None,
            client_addr: "203.0.113.50",
        })
        .await
        .unwrap();
    assert_eq!(a.id, b.id);
}
