//! Session issuance
//!
//! Resolves a validated identity to a local account (find-or-create) and
//! issues a signed session token. The token is self-verifying, but a session
//! row is always persisted too: server-side revocation on logout or timeout
//! needs it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use portal_common::{AuthError, AuthResult, IdentityRecord, ProviderKind, SessionCredential};

/// Local portal account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub department: String,
    pub role: String,
    /// Present only for accounts that may use the local-password fallback
    pub password_hash: Option<String>,
    /// SSO linkage: provider-scoped subject identifier
    pub external_id: Option<String>,
    /// SSO linkage: which provider vouched for this account
    pub provider: Option<ProviderKind>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Persisted session row backing a credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// User-account store collaborator.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> AuthResult<Option<LocalUser>>;
    async fn find_by_linkage(
        &self,
        external_id: &str,
        provider: ProviderKind,
    ) -> AuthResult<Option<LocalUser>>;
    async fn insert(&self, user: LocalUser) -> AuthResult<()>;
    async fn update(&self, user: LocalUser) -> AuthResult<()>;
}

/// Session store collaborator.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, row: SessionRow) -> AuthResult<()>;
    async fn delete_by_token(&self, token: &str) -> AuthResult<bool>;
    async fn touch(&self, token: &str, at: DateTime<Utc>) -> AuthResult<bool>;
    async fn find_by_token(&self, token: &str) -> AuthResult<Option<SessionRow>>;
}

/// Session issuance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// HS256 secret signing session tokens
    pub token_secret: String,
    /// Absolute session lifetime, hours
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    /// Role granted to accounts created on first SSO login
    #[serde(default = "default_role")]
    pub default_role: String,
}

fn default_session_ttl_hours() -> i64 {
    24
}

fn default_role() -> String {
    "requester".to_string()
}

/// Claims carried inside a session token
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub email: String,
    pub role: String,
    /// Session row id, for revocation lookups
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues signed sessions backed by persisted rows.
pub struct SessionIssuer {
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl SessionIssuer {
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            users,
            sessions,
            config,
        }
    }

    /// Resolve the canonical identity to a local account and issue a session.
    pub async fn issue_session(&self, record: &IdentityRecord) -> AuthResult<SessionCredential> {
        let user = self.resolve_local_user(record).await?;
        self.issue_for_user(&user).await
    }

    /// Sign a token for an already-resolved account and persist its row.
    pub async fn issue_for_user(&self, user: &LocalUser) -> AuthResult<SessionCredential> {
        let now = Utc::now();
        let expires_at = now + Duration::hours(self.config.session_ttl_hours);
        let session_id = Uuid::new_v4();

        let claims = SessionClaims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            role: user.role.clone(),
            sid: session_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.token_secret.as_bytes()),
        )
        .map_err(|e| AuthError::TokenSigning(e.to_string()))?;

        self.sessions
            .create(SessionRow {
                id: session_id,
                user_id: user.id,
                token: token.clone(),
                created_at: now,
                expires_at,
                last_activity_at: now,
            })
            .await?;

        tracing::info!(user = %user.id, session = %session_id, "session issued");
        Ok(SessionCredential {
            session_id,
            user_id: user.id,
            token,
            issued_at: now,
            expires_at,
        })
    }

    /// Decode and verify a session token's signature and expiry.
    pub fn decode_credential(&self, token: &str) -> AuthResult<SessionClaims> {
        decode::<SessionClaims>(
            token,
            &DecodingKey::from_secret(self.config.token_secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| AuthError::SessionStore(format!("token rejected: {e}")))
    }

    /// Server-side revocation (logout). Returns whether a row was removed.
    pub async fn revoke_session(&self, token: &str) -> AuthResult<bool> {
        self.sessions.delete_by_token(token).await
    }

    /// Update the session row's last-activity timestamp.
    pub async fn touch_session(&self, token: &str) -> AuthResult<bool> {
        self.sessions.touch(token, Utc::now()).await
    }

    async fn resolve_local_user(&self, record: &IdentityRecord) -> AuthResult<LocalUser> {
        let existing = match self.users.find_by_email(&record.email).await? {
            Some(user) => Some(user),
            None => {
                self.users
                    .find_by_linkage(&record.external_id, record.provider)
                    .await?
            }
        };

        match existing {
            Some(mut user) => {
                user.last_login_at = Some(Utc::now());
                user.external_id = Some(record.external_id.clone());
                user.provider = Some(record.provider);
                self.users.update(user.clone()).await?;
                Ok(user)
            }
            None => {
                let user = LocalUser {
                    id: Uuid::new_v4(),
                    email: record.email.clone(),
                    display_name: record.display_name.clone(),
                    department: record.department.clone(),
                    role: self.config.default_role.clone(),
                    password_hash: None,
                    external_id: Some(record.external_id.clone()),
                    provider: Some(record.provider),
                    created_at: Utc::now(),
                    last_login_at: Some(Utc::now()),
                };
                self.users.insert(user.clone()).await?;
                tracing::info!(user = %user.id, provider = %record.provider, "local account created on first SSO login");
                Ok(user)
            }
        }
    }
}

/// In-memory user store, the reference implementation used by tests and
/// single-node deployments.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: DashMap<Uuid, LocalUser>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account, for tests and bootstrap.
    pub fn add(&self, user: LocalUser) {
        self.users.insert(user.id, user);
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_email(&self, email: &str) -> AuthResult<Option<LocalUser>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .map(|u| u.clone()))
    }

    async fn find_by_linkage(
        &self,
        external_id: &str,
        provider: ProviderKind,
    ) -> AuthResult<Option<LocalUser>> {
        Ok(self
            .users
            .iter()
            .find(|u| {
                u.external_id.as_deref() == Some(external_id) && u.provider == Some(provider)
            })
            .map(|u| u.clone()))
    }

    async fn insert(&self, user: LocalUser) -> AuthResult<()> {
        self.users.insert(user.id, user);
        Ok(())
    }

    async fn update(&self, user: LocalUser) -> AuthResult<()> {
        if !self.users.contains_key(&user.id) {
            return Err(AuthError::UserStore(format!("unknown user {}", user.id)));
        }
        self.users.insert(user.id, user);
        Ok(())
    }
}

/// In-memory session store keyed by token.
#[derive(Default)]
pub struct InMemorySessionStore {
    rows: DashMap<String, SessionRow>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, row: SessionRow) -> AuthResult<()> {
        self.rows.insert(row.token.clone(), row);
        Ok(())
    }

    async fn delete_by_token(&self, token: &str) -> AuthResult<bool> {
        Ok(self.rows.remove(token).is_some())
    }

    async fn touch(&self, token: &str, at: DateTime<Utc>) -> AuthResult<bool> {
        match self.rows.get_mut(token) {
            Some(mut row) => {
                row.last_activity_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_by_token(&self, token: &str) -> AuthResult<Option<SessionRow>> {
        Ok(self.rows.get(token).map(|r| r.clone()))
    }
}
