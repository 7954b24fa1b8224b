//! Local-password fallback
//!
//! When an IdP is degraded, SSO-linked accounts that also hold a local
//! credential can sign in with it. Sessions come out identical to the SSO
//! path. Failure messages never distinguish "no such user" from "SSO-only
//! account".

use std::sync::Arc;

use sha2::{Digest, Sha256};

use portal_common::{AuthError, AuthResult, SessionCredential};

use crate::session::{SessionIssuer, UserStore};

/// Password-hash verification collaborator.
pub trait PasswordVerifier: Send + Sync {
    fn verify(&self, secret: &str, stored_hash: &str) -> bool;
}

/// SHA-256 hex verifier matching the portal's stored credential format.
pub struct Sha256PasswordVerifier;

impl Sha256PasswordVerifier {
    /// Hash a secret into the stored format.
    pub fn hash(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl PasswordVerifier for Sha256PasswordVerifier {
    fn verify(&self, secret: &str, stored_hash: &str) -> bool {
        Self::hash(secret) == stored_hash
    }
}

/// Local-password authenticator used while SSO is degraded.
pub struct LocalAuthenticator {
    users: Arc<dyn UserStore>,
    verifier: Arc<dyn PasswordVerifier>,
    issuer: Arc<SessionIssuer>,
    enabled: bool,
}

impl LocalAuthenticator {
    pub fn new(
        users: Arc<dyn UserStore>,
        verifier: Arc<dyn PasswordVerifier>,
        issuer: Arc<SessionIssuer>,
        enabled: bool,
    ) -> Self {
        Self {
            users,
            verifier,
            issuer,
            enabled,
        }
    }

    /// Verify a local credential and issue a session exactly as a
    /// successful SSO resolution would.
    pub async fn authenticate(
        &self,
        identifier: &str,
        secret: &str,
    ) -> AuthResult<SessionCredential> {
        if !self.enabled {
            return Err(AuthError::LocalAuthDisabled);
        }

        let Some(user) = self.users.find_by_email(identifier).await? else {
            tracing::warn!("local auth attempt for unknown identifier");
            return Err(AuthError::UserNotFoundOrSsoOnly);
        };

        // Fallback serves SSO accounts that also carry a local credential.
        if user.external_id.is_none() || user.provider.is_none() {
            return Err(AuthError::UserNotFoundOrSsoOnly);
        }
        let Some(stored_hash) = user.password_hash.as_deref() else {
            return Err(AuthError::UserNotFoundOrSsoOnly);
        };

        if !self.verifier.verify(secret, stored_hash) {
            tracing::warn!(user = %user.id, "local auth rejected: bad credential");
            return Err(AuthError::InvalidCredentials);
        }

        self.issuer.issue_for_user(&user).await
    }
}
