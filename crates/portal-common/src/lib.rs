//! Portal Common - Shared types for the SSO authentication gateway
//!
//! This crate provides the types shared by the gateway crates:
//! - Provider configuration (SAML / OAuth)
//! - Canonical identity record
//! - Error taxonomy
//!
//! Everything here is short-lived request data or immutable configuration;
//! the only long-lived mutable state in the subsystem (provider health)
//! lives in `portal-resilience`.

#![warn(missing_docs)]

pub mod config;
pub mod error;

pub use config::*;
pub use error::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which authority vouched for an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// SAML 2.0 assertion
    Saml,
    /// OAuth 2.0 authorization-code flow
    Oauth,
    /// Local-password fallback
    Local,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Saml => write!(f, "saml"),
            Self::Oauth => write!(f, "oauth"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Canonical output of a successful validation.
///
/// Invariant: `external_id` and `email` are non-empty and `email` has passed
/// RFC-shape validation (lower-cased) before a record leaves the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Provider-scoped subject identifier
    pub external_id: String,
    /// Sanitized, lower-cased email
    pub email: String,
    /// Display name, empty when the provider sent none
    pub display_name: String,
    /// Department, empty when the provider sent none
    pub department: String,
    /// Which protocol produced this record
    pub provider: ProviderKind,
}

/// Signed session credential bound to a local user.
///
/// The token is self-verifying, but a session row is always persisted
/// alongside it so the server can revoke on logout or timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredential {
    /// Persisted session row identifier
    pub session_id: Uuid,
    /// Local user the session is bound to
    pub user_id: Uuid,
    /// Signed bearer token
    pub token: String,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
}
