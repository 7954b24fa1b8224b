//! Provider configuration
//!
//! One immutable config object per identity provider, loaded at startup.
//! Reload means replacing the whole object; nothing mutates mid-request.

use serde::{Deserialize, Serialize};

/// Configuration for one SAML 2.0 identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamlProviderConfig {
    /// Provider identifier used for health tracking and routing
    pub provider_id: String,
    /// IdP entity identifier expected in `Issuer`
    pub idp_entity_id: String,
    /// IdP single sign-on entry URL (also the reachability-probe target)
    pub idp_sso_url: String,
    /// IdP signing certificate (PEM) handed to the signature verifier
    pub idp_certificate: String,
    /// Our service-provider entity id, checked against audience restrictions
    pub sp_entity_id: String,
    /// Assertion Consumer Service URL, checked against recipient fields
    pub sp_acs_url: String,
    /// Tolerated clock skew for time conditions, seconds
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: i64,
    /// Reject responses that carry no signature element
    #[serde(default = "default_true")]
    pub require_signature: bool,
    /// How to treat a repeated assertion identifier
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    /// Attribute dialect accepted from this IdP
    #[serde(default)]
    pub attribute_mapping: AttributeMapping,
}

/// Configuration for one OAuth 2.0 authorization-code provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthProviderConfig {
    /// Provider identifier used for health tracking and routing
    pub provider_id: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret, sent in the token-request Authorization header
    pub client_secret: String,
    /// Authorization endpoint (also the reachability-probe target)
    pub authorize_url: String,
    /// Token endpoint
    pub token_url: String,
    /// Userinfo endpoint
    pub userinfo_url: String,
    /// Our registered redirect URI
    pub callback_url: String,
    /// Scopes requested on the front channel
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Server-side secret signing anti-CSRF state tokens
    pub state_secret: String,
    /// Maximum accepted state-token age, seconds
    #[serde(default = "default_state_max_age_secs")]
    pub state_max_age_secs: i64,
    /// Timeout applied to token-exchange and userinfo calls, seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Claim dialect accepted from the userinfo endpoint
    #[serde(default)]
    pub attribute_mapping: AttributeMapping,
}

/// A configured identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// SAML 2.0 POST binding
    Saml(SamlProviderConfig),
    /// OAuth 2.0 authorization-code grant
    Oauth(OauthProviderConfig),
}

impl ProviderConfig {
    /// Provider identifier
    pub fn provider_id(&self) -> &str {
        match self {
            ProviderConfig::Saml(c) => &c.provider_id,
            ProviderConfig::Oauth(c) => &c.provider_id,
        }
    }

    /// URL probed by the availability monitor
    pub fn probe_url(&self) -> &str {
        match self {
            ProviderConfig::Saml(c) => &c.idp_sso_url,
            ProviderConfig::Oauth(c) => &c.authorize_url,
        }
    }
}

/// Replay handling for repeated assertion identifiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// Repeat within the validity window is a hard reject
    #[default]
    Reject,
    /// Repeat is logged as a security warning and allowed through
    Warn,
}

/// Canonical identity field -> accepted source attribute names.
///
/// Lookups are case-insensitive; long-form URN claim names and short
/// dialects live in the same list so new IdP dialects are additive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeMapping {
    /// Accepted names for the email attribute
    pub email: Vec<String>,
    /// Accepted names for the display-name attribute
    pub display_name: Vec<String>,
    /// Accepted names for the department attribute
    pub department: Vec<String>,
    /// Accepted names for the provider-scoped subject identifier
    pub external_id: Vec<String>,
}

impl Default for AttributeMapping {
    fn default() -> Self {
        Self {
            email: vec![
                "email".into(),
                "mail".into(),
                "emailaddress".into(),
                "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress".into(),
                "urn:oid:0.9.2342.19200300.100.1.3".into(),
            ],
            display_name: vec![
                "name".into(),
                "displayname".into(),
                "cn".into(),
                "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/name".into(),
                "urn:oid:2.5.4.3".into(),
            ],
            department: vec![
                "department".into(),
                "ou".into(),
                "division".into(),
                "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/department".into(),
            ],
            external_id: vec!["sub".into(), "id".into(), "user_id".into(), "uid".into()],
        }
    }
}

impl AttributeMapping {
    /// Case-insensitive membership test against one canonical field's list.
    pub fn matches(accepted: &[String], candidate: &str) -> bool {
        accepted.iter().any(|a| a.eq_ignore_ascii_case(candidate))
    }
}

fn default_clock_skew_secs() -> i64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_scopes() -> Vec<String> {
    vec!["openid".into(), "profile".into(), "email".into()]
}

fn default_state_max_age_secs() -> i64 {
    600
}

fn default_request_timeout_secs() -> u64 {
    10
}
