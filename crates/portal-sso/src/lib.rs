//! Portal SSO - federated authentication gateway
//!
//! Terminates SAML 2.0 POST-binding responses and the OAuth 2.0
//! authorization-code flow for the data-asset portal, normalizes provider
//! claims into one canonical record, and issues signed sessions.
//!
//! # Architecture
//! ```text
//! callback ──► {SAML validator | OAuth flow client} ──► normalizer ──► session issuer
//!                        │                                                  │
//!                 transport failures                                 signed credential
//!                        ▼                                            + persisted row
//!               availability monitor ◄─── per-provider probe timers
//!                        │
//!          strategy consulted before every live SSO attempt
//! ```
//!
//! The availability monitor runs independently; when an IdP crosses the
//! failure threshold, the gateway stops attempting live SSO for it and
//! steers callers to the local-password fallback until recovery.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod identity;
pub mod local;
pub mod oauth;
pub mod saml;
pub mod sanitize;
pub mod session;

pub use identity::{IdentityNormalizer, RawProfile};
pub use local::{LocalAuthenticator, PasswordVerifier, Sha256PasswordVerifier};
pub use oauth::OauthFlowClient;
pub use saml::{SamlValidator, SignatureVerifier};
pub use session::{
    InMemorySessionStore, InMemoryUserStore, LocalUser, SessionConfig, SessionIssuer, SessionRow,
    SessionStore, UserStore,
};

use portal_common::{
    AuthError, AuthResult, ProviderConfig, SessionCredential,
};
use portal_resilience::{
    AvailabilityMonitor, FallbackStrategy, MonitorConfig, ProbeTarget, ProviderHealth,
};

/// Top-level gateway configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Configured identity providers
    pub providers: Vec<ProviderConfig>,
    /// Session signing and lifetime
    pub session: SessionConfig,
    /// Availability monitor tuning
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl GatewayConfig {
    /// Parse a configuration document.
    pub fn from_json(raw: &str) -> AuthResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| AuthError::ConfigurationMissing(format!("bad gateway config: {e}")))
    }
}

/// The SSO authentication gateway.
///
/// Stateless per authentication attempt; the only shared mutable state is
/// the provider health owned by the availability monitor.
pub struct SsoGateway {
    config: GatewayConfig,
    monitor: Arc<AvailabilityMonitor>,
    saml: HashMap<String, SamlValidator>,
    oauth: HashMap<String, OauthFlowClient>,
    issuer: Arc<SessionIssuer>,
    local: LocalAuthenticator,
}

impl SsoGateway {
    /// Build a gateway with the default HTTP probe and SHA-256 password
    /// verifier.
    pub fn new(
        config: GatewayConfig,
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let monitor = AvailabilityMonitor::new(config.monitor.clone());
        Self::with_parts(config, users, sessions, Arc::new(Sha256PasswordVerifier), monitor)
    }

    /// Build a gateway around an existing monitor and password verifier.
    pub fn with_parts(
        config: GatewayConfig,
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        password_verifier: Arc<dyn PasswordVerifier>,
        monitor: Arc<AvailabilityMonitor>,
    ) -> Self {
        let issuer = Arc::new(SessionIssuer::new(
            users.clone(),
            sessions,
            config.session.clone(),
        ));

        let mut saml = HashMap::new();
        let mut oauth = HashMap::new();
        for provider in &config.providers {
            match provider {
                ProviderConfig::Saml(c) => {
                    saml.insert(c.provider_id.clone(), SamlValidator::new(c.clone()));
                }
                ProviderConfig::Oauth(c) => {
                    oauth.insert(
                        c.provider_id.clone(),
                        OauthFlowClient::new(c.clone(), Arc::clone(&monitor)),
                    );
                }
            }
        }

        let local = LocalAuthenticator::new(
            users,
            password_verifier,
            Arc::clone(&issuer),
            monitor.local_auth_enabled(),
        );

        Self {
            config,
            monitor,
            saml,
            oauth,
            issuer,
            local,
        }
    }

    /// Start per-provider availability probing.
    pub fn start(&self) {
        let targets = self
            .config
            .providers
            .iter()
            .map(|p| ProbeTarget {
                provider_id: p.provider_id().to_string(),
                url: p.probe_url().to_string(),
            })
            .collect();
        self.monitor.start_health_checks(targets);
    }

    /// Stop all availability probing.
    pub fn stop(&self) {
        self.monitor.stop();
    }

    /// Validate a SAML response and issue a session.
    pub async fn authenticate_saml(
        &self,
        provider_id: &str,
        base64_response: &str,
    ) -> AuthResult<SessionCredential> {
        self.gate(provider_id)?;
        let validator = self
            .saml
            .get(provider_id)
            .ok_or_else(|| AuthError::ConfigurationMissing(provider_id.to_string()))?;
        let record = validator.validate(base64_response)?;
        self.issuer.issue_session(&record).await
    }

    /// Run the OAuth code exchange and issue a session.
    pub async fn authenticate_oauth(
        &self,
        provider_id: &str,
        code: &str,
        state: &str,
    ) -> AuthResult<SessionCredential> {
        self.gate(provider_id)?;
        let client = self
            .oauth
            .get(provider_id)
            .ok_or_else(|| AuthError::ConfigurationMissing(provider_id.to_string()))?;
        let record = client.exchange_and_fetch_profile(code, state).await?;
        self.issuer.issue_session(&record).await
    }

    /// Mint an anti-CSRF state token for a configured OAuth provider.
    pub fn generate_state(&self, provider_id: &str) -> AuthResult<String> {
        self.oauth
            .get(provider_id)
            .map(|c| c.generate_state())
            .ok_or_else(|| AuthError::ConfigurationMissing(provider_id.to_string()))
    }

    /// Check an anti-CSRF state token.
    pub fn validate_state(&self, provider_id: &str, token: &str) -> bool {
        self.oauth
            .get(provider_id)
            .map(|c| c.validate_state(token))
            .unwrap_or(false)
    }

    /// Front-channel login URL for a provider.
    pub fn login_url(&self, provider_id: &str, state: &str) -> AuthResult<String> {
        if let Some(validator) = self.saml.get(provider_id) {
            return Ok(validator.login_url(state));
        }
        if let Some(client) = self.oauth.get(provider_id) {
            return client.authorize_url(state);
        }
        Err(AuthError::ConfigurationMissing(provider_id.to_string()))
    }

    /// Local-password fallback, gated by maintenance mode only.
    pub async fn fallback_to_local_auth(
        &self,
        identifier: &str,
        secret: &str,
    ) -> AuthResult<SessionCredential> {
        if self.monitor.maintenance_active() {
            return Err(AuthError::MaintenanceMode);
        }
        self.local.authenticate(identifier, secret).await
    }

    /// Revoke a session (logout). Returns whether a row was removed.
    pub async fn logout(&self, token: &str) -> AuthResult<bool> {
        self.issuer.revoke_session(token).await
    }

    /// Current fallback strategy for a provider.
    pub fn get_fallback_strategy(&self, provider_id: &str) -> FallbackStrategy {
        self.monitor.get_fallback_strategy(provider_id)
    }

    /// Health snapshot for a provider, `None` if untracked.
    pub fn get_provider_health(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.monitor.get_provider_health(provider_id)
    }

    /// Operator maintenance override.
    pub fn set_maintenance(&self, active: bool) {
        self.monitor.set_maintenance(active);
    }

    /// The availability monitor, for probe wiring and introspection.
    pub fn monitor(&self) -> &Arc<AvailabilityMonitor> {
        &self.monitor
    }

    /// Session issuer, for token decoding and activity updates.
    pub fn issuer(&self) -> &Arc<SessionIssuer> {
        &self.issuer
    }

    /// Shared-state check before any live SSO attempt.
    fn gate(&self, provider_id: &str) -> AuthResult<()> {
        match self.monitor.get_fallback_strategy(provider_id) {
            FallbackStrategy::MaintenanceMode => Err(AuthError::MaintenanceMode),
            FallbackStrategy::LocalAuth => Err(AuthError::ProviderDegraded),
            FallbackStrategy::QueueRequests => {
                if self.monitor.is_degraded(provider_id) {
                    // Degraded with no local fallback available: short retry.
                    Err(AuthError::ProviderUnavailable)
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::test_support;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use portal_common::ProviderKind;
    use portal_resilience::ReachabilityProbe;
    use std::collections::VecDeque;
    use uuid::Uuid;

    struct ScriptedProbe {
        script: Mutex<VecDeque<Result<(), String>>>,
    }

    impl ScriptedProbe {
        fn new(script: Vec<Result<(), String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn check(&self, _target: &ProbeTarget) -> Result<(), String> {
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn gateway_config() -> GatewayConfig {
        GatewayConfig {
            providers: vec![
                ProviderConfig::Saml(test_support::config()),
                ProviderConfig::Oauth(crate::oauth::test_support::config()),
            ],
            session: SessionConfig {
                token_secret: "gateway-test-secret".to_string(),
                session_ttl_hours: 24,
                default_role: "requester".to_string(),
            },
            monitor: MonitorConfig::default(),
        }
    }

    fn gateway_with_script(script: Vec<Result<(), String>>) -> SsoGateway {
        let users = Arc::new(InMemoryUserStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let monitor = AvailabilityMonitor::with_probe(
            MonitorConfig::default(),
            ScriptedProbe::new(script),
        );
        monitor.track(ProbeTarget {
            provider_id: "saml".to_string(),
            url: "https://idp.example.com/sso".to_string(),
        });
        SsoGateway::with_parts(
            gateway_config(),
            users,
            sessions,
            Arc::new(Sha256PasswordVerifier),
            monitor,
        )
    }

    fn fail() -> Result<(), String> {
        Err("connect timed out".to_string())
    }

    #[tokio::test]
    async fn test_saml_login_end_to_end() {
        let gateway = gateway_with_script(vec![]);
        let fixture = test_support::ResponseFixture::default();

        let credential = gateway
            .authenticate_saml("saml", &test_support::encode(&fixture))
            .await
            .unwrap();
        assert!(!credential.token.is_empty());

        let claims = gateway.issuer().decode_credential(&credential.token).unwrap();
        assert_eq!(claims.email, "user-1@corp.example.com");
        assert_eq!(claims.role, "requester");

        // Logout revokes the persisted row; a second logout finds nothing.
        assert!(gateway.logout(&credential.token).await.unwrap());
        assert!(!gateway.logout(&credential.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_fast() {
        let gateway = gateway_with_script(vec![]);
        let fixture = test_support::ResponseFixture::default();
        assert!(matches!(
            gateway
                .authenticate_saml("not-configured", &test_support::encode(&fixture))
                .await,
            Err(AuthError::ConfigurationMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_maintenance_blocks_all_authentication() {
        let gateway = gateway_with_script(vec![]);
        gateway.set_maintenance(true);

        let fixture = test_support::ResponseFixture::default();
        assert!(matches!(
            gateway
                .authenticate_saml("saml", &test_support::encode(&fixture))
                .await,
            Err(AuthError::MaintenanceMode)
        ));
        assert!(matches!(
            gateway.fallback_to_local_auth("pat@corp.example.com", "pw").await,
            Err(AuthError::MaintenanceMode)
        ));
        assert_eq!(
            gateway.get_fallback_strategy("saml"),
            FallbackStrategy::MaintenanceMode
        );
    }

    #[tokio::test]
    async fn test_degradation_and_recovery_scenario() {
        // spec'd walkthrough: three failed probes degrade the provider, the
        // gateway steers to local auth, one good probe restores the default.
        let users = Arc::new(InMemoryUserStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let monitor = AvailabilityMonitor::with_probe(
            MonitorConfig::default(),
            ScriptedProbe::new(vec![fail(), fail(), fail(), Ok(())]),
        );
        monitor.track(ProbeTarget {
            provider_id: "saml".to_string(),
            url: "https://idp.example.com/sso".to_string(),
        });
        let gateway = SsoGateway::with_parts(
            gateway_config(),
            users.clone(),
            sessions,
            Arc::new(Sha256PasswordVerifier),
            Arc::clone(&monitor),
        );

        users.add(LocalUser {
            id: Uuid::new_v4(),
            email: "pat@corp.example.com".to_string(),
            display_name: "Pat".to_string(),
            department: String::new(),
            role: "requester".to_string(),
            password_hash: Some(Sha256PasswordVerifier::hash("correct-horse")),
            external_id: Some("ext-1".to_string()),
            provider: Some(ProviderKind::Saml),
            created_at: Utc::now(),
            last_login_at: None,
        });

        for _ in 0..3 {
            monitor.check_availability("saml").await;
        }
        let health = gateway.get_provider_health("saml").unwrap();
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(
            gateway.get_fallback_strategy("saml"),
            FallbackStrategy::LocalAuth
        );

        // Live SSO is refused while degraded; local fallback works.
        let fixture = test_support::ResponseFixture::default();
        assert!(matches!(
            gateway
                .authenticate_saml("saml", &test_support::encode(&fixture))
                .await,
            Err(AuthError::ProviderDegraded)
        ));
        let credential = gateway
            .fallback_to_local_auth("pat@corp.example.com", "correct-horse")
            .await
            .unwrap();
        assert!(!credential.token.is_empty());

        // One successful probe resets the counter and the strategy.
        monitor.check_availability("saml").await;
        let health = gateway.get_provider_health("saml").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(
            gateway.get_fallback_strategy("saml"),
            FallbackStrategy::QueueRequests
        );

        // Live SSO flows again.
        let fixture = test_support::ResponseFixture::default();
        assert!(gateway
            .authenticate_saml("saml", &test_support::encode(&fixture))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_oauth_state_round_trip_through_gateway() {
        let gateway = gateway_with_script(vec![]);
        let state = gateway.generate_state("oauth").unwrap();
        assert!(gateway.validate_state("oauth", &state));
        assert!(!gateway.validate_state("oauth", "forged"));
        assert!(!gateway.validate_state("unknown-provider", &state));
    }

    #[tokio::test]
    async fn test_login_urls_for_both_protocols() {
        let gateway = gateway_with_script(vec![]);
        let saml_url = gateway.login_url("saml", "rs").unwrap();
        assert!(saml_url.contains("SAMLRequest="));
        let oauth_url = gateway.login_url("oauth", "st").unwrap();
        assert!(oauth_url.contains("response_type=code"));
        assert!(gateway.login_url("unknown", "x").is_err());
    }

    #[test]
    fn test_gateway_config_from_json() {
        let raw = r#"{
            "providers": [
                {
                    "kind": "saml",
                    "provider_id": "corp-idp",
                    "idp_entity_id": "https://idp.example.com",
                    "idp_sso_url": "https://idp.example.com/sso",
                    "idp_certificate": "-----BEGIN CERTIFICATE-----",
                    "sp_entity_id": "https://portal.example.com",
                    "sp_acs_url": "https://portal.example.com/auth/saml/callback"
                },
                {
                    "kind": "oauth",
                    "provider_id": "corp-oauth",
                    "client_id": "portal",
                    "client_secret": "secret",
                    "authorize_url": "https://idp.example.com/oauth/authorize",
                    "token_url": "https://idp.example.com/oauth/token",
                    "userinfo_url": "https://idp.example.com/oauth/userinfo",
                    "callback_url": "https://portal.example.com/auth/oauth/callback",
                    "state_secret": "state-secret"
                }
            ],
            "session": { "token_secret": "signing-secret" },
            "monitor": { "probe_interval_secs": 15 }
        }"#;

        let config = GatewayConfig::from_json(raw).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.session.session_ttl_hours, 24);
        assert_eq!(config.monitor.probe_interval_secs, 15);
        assert_eq!(config.monitor.fallback_after_failures, 3);

        assert!(GatewayConfig::from_json("{}").is_err());
    }
}
