//! OAuth 2.0 authorization-code flow
//!
//! Code exchange and userinfo fetch against one configured provider, plus
//! the signed anti-CSRF state parameter carried through the redirect.
//! Transport failures are reported to the availability monitor so provider
//! health degrades on real traffic, not just on scheduled probes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use sha2::Sha256;

use portal_common::{AuthError, AuthResult, IdentityRecord, OauthProviderConfig};
use portal_resilience::AvailabilityMonitor;

use crate::identity::IdentityNormalizer;

type HmacSha256 = Hmac<Sha256>;

/// OAuth flow client for one configured provider.
pub struct OauthFlowClient {
    config: OauthProviderConfig,
    http: reqwest::Client,
    monitor: Arc<AvailabilityMonitor>,
    normalizer: IdentityNormalizer,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

impl OauthFlowClient {
    pub fn new(config: OauthProviderConfig, monitor: Arc<AvailabilityMonitor>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            monitor,
            normalizer: IdentityNormalizer::new(),
        }
    }

    /// Front-channel authorization URL for the configured provider.
    pub fn authorize_url(&self, state: &str) -> AuthResult<String> {
        let mut url = reqwest::Url::parse(&self.config.authorize_url).map_err(|e| {
            AuthError::ConfigurationMissing(format!(
                "bad authorize_url for {}: {e}",
                self.config.provider_id
            ))
        })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.callback_url)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state);
        Ok(url.to_string())
    }

    /// Mint a fresh `timestamp_nonce_signature` state token.
    ///
    /// The signature is HMAC-SHA256 over `timestamp_nonce` with the server
    /// secret; the token is unguessable and tamper-evident.
    pub fn generate_state(&self) -> String {
        let timestamp = Utc::now().timestamp();
        let mut nonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);
        let signature = self.state_signature(&format!("{timestamp}_{nonce}"));
        format!("{timestamp}_{nonce}_{signature}")
    }

    /// Whether a state token is authentic and inside its 10-minute window.
    pub fn validate_state(&self, token: &str) -> bool {
        self.check_state(token).is_ok()
    }

    /// Full back-channel flow: state check, code exchange, profile fetch,
    /// normalization.
    pub async fn exchange_and_fetch_profile(
        &self,
        code: &str,
        state: &str,
    ) -> AuthResult<IdentityRecord> {
        self.check_state(state).map_err(|e| {
            tracing::warn!(
                provider = %self.config.provider_id,
                error = %e,
                "state parameter rejected, possible CSRF"
            );
            e
        })?;
        let access_token = self.exchange_code_for_token(code).await?;
        let profile = self.fetch_user_profile(&access_token).await?;
        self.normalizer
            .from_oauth_profile(&profile, &self.config.attribute_mapping)
    }

    /// POST the authorization code to the token endpoint.
    pub async fn exchange_code_for_token(&self, code: &str) -> AuthResult<String> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.callback_url.as_str()),
        ];
        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&params)
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(|e| {
                self.transport_failure(AuthError::TokenExchangeFailed(format!(
                    "request failed: {e}"
                )))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport_failure(AuthError::TokenExchangeFailed(format!(
                "token endpoint returned {status}"
            ))));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            self.transport_failure(AuthError::TokenExchangeFailed(format!(
                "unreadable token response: {e}"
            )))
        })?;
        match body.access_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(self.transport_failure(AuthError::TokenExchangeFailed(
                "no access_token in response".to_string(),
            ))),
        }
    }

    /// GET the userinfo endpoint with the bearer token.
    pub async fn fetch_user_profile(&self, access_token: &str) -> AuthResult<serde_json::Value> {
        let response = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token)
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(|e| {
                self.transport_failure(AuthError::ProfileFetchFailed(format!(
                    "request failed: {e}"
                )))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport_failure(AuthError::ProfileFetchFailed(format!(
                "userinfo endpoint returned {status}"
            ))));
        }

        let profile: serde_json::Value = response.json().await.map_err(|e| {
            self.transport_failure(AuthError::ProfileFetchFailed(format!(
                "unreadable profile body: {e}"
            )))
        })?;
        if !profile.is_object() {
            return Err(self.transport_failure(AuthError::ProfileFetchFailed(
                "profile is not an object".to_string(),
            )));
        }
        Ok(profile)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    fn state_signature(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.state_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn check_state(&self, token: &str) -> AuthResult<()> {
        let mut parts = token.splitn(3, '_');
        let (Some(ts), Some(nonce), Some(signature)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::StateParamInvalid);
        };
        if nonce.is_empty() || signature.is_empty() {
            return Err(AuthError::StateParamInvalid);
        }
        let timestamp: i64 = ts.parse().map_err(|_| AuthError::StateParamInvalid)?;

        let mut mac = HmacSha256::new_from_slice(self.config.state_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{timestamp}_{nonce}").as_bytes());
        let expected = hex::decode(signature).map_err(|_| AuthError::StateParamInvalid)?;
        mac.verify_slice(&expected)
            .map_err(|_| AuthError::StateParamInvalid)?;

        if Utc::now().timestamp() - timestamp > self.config.state_max_age_secs {
            return Err(AuthError::StateParamExpired);
        }
        Ok(())
    }

    /// Surface a transport error to the caller and feed the circuit breaker.
    fn transport_failure(&self, err: AuthError) -> AuthError {
        tracing::warn!(
            provider = %self.config.provider_id,
            error = %err,
            "oauth transport failure"
        );
        self.monitor
            .handle_failure(&self.config.provider_id, &err.to_string());
        err
    }
}
