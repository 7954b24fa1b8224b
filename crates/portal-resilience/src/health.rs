//! Provider Health Probing

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the monitor probes for one provider
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    /// Provider identifier the result is accounted against
    pub provider_id: String,
    /// Lightweight reachability endpoint (the provider's entry URL)
    pub url: String,
}

/// Per-provider health record.
///
/// Created when the monitor starts tracking a provider, updated only by that
/// provider's own probe task or by the live-traffic failure hook serialized
/// behind the same per-key lock. Never deleted, only reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    /// Provider identifier
    pub provider_id: String,
    /// Result of the most recent probe
    pub healthy: bool,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// When the provider was last probed or reported against
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Most recent failure message
    pub last_error: Option<String>,
    /// Most recent probe round-trip
    pub last_response_time_ms: Option<u64>,
    /// Whether the debounced fallback state machine is engaged
    pub fallback_active: bool,
    /// Whether a dedicated recovery loop is currently scheduled
    pub recovery_running: bool,
}

impl ProviderHealth {
    /// Fresh record for a provider the monitor just started tracking.
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            healthy: true,
            consecutive_failures: 0,
            last_checked_at: None,
            last_error: None,
            last_response_time_ms: None,
            fallback_active: false,
            recovery_running: false,
        }
    }
}

/// Reachability check seam.
///
/// A probe answers one question: did the provider respond at all within the
/// timeout. A timeout is reported as a plain failure; health accounting does
/// not distinguish the two.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Probe one target, returning a failure description on any error.
    async fn check(&self, target: &ProbeTarget) -> Result<(), String>;
}

/// HTTP `HEAD` probe against the provider's entry endpoint.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    /// Build a probe enforcing the given per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn check(&self, target: &ProbeTarget) -> Result<(), String> {
        let response = self
            .client
            .head(&target.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| format!("probe request failed: {e}"))?;

        // Any answer short of a server error counts as reachable; 4xx on a
        // HEAD of an SSO entry endpoint is normal.
        let status = response.status();
        if status.is_server_error() {
            return Err(format!("probe returned {status}"));
        }
        Ok(())
    }
}
