//! Portal Resilience - Provider availability monitoring
//!
//! Continuous per-provider health probing with autonomous degradation to a
//! local-password fallback and debounced recovery.
//!
//! Per provider the monitor runs one independent timer task, so a slow probe
//! against one IdP cannot delay another's schedule. Live authentication
//! failures are reported into the same per-provider record through
//! [`AvailabilityMonitor::handle_failure`], so an IdP that fails on real
//! traffic degrades between scheduled probes too.
//!
//! State machine per provider:
//!
//! ```text
//!            failures >= threshold                probe ok, counter == 0
//!  Healthy ──────────────────────► Degraded ───────────────────────► Healthy
//!                                      │
//!            operator flag, checked first, overrides both
//!  * ─────────────────────────────► Maintenance
//! ```
//!
//! A single probe success while failures are still accruing resets the
//! counter but does not leave Degraded; only the next success, arriving with
//! the counter already at zero, completes recovery. This debounce keeps a
//! flapping IdP from oscillating in and out of fallback.

#![warn(missing_docs)]

pub mod health;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

pub use health::{HttpProbe, ProbeTarget, ProviderHealth, ReachabilityProbe};

/// What the gateway should do for a provider right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Provider degraded and local passwords are enabled; authenticate locally
    LocalAuth,
    /// Operator override; answer "try again later" for every provider
    MaintenanceMode,
    /// Default: attempt live SSO, or retry shortly if it just failed
    QueueRequests,
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between scheduled probes per provider
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Seconds between recovery probes while a provider is in fallback
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
    /// Per-probe timeout, seconds; a timeout counts as a failure
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Consecutive failures before fallback engages
    #[serde(default = "default_fallback_after_failures")]
    pub fallback_after_failures: u32,
    /// Whether local-password fallback may be offered at all
    #[serde(default = "default_true")]
    pub local_auth_enabled: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            recovery_interval_secs: default_recovery_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            fallback_after_failures: default_fallback_after_failures(),
            local_auth_enabled: true,
        }
    }
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_recovery_interval_secs() -> u64 {
    60
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_fallback_after_failures() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Availability monitor and circuit breaker.
///
/// Owns all `ProviderHealth` records. Each record has a single writer: the
/// provider's own probe task, or a live-traffic failure report serialized
/// behind the same per-key lock.
pub struct AvailabilityMonitor {
    config: MonitorConfig,
    probe: Arc<dyn ReachabilityProbe>,
    health: DashMap<String, ProviderHealth>,
    targets: DashMap<String, ProbeTarget>,
    maintenance: AtomicBool,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // Handle back to the owning Arc so probe/recovery tasks can be spawned
    // from &self call sites.
    weak: Weak<AvailabilityMonitor>,
}

impl AvailabilityMonitor {
    /// Create a monitor with the default HTTP probe.
    pub fn new(config: MonitorConfig) -> Arc<Self> {
        let timeout = Duration::from_secs(config.probe_timeout_secs);
        Self::with_probe(config, Arc::new(HttpProbe::new(timeout)))
    }

    /// Create a monitor with a custom probe implementation.
    pub fn with_probe(config: MonitorConfig, probe: Arc<dyn ReachabilityProbe>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            probe,
            health: DashMap::new(),
            targets: DashMap::new(),
            maintenance: AtomicBool::new(false),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            weak: weak.clone(),
        })
    }

    /// Register a provider for health accounting without scheduling probes.
    pub fn track(&self, target: ProbeTarget) {
        self.health
            .entry(target.provider_id.clone())
            .or_insert_with(|| ProviderHealth::new(&target.provider_id));
        self.targets.insert(target.provider_id.clone(), target);
    }

    /// Start one independent probe task per provider, firing an immediate
    /// first probe.
    pub fn start_health_checks(&self, targets: Vec<ProbeTarget>) {
        self.running.store(true, Ordering::SeqCst);
        let interval = Duration::from_secs(self.config.probe_interval_secs);

        for target in targets {
            let provider_id = target.provider_id.clone();
            self.track(target);

            let Some(monitor) = self.weak.upgrade() else {
                return;
            };
            let handle = tokio::spawn(async move {
                loop {
                    if !monitor.running.load(Ordering::SeqCst) {
                        break;
                    }
                    monitor.check_availability(&provider_id).await;
                    tokio::time::sleep(interval).await;
                }
            });
            self.tasks.lock().push(handle);
        }
    }

    /// Halt all probe and recovery tasks. Health records are kept.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    /// Probe one provider now and fold the result into its health record.
    pub async fn check_availability(&self, provider_id: &str) {
        let Some(target) = self.targets.get(provider_id).map(|t| t.clone()) else {
            tracing::debug!(provider = provider_id, "probe requested for untracked provider");
            return;
        };

        let started = Instant::now();
        let result = self.probe.check(&target).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => self.record_success(provider_id, elapsed_ms),
            Err(error) => {
                tracing::debug!(provider = provider_id, error = %error, "probe failed");
                self.record_failure(provider_id, &error);
            }
        }
    }

    /// Live-traffic failure hook.
    ///
    /// Called by the OAuth flow client (and any other live path) so real
    /// traffic degrades a provider between scheduled probes.
    pub fn handle_failure(&self, provider_id: &str, error: &str) {
        self.health
            .entry(provider_id.to_string())
            .or_insert_with(|| ProviderHealth::new(provider_id));
        self.record_failure(provider_id, error);
    }

    /// Current strategy for a provider: Maintenance first, then degraded
    /// fallback, then the default.
    pub fn get_fallback_strategy(&self, provider_id: &str) -> FallbackStrategy {
        if self.maintenance.load(Ordering::SeqCst) {
            return FallbackStrategy::MaintenanceMode;
        }
        if self.is_degraded(provider_id) && self.config.local_auth_enabled {
            return FallbackStrategy::LocalAuth;
        }
        FallbackStrategy::QueueRequests
    }

    /// Whether the failure counter has crossed the fallback threshold.
    pub fn is_degraded(&self, provider_id: &str) -> bool {
        self.health
            .get(provider_id)
            .map(|h| h.consecutive_failures >= self.config.fallback_after_failures)
            .unwrap_or(false)
    }

    /// Snapshot of one provider's health, `None` if untracked.
    pub fn get_provider_health(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.health.get(provider_id).map(|h| h.clone())
    }

    /// Clear a provider's failure accounting and leave fallback.
    pub fn reset(&self, provider_id: &str) {
        if let Some(mut h) = self.health.get_mut(provider_id) {
            h.consecutive_failures = 0;
            h.fallback_active = false;
            h.healthy = true;
            h.last_error = None;
        }
    }

    /// Operator maintenance override, highest precedence.
    pub fn set_maintenance(&self, active: bool) {
        tracing::info!(active, "maintenance mode changed");
        self.maintenance.store(active, Ordering::SeqCst);
    }

    /// Whether the operator override is set.
    pub fn maintenance_active(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    /// Whether local-password fallback is enabled in this deployment.
    pub fn local_auth_enabled(&self) -> bool {
        self.config.local_auth_enabled
    }

    fn record_success(&self, provider_id: &str, elapsed_ms: u64) {
        let Some(mut h) = self.health.get_mut(provider_id) else {
            return;
        };
        h.last_checked_at = Some(chrono::Utc::now());
        h.last_response_time_ms = Some(elapsed_ms);
        h.last_error = None;
        h.healthy = true;

        // Recovery is evaluated against the counter as it stood when the
        // probe succeeded: a first success after failures resets the counter
        // but stays in fallback; the next clean success completes recovery.
        if h.fallback_active && h.consecutive_failures == 0 {
            h.fallback_active = false;
            tracing::info!(provider = provider_id, "provider recovered, fallback cleared");
        }
        h.consecutive_failures = 0;
    }

    fn record_failure(&self, provider_id: &str, error: &str) {
        let mut entered_fallback = false;
        {
            let Some(mut h) = self.health.get_mut(provider_id) else {
                return;
            };
            h.last_checked_at = Some(chrono::Utc::now());
            h.last_error = Some(error.to_string());
            h.healthy = false;
            h.consecutive_failures = h.consecutive_failures.saturating_add(1);

            if !h.fallback_active && h.consecutive_failures >= self.config.fallback_after_failures
            {
                h.fallback_active = true;
                entered_fallback = true;
                tracing::warn!(
                    provider = provider_id,
                    failures = h.consecutive_failures,
                    "provider degraded, fallback engaged"
                );
            }
        }
        if entered_fallback {
            self.spawn_recovery_loop(provider_id);
        }
    }

    /// Dedicated recovery probing while a provider sits in fallback,
    /// independent of its regular probe schedule.
    fn spawn_recovery_loop(&self, provider_id: &str) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        {
            let Some(mut h) = self.health.get_mut(provider_id) else {
                return;
            };
            if h.recovery_running {
                return;
            }
            h.recovery_running = true;
        }

        let Some(monitor) = self.weak.upgrade() else {
            return;
        };
        let provider_id = provider_id.to_string();
        let interval = Duration::from_secs(self.config.recovery_interval_secs);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !monitor.running.load(Ordering::SeqCst) {
                    break;
                }
                let still_degraded = monitor
                    .health
                    .get(&provider_id)
                    .map(|h| h.fallback_active)
                    .unwrap_or(false);
                if !still_degraded {
                    break;
                }
                monitor.check_availability(&provider_id).await;
            }
            if let Some(mut h) = monitor.health.get_mut(&provider_id) {
                h.recovery_running = false;
            }
        });
        self.tasks.lock().push(handle);
    }
}
