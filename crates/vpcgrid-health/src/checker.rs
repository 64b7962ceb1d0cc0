//! Health probe logic.
//!
//! Probes a router through its agent and folds the results into a
//! three-state health status.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use vpcgrid_agent::{AgentHandle, RouterAgent};
use vpcgrid_core::config::HealthConfig;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The agent reported the router healthy.
    Healthy,
    /// The agent answered, but the router is not healthy.
    Unhealthy,
    /// The probe could not be executed (agent error or timeout).
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Failing, but not yet for long enough to be declared lost.
    Suspect,
    Lost,
}

/// Tracks consecutive probe results for a single router.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
    grace_period: Duration,
    last_success: Instant,
}

impl HealthTracker {
    /// Create a tracker for a router that was just seen healthy.
    pub fn new(config: &HealthConfig) -> Self {
        Self::with_thresholds(config.unhealthy_threshold, config.grace_period())
    }

    pub fn with_thresholds(unhealthy_threshold: u32, grace_period: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            unhealthy_threshold,
            grace_period,
            last_success: Instant::now(),
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        self.record_at(result, Instant::now())
    }

    pub fn record_at(&mut self, result: ProbeResult, now: Instant) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                if self.status != HealthStatus::Healthy {
                    debug!(failures = self.consecutive_failures, "router recovered to healthy");
                }
                self.consecutive_failures = 0;
                self.last_success = now;
                self.status = HealthStatus::Healthy;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;
                let silent_for = now.saturating_duration_since(self.last_success);
                if self.consecutive_failures >= self.unhealthy_threshold
                    && silent_for >= self.grace_period
                {
                    if self.status != HealthStatus::Lost {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            silent_ms = silent_for.as_millis() as u64,
                            "router declared lost"
                        );
                    }
                    self.status = HealthStatus::Lost;
                } else {
                    self.status = HealthStatus::Suspect;
                }
            }
        }

        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Probe one router instance, bounded by `timeout`.
pub async fn probe(agent: &dyn RouterAgent, handle: &AgentHandle, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, agent.health_check(handle)).await {
        Ok(Ok(true)) => ProbeResult::Healthy,
        Ok(Ok(false)) => ProbeResult::Unhealthy,
        Ok(Err(e)) => {
            debug!(error = %e, %handle, "health probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%handle, "health probe timed out");
            ProbeResult::Failed
        }
    }
}
