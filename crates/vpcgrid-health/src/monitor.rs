//! Health monitor — background tasks that probe Running routers.
//!
//! The `HealthMonitor` spawns one task per router. Every probe is turned
//! into a [`HealthEvent`] for the lifecycle supervisor; successful probes
//! also stamp `last_health_at` on the router record.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use vpcgrid_agent::{AgentHandle, RouterAgent};
use vpcgrid_core::config::HealthConfig;
use vpcgrid_state::{RouterId, RouterState, StateStore, VpcId, epoch_millis};

use crate::checker::{HealthStatus, HealthTracker, ProbeResult, probe};

/// Outcome of one probe, as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Healthy { router_id: RouterId, vpc_id: VpcId },
    Lost { router_id: RouterId, vpc_id: VpcId },
}

/// Per-router monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages health monitors for all Running routers.
#[derive(Clone)]
pub struct HealthMonitor {
    state: StateStore,
    agent: Arc<dyn RouterAgent>,
    config: HealthConfig,
    events: mpsc::UnboundedSender<HealthEvent>,
    /// Active monitors: router_id → slot.
    monitors: Arc<RwLock<HashMap<RouterId, MonitorSlot>>>,
}

impl HealthMonitor {
    pub fn new(
        state: StateStore,
        agent: Arc<dyn RouterAgent>,
        config: HealthConfig,
        events: mpsc::UnboundedSender<HealthEvent>,
    ) -> Self {
        Self {
            state,
            agent,
            config,
            events,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start monitoring a router. Replaces any monitor already running
    /// for the same router.
    pub async fn start_monitor(&self, router_id: &str, vpc_id: &str, handle: AgentHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = LoopContext {
            router_id: router_id.to_string(),
            vpc_id: vpc_id.to_string(),
            handle,
            state: self.state.clone(),
            agent: self.agent.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
        };
        let task = tokio::spawn(run_health_loop(ctx, shutdown_rx));

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            router_id.to_string(),
            MonitorSlot {
                handle: task,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%router_id, %vpc_id, interval = %self.config.interval, "health monitor started");
    }

    pub async fn stop_monitor(&self, router_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(router_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%router_id, "health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(router_id = %id, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<RouterId> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, router_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(router_id)
    }
}

struct LoopContext {
    router_id: RouterId,
    vpc_id: VpcId,
    handle: AgentHandle,
    state: StateStore,
    agent: Arc<dyn RouterAgent>,
    config: HealthConfig,
    events: mpsc::UnboundedSender<HealthEvent>,
}

/// The health check loop for a single router.
async fn run_health_loop(ctx: LoopContext, mut shutdown: watch::Receiver<bool>) {
    let interval = ctx.config.interval();
    let timeout = ctx.config.timeout();
    let mut tracker = HealthTracker::new(&ctx.config);
    let router_id = ctx.router_id.as_str();

    debug!(%router_id, "health loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let result = probe(ctx.agent.as_ref(), &ctx.handle, timeout).await;
                let status = tracker.record(result);

                if result == ProbeResult::Healthy {
                    match record_success(&ctx.state, router_id) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(%router_id, "router no longer running, health loop exiting");
                            break;
                        }
                        Err(e) => {
                            error!(%router_id, error = %e, "failed to record health check");
                        }
                    }
                    let _ = ctx.events.send(HealthEvent::Healthy {
                        router_id: ctx.router_id.clone(),
                        vpc_id: ctx.vpc_id.clone(),
                    });
                } else if status == HealthStatus::Lost {
                    let _ = ctx.events.send(HealthEvent::Lost {
                        router_id: ctx.router_id.clone(),
                        vpc_id: ctx.vpc_id.clone(),
                    });
                    break;
                } else {
                    debug!(
                        %router_id,
                        ?result,
                        failures = tracker.consecutive_failures(),
                        "router health check failed"
                    );
                }
            }
            _ = shutdown.changed() => {
                debug!(%router_id, "health loop shutting down");
                break;
            }
        }
    }
}

/// Stamp `last_health_at`. Returns false once the router has left `Running`.
fn record_success(state: &StateStore, router_id: &str) -> Result<bool, vpcgrid_state::StateError> {
    let now = epoch_millis();
    let updated = state.update_router(router_id, |router| {
        if router.state == RouterState::Running {
            router.last_health_at = Some(now);
        }
    })?;
    Ok(updated.is_some_and(|r| r.state == RouterState::Running))
}
