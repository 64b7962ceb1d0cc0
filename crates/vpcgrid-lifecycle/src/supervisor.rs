//! Lifecycle supervisor — the background loop that keeps every VPC served.
//!
//! The loop reacts to health events as they arrive and, on a fixed tick:
//! - recreates routers for VPCs that have been without one for longer
//!   than the recreate grace, until `max_recreate_attempts` creates in a
//!   row have failed
//! - reaps `Failed` routers (destroy, which frees their public IP) unless
//!   their VPC has stopped recreating; those stay visible until `replace`
//! - retries public IP releases deferred by NAT rules

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use vpcgrid_agent::AgentHandle;
use vpcgrid_health::HealthEvent;
use vpcgrid_state::{RouterState, epoch_millis};

use crate::error::{LifecycleError, LifecycleResult};
use crate::manager::LifecycleManager;

impl LifecycleManager {
    /// Run the supervisor until `shutdown` flips. Can only run once per
    /// manager.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> LifecycleResult<()> {
        let mut events = self
            .inner
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| LifecycleError::Task("supervisor already running".to_string()))?;

        let mut tick = tokio::time::interval(self.inner.config.supervise_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            recreate_grace = %self.inner.config.recreate_grace,
            "lifecycle supervisor started"
        );

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_health_event(event),
                _ = tick.tick() => self.sweep().await,
                _ = shutdown.changed() => {
                    info!("lifecycle supervisor shutting down");
                    break;
                }
            }
        }

        self.inner.health.stop_all().await;
        Ok(())
    }

    /// Bring persisted routers back under management after a restart.
    ///
    /// Public IPs are re-reserved in the pool, Running routers get their
    /// health monitors back, and transitions cut short by the restart are
    /// settled.
    pub async fn restore(&self) -> LifecycleResult<()> {
        let state = &self.inner.state;
        for vpc in state.list_vpcs()? {
            for record in state.list_public_ips_for_vpc(&vpc.id)? {
                if let Err(e) = self
                    .inner
                    .pool
                    .reserve(&record.zone_id, record.address, &record.vpc_id)
                {
                    warn!(address = %record.address, error = %e, "could not re-reserve public IP");
                }
            }
        }

        for router in state.list_routers()? {
            match router.state {
                RouterState::Running => {
                    if let Some(handle) = router.agent_handle.clone() {
                        self.inner
                            .health
                            .start_monitor(&router.id, &router.vpc_id, AgentHandle(handle))
                            .await;
                    }
                }
                RouterState::Provisioning => {
                    state.update_router(&router.id, |r| r.state = RouterState::Failed)?;
                    info!(router_id = %router.id, "interrupted provisioning marked failed");
                }
                RouterState::Stopping => {
                    state.update_router(&router.id, |r| {
                        r.state = RouterState::Stopped;
                        r.agent_handle = None;
                    })?;
                    info!(router_id = %router.id, "interrupted stop completed");
                }
                RouterState::Destroying => {
                    self.destroy(&router.id).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_health_event(&self, event: HealthEvent) {
        match event {
            HealthEvent::Healthy { vpc_id, .. } => {
                match self.inner.state.has_pending_rules(&vpc_id) {
                    Ok(true) => {
                        debug!(%vpc_id, "pending rules on healthy router, requesting resync");
                        drop(self.inner.reconciler.request(&vpc_id));
                    }
                    Ok(false) => {}
                    Err(e) => warn!(%vpc_id, error = %e, "pending rule check failed"),
                }
            }
            HealthEvent::Lost { router_id, vpc_id } => {
                warn!(%router_id, %vpc_id, "router lost, replacing");
                let this = self.clone();
                tokio::spawn(async move { this.recover(&router_id, &vpc_id).await });
            }
        }
    }

    async fn recover(&self, router_id: &str, vpc_id: &str) {
        if let Err(e) = self.fail(router_id).await {
            // Stopped or destroyed in the meantime: nothing to recover.
            debug!(%router_id, error = %e, "lost router not failed");
            return;
        }
        match self.replace(vpc_id).await {
            Ok(ready) => info!(%vpc_id, router_id = %ready.router.id, "replacement router running"),
            Err(e) => error!(%vpc_id, error = %e, "router replacement failed"),
        }
    }

    async fn sweep(&self) {
        if let Err(e) = self.sweep_routers().await {
            error!(error = %e, "router sweep failed");
        }
        if let Err(e) = self.sweep_vpcs() {
            error!(error = %e, "vpc sweep failed");
        }
    }

    async fn sweep_routers(&self) -> LifecycleResult<()> {
        let state = &self.inner.state;
        for router in state.list_routers()? {
            match router.state {
                RouterState::Failed => {
                    if self.recreation_stopped(&router.vpc_id)? {
                        continue;
                    }
                    debug!(router_id = %router.id, "reaping failed router");
                    match self.destroy(&router.id).await {
                        Ok(_) | Err(LifecycleError::InvalidTransition { .. }) => {}
                        Err(e) => warn!(router_id = %router.id, error = %e, "reap failed"),
                    }
                }
                RouterState::Destroyed if router.ip_release_deferred => {
                    if !self.release_router_ip(&router)? {
                        state.update_router(&router.id, |r| r.ip_release_deferred = false)?;
                        info!(router_id = %router.id, "deferred public IP released");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn sweep_vpcs(&self) -> LifecycleResult<()> {
        let state = &self.inner.state;
        let now = epoch_millis();
        let grace_ms = self.inner.config.recreate_grace().as_millis() as u64;

        for vpc in state.list_vpcs()? {
            let Some(lost_at) = vpc.router_lost_at else {
                continue;
            };
            if now.saturating_sub(lost_at) < grace_ms {
                continue;
            }
            if vpc.failed_creates >= self.inner.config.max_recreate_attempts {
                continue;
            }
            if state.active_router_for_vpc(&vpc.id)?.is_some() {
                continue;
            }

            info!(vpc_id = %vpc.id, "vpc without router past grace, recreating");
            let this = self.clone();
            let vpc_id = vpc.id.clone();
            tokio::spawn(async move {
                match this.create(&vpc_id).await {
                    Ok(ready) => info!(%vpc_id, router_id = %ready.router.id, "router recreated"),
                    Err(LifecycleError::InvalidTransition { .. }) => {
                        debug!(%vpc_id, "router already being recreated");
                    }
                    Err(e) => warn!(%vpc_id, error = %e, "router recreation failed"),
                }
            });
        }
        Ok(())
    }

    fn recreation_stopped(&self, vpc_id: &str) -> LifecycleResult<bool> {
        let failed_creates = self
            .inner
            .state
            .get_vpc(vpc_id)?
            .map(|v| v.failed_creates)
            .unwrap_or_default();
        Ok(failed_creates >= self.inner.config.max_recreate_attempts)
    }
}
