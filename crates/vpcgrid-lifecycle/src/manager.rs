//! Router lifecycle manager.
//!
//! Every public operation runs on its own spawned task, so a caller that
//! gives up waiting does not leave a router half created or half
//! destroyed. Transitions are serialized per router, and router creation
//! per VPC.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vpcgrid_agent::{AgentError, AgentHandle, IpPool, RouterAgent, RouterSpec, TierSpec};
use vpcgrid_core::VpcGridConfig;
use vpcgrid_core::config::LifecycleConfig;
use vpcgrid_health::{HealthEvent, HealthMonitor};
use vpcgrid_reconcile::{CompletionToken, Reconciler};
use vpcgrid_state::*;

use crate::error::{LifecycleError, LifecycleResult};
use crate::transition;

/// A router that reached `Running`, plus the resync scheduled for it.
pub struct RouterReady {
    pub router: Router,
    pub resync: CompletionToken,
}

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

pub(crate) struct Inner {
    pub(crate) state: StateStore,
    pub(crate) agent: Arc<dyn RouterAgent>,
    pub(crate) pool: Arc<dyn IpPool>,
    pub(crate) reconciler: Reconciler,
    pub(crate) health: HealthMonitor,
    pub(crate) config: LifecycleConfig,
    /// Taken by the supervisor when it starts.
    pub(crate) events: Mutex<Option<mpsc::UnboundedReceiver<HealthEvent>>>,
    router_locks: LockMap,
    vpc_locks: LockMap,
}

/// Drives VPC routers through their lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleManager {
    pub(crate) inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(
        state: StateStore,
        agent: Arc<dyn RouterAgent>,
        pool: Arc<dyn IpPool>,
        reconciler: Reconciler,
        config: &VpcGridConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let health = HealthMonitor::new(
            state.clone(),
            agent.clone(),
            config.health.clone(),
            events_tx,
        );
        Self {
            inner: Arc::new(Inner {
                state,
                agent,
                pool,
                reconciler,
                health,
                config: config.lifecycle.clone(),
                events: Mutex::new(Some(events_rx)),
                router_locks: Mutex::new(HashMap::new()),
                vpc_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }

    pub fn list_routers(&self, vpc_id: &str) -> LifecycleResult<Vec<Router>> {
        Ok(self.inner.state.list_routers_for_vpc(vpc_id)?)
    }

    // ── Public operations ──────────────────────────────────────────

    /// Provision a new router for a VPC that has none.
    pub async fn create(&self, vpc_id: &str) -> LifecycleResult<RouterReady> {
        let vpc_id = vpc_id.to_string();
        self.detached(move |this| async move { this.create_inner(&vpc_id).await })
            .await
    }

    /// Boot a stopped router again.
    pub async fn start(&self, router_id: &str) -> LifecycleResult<RouterReady> {
        let router_id = router_id.to_string();
        self.detached(move |this| async move { this.start_inner(&router_id).await })
            .await
    }

    /// Stop a running router. Stopping a stopped router is a no-op.
    pub async fn stop(&self, router_id: &str) -> LifecycleResult<Router> {
        let router_id = router_id.to_string();
        self.detached(move |this| async move { this.stop_inner(&router_id).await })
            .await
    }

    /// Destroy a router. Rule records are left untouched.
    pub async fn destroy(&self, router_id: &str) -> LifecycleResult<Router> {
        let router_id = router_id.to_string();
        self.detached(move |this| async move { this.destroy_inner(&router_id).await })
            .await
    }

    /// Mark a router `Failed` after it was lost.
    pub async fn fail(&self, router_id: &str) -> LifecycleResult<Router> {
        let router_id = router_id.to_string();
        self.detached(move |this| async move { this.fail_inner(&router_id).await })
            .await
    }

    /// Destroy whatever router the VPC still has, then create a new one.
    pub async fn replace(&self, vpc_id: &str) -> LifecycleResult<RouterReady> {
        for router in self.inner.state.list_routers_for_vpc(vpc_id)? {
            if router.state == RouterState::Destroyed {
                continue;
            }
            match self.destroy(&router.id).await {
                Ok(_) | Err(LifecycleError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.create(vpc_id).await
    }

    // ── Implementation ─────────────────────────────────────────────

    async fn detached<T, Fut>(&self, f: impl FnOnce(LifecycleManager) -> Fut) -> LifecycleResult<T>
    where
        Fut: Future<Output = LifecycleResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(f(self.clone()))
            .await
            .map_err(|e| LifecycleError::Task(e.to_string()))?
    }

    #[cfg(test)]
    pub(crate) fn router_lock_count(&self) -> usize {
        self.inner.router_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn router_lock(&self, router_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock_for(&self.inner.router_locks, router_id)
    }

    fn vpc_lock(&self, vpc_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock_for(&self.inner.vpc_locks, vpc_id)
    }

    fn get_router(&self, router_id: &str) -> LifecycleResult<Router> {
        self.inner
            .state
            .get_router(router_id)?
            .ok_or_else(|| LifecycleError::RouterNotFound(router_id.to_string()))
    }

    fn set_router(&self, router_id: &str, f: impl FnOnce(&mut Router)) -> LifecycleResult<Router> {
        self.inner
            .state
            .update_router(router_id, f)?
            .ok_or_else(|| LifecycleError::RouterNotFound(router_id.to_string()))
    }

    async fn create_inner(&self, vpc_id: &str) -> LifecycleResult<RouterReady> {
        let vpc_lock = self.vpc_lock(vpc_id);
        let _vpc_guard = vpc_lock.lock().await;
        let state = &self.inner.state;

        let vpc = state
            .get_vpc(vpc_id)?
            .ok_or_else(|| LifecycleError::VpcNotFound(vpc_id.to_string()))?;
        if let Some(active) = state.active_router_for_vpc(vpc_id)? {
            return Err(LifecycleError::InvalidTransition {
                router_id: active.id,
                from: active.state,
                to: RouterState::Provisioning,
            });
        }

        let router_id = state.next_id("router")?;
        let public_ip = self.inner.pool.allocate(&vpc.zone_id, &router_id)?;
        let now = epoch_millis();
        let ip_record = PublicIpRecord {
            address: public_ip,
            zone_id: vpc.zone_id.clone(),
            vpc_id: vpc_id.to_string(),
            network_id: None,
            source_nat: true,
            allocated_at: now,
        };
        if let Err(e) = state.put_public_ip(&ip_record) {
            let _ = self.inner.pool.release(&vpc.zone_id, public_ip);
            return Err(e.into());
        }

        let router = Router {
            id: router_id,
            vpc_id: vpc_id.to_string(),
            state: RouterState::Provisioning,
            public_ip: Some(public_ip),
            agent_handle: None,
            last_health_at: None,
            provision_attempts: 0,
            ip_release_deferred: false,
            created_at: now,
            updated_at: now,
        };
        state.put_router(&router)?;
        info!(%vpc_id, router_id = %router.id, %public_ip, "router provisioning");

        let router_lock = self.router_lock(&router.id);
        let _router_guard = router_lock.lock().await;
        let router = self.boot_until_running(router).await?;
        self.on_running(router)
    }

    async fn start_inner(&self, router_id: &str) -> LifecycleResult<RouterReady> {
        let lock = self.router_lock(router_id);
        let _guard = lock.lock().await;

        let router = self.get_router(router_id)?;
        transition::check(&router, RouterState::Provisioning)?;
        let router = self.set_router(router_id, |r| {
            r.state = RouterState::Provisioning;
            r.provision_attempts = 0;
        })?;
        info!(%router_id, vpc_id = %router.vpc_id, "router starting");

        let router = self.boot_until_running(router).await?;
        self.on_running(router)
    }

    async fn stop_inner(&self, router_id: &str) -> LifecycleResult<Router> {
        let lock = self.router_lock(router_id);
        let _guard = lock.lock().await;

        let router = self.get_router(router_id)?;
        if router.state == RouterState::Stopped {
            debug!(%router_id, "router already stopped");
            return Ok(router);
        }
        transition::check(&router, RouterState::Stopping)?;
        self.set_router(router_id, |r| r.state = RouterState::Stopping)?;

        self.inner.health.stop_monitor(router_id).await;
        self.terminate_instance(&router).await;

        let router = self.set_router(router_id, |r| {
            r.state = RouterState::Stopped;
            r.agent_handle = None;
        })?;
        info!(%router_id, vpc_id = %router.vpc_id, "router stopped");
        Ok(router)
    }

    pub(crate) async fn destroy_inner(&self, router_id: &str) -> LifecycleResult<Router> {
        let lock = self.router_lock(router_id);
        let _guard = lock.lock().await;

        let router = self.get_router(router_id)?;
        transition::check(&router, RouterState::Destroying)?;
        self.set_router(router_id, |r| r.state = RouterState::Destroying)?;

        self.inner.health.stop_monitor(router_id).await;
        self.terminate_instance(&router).await;

        let deferred = self.release_router_ip(&router)?;
        let router = self.set_router(router_id, |r| {
            r.state = RouterState::Destroyed;
            r.agent_handle = None;
            r.ip_release_deferred = deferred;
        })?;
        let now = epoch_millis();
        self.inner.state.update_vpc(&router.vpc_id, |v| {
            v.router_lost_at.get_or_insert(now);
        })?;
        // Destroyed is terminal; later callers see it in the store.
        self.inner
            .router_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(router_id);
        info!(%router_id, vpc_id = %router.vpc_id, ip_release_deferred = deferred, "router destroyed");
        Ok(router)
    }

    async fn fail_inner(&self, router_id: &str) -> LifecycleResult<Router> {
        let lock = self.router_lock(router_id);
        let _guard = lock.lock().await;

        let router = self.get_router(router_id)?;
        transition::check(&router, RouterState::Failed)?;

        self.inner.health.stop_monitor(router_id).await;
        self.terminate_instance(&router).await;

        let router = self.set_router(router_id, |r| {
            r.state = RouterState::Failed;
            r.agent_handle = None;
        })?;
        let now = epoch_millis();
        self.inner.state.update_vpc(&router.vpc_id, |v| {
            v.router_lost_at.get_or_insert(now);
        })?;
        warn!(%router_id, vpc_id = %router.vpc_id, "router failed");
        Ok(router)
    }

    /// Boot with retries. The caller holds the router's lock and has put
    /// the router in `Provisioning`.
    async fn boot_until_running(&self, router: Router) -> LifecycleResult<Router> {
        let max = self.inner.config.max_provision_attempts;
        let timeout = self.inner.config.provision_timeout();
        let spec = self.router_spec(&router)?;

        for attempt in 1..=max {
            self.set_router(&router.id, |r| r.provision_attempts = attempt)?;
            let mut boot = tokio::spawn(boot_once(self.inner.agent.clone(), spec.clone()));
            match tokio::time::timeout(timeout, &mut boot).await {
                Ok(Ok(Ok(handle))) => {
                    let now = epoch_millis();
                    let running = self.set_router(&router.id, |r| {
                        r.state = RouterState::Running;
                        r.agent_handle = Some(handle.0.clone());
                        r.last_health_at = Some(now);
                    })?;
                    self.inner
                        .health
                        .start_monitor(&running.id, &running.vpc_id, handle)
                        .await;
                    info!(router_id = %running.id, vpc_id = %running.vpc_id, attempt, "router running");
                    return Ok(running);
                }
                Ok(Ok(Err(e))) => {
                    warn!(router_id = %router.id, attempt, max, error = %e, "router boot failed");
                }
                Ok(Err(e)) => {
                    warn!(router_id = %router.id, attempt, max, error = %e, "router boot task failed");
                }
                Err(_) => {
                    warn!(
                        router_id = %router.id,
                        attempt,
                        max,
                        timeout_ms = timeout.as_millis() as u64,
                        "router boot timed out"
                    );
                    self.reap_late_boot(router.id.clone(), boot);
                }
            }
        }

        self.set_router(&router.id, |r| {
            r.state = RouterState::Failed;
            r.agent_handle = None;
        })?;
        // Restart the recreate grace so the supervisor backs off.
        let now = epoch_millis();
        let failed_creates = self
            .inner
            .state
            .update_vpc(&router.vpc_id, |v| {
                v.router_lost_at = Some(now);
                v.failed_creates += 1;
            })?
            .map(|v| v.failed_creates)
            .unwrap_or_default();
        error!(
            router_id = %router.id,
            vpc_id = %router.vpc_id,
            attempts = max,
            failed_creates,
            "router provisioning failed"
        );
        if failed_creates >= self.inner.config.max_recreate_attempts {
            warn!(
                vpc_id = %router.vpc_id,
                failed_creates,
                "automatic router recreation stopped, replace the router to retry"
            );
        }
        Err(LifecycleError::ProvisioningTimeout {
            router_id: router.id.clone(),
            attempts: max,
        })
    }

    /// A boot that outlived its timeout may still hand back an instance;
    /// terminate it when it does.
    fn reap_late_boot(&self, router_id: RouterId, boot: JoinHandle<Result<AgentHandle, AgentError>>) {
        let agent = self.inner.agent.clone();
        tokio::spawn(async move {
            if let Ok(Ok(handle)) = boot.await {
                match agent.terminate(&handle).await {
                    Ok(()) => info!(%router_id, %handle, "late router instance terminated"),
                    Err(e) => {
                        warn!(%router_id, %handle, error = %e, "late router instance terminate failed")
                    }
                }
            }
        });
    }

    fn router_spec(&self, router: &Router) -> LifecycleResult<RouterSpec> {
        let public_ip = router
            .public_ip
            .ok_or_else(|| LifecycleError::Task(format!("router {} has no public IP", router.id)))?;
        let tiers = self
            .inner
            .state
            .list_networks_for_vpc(&router.vpc_id)?
            .into_iter()
            .map(|n| TierSpec {
                network_id: n.id,
                cidr: n.cidr,
                gateway: n.gateway,
            })
            .collect();
        Ok(RouterSpec {
            router_id: router.id.clone(),
            vpc_id: router.vpc_id.clone(),
            public_ip,
            tiers,
        })
    }

    fn on_running(&self, router: Router) -> LifecycleResult<RouterReady> {
        self.inner.state.update_vpc(&router.vpc_id, |v| {
            v.router_lost_at = None;
            v.failed_creates = 0;
        })?;
        let resync = self.inner.reconciler.request(&router.vpc_id);
        Ok(RouterReady { router, resync })
    }

    /// Best-effort termination of a router's live instance.
    async fn terminate_instance(&self, router: &Router) {
        let Some(handle) = router.agent_handle.clone().map(AgentHandle) else {
            return;
        };
        let timeout = self.inner.config.provision_timeout();
        match tokio::time::timeout(timeout, self.inner.agent.terminate(&handle)).await {
            Ok(Ok(())) => debug!(router_id = %router.id, %handle, "router instance terminated"),
            Ok(Err(e)) => {
                warn!(router_id = %router.id, %handle, error = %e, "router terminate failed, continuing")
            }
            Err(_) => warn!(router_id = %router.id, %handle, "router terminate timed out, continuing"),
        }
    }

    /// Return the router's public IP to the pool unless a NAT rule still
    /// uses it. Returns true when the release had to be deferred.
    pub(crate) fn release_router_ip(&self, router: &Router) -> LifecycleResult<bool> {
        let Some(address) = router.public_ip else {
            return Ok(false);
        };
        let state = &self.inner.state;
        let key = address.to_string();

        let dependents = state.nat_rules_for_ip(&key)?;
        if !dependents.is_empty() {
            info!(
                router_id = %router.id,
                %address,
                rules = dependents.len(),
                "public IP still used by NAT rules, release deferred"
            );
            return Ok(true);
        }

        if let Some(record) = state.get_public_ip(&key)? {
            if let Err(e) = self.inner.pool.release(&record.zone_id, address) {
                warn!(router_id = %router.id, %address, error = %e, "public IP release failed");
            }
            state.delete_public_ip(&key)?;
            debug!(router_id = %router.id, %address, "public IP released");
        }
        Ok(false)
    }
}

/// Boot one instance and require a healthy first check. An instance that
/// fails the check is terminated before the error is returned.
async fn boot_once(agent: Arc<dyn RouterAgent>, spec: RouterSpec) -> Result<AgentHandle, AgentError> {
    let handle = agent.boot(&spec).await?;
    let failure = match agent.health_check(&handle).await {
        Ok(true) => return Ok(handle),
        Ok(false) => AgentError::BootFailed(format!("{} failed its first health check", spec.router_id)),
        Err(e) => e,
    };
    if let Err(e) = agent.terminate(&handle).await {
        warn!(router_id = %spec.router_id, %handle, error = %e, "terminating unhealthy instance failed");
    }
    Err(failure)
}

fn lock_for(map: &LockMap, key: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = map.lock().unwrap_or_else(|e| e.into_inner());
    locks.entry(key.to_string()).or_default().clone()
}
