//! Reconciler — per-VPC resync passes and their scheduling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vpcgrid_agent::{AgentHandle, RouterAgent};
use vpcgrid_core::config::ReconcileConfig;
use vpcgrid_state::*;

use crate::error::{ReconcileError, ReconcileResult};
use crate::plan::{desired_config, plan_ops};

/// What one resync pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub vpc_id: VpcId,
    /// Router the pass ran against; `None` when skipped.
    pub router_id: Option<RouterId>,
    /// No Running router: nothing was pushed, desired state stays pending.
    pub skipped: bool,
    /// Agent operations issued.
    pub operations: u32,
    /// Rules newly confirmed on the router.
    pub applied: Vec<RuleId>,
    /// Stale items removed from the router.
    pub removed: u32,
    /// Tiers whose interface was plugged in by this pass.
    pub attached: Vec<NetworkId>,
    pub detached: Vec<NetworkId>,
    #[serde(serialize_with = "serialize_errors")]
    pub failures: Vec<ReconcileError>,
    pub degraded_networks: Vec<NetworkId>,
}

impl ResyncReport {
    fn skipped(vpc_id: &str) -> Self {
        Self {
            vpc_id: vpc_id.to_string(),
            skipped: true,
            ..Default::default()
        }
    }

    /// Whether the router now carries exactly the desired config.
    pub fn converged(&self) -> bool {
        !self.skipped && self.failures.is_empty()
    }
}

fn serialize_errors<S: serde::Serializer>(
    errors: &[ReconcileError],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(|e| e.to_string()))
}

/// Outcome of a scheduled pass, shared by every request it covered.
#[derive(Debug, Clone)]
pub struct Completion {
    pub generation: u64,
    pub outcome: ReconcileResult<ResyncReport>,
}

/// Resolves once a resync that started after the request has finished.
pub struct CompletionToken {
    generation: u64,
    /// Ignore passes that found no running router.
    require_router: bool,
    rx: watch::Receiver<Option<Completion>>,
}

impl CompletionToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn wait(mut self) -> ReconcileResult<ResyncReport> {
        loop {
            if let Some(done) = self.rx.borrow_and_update().as_ref() {
                let skipped = matches!(&done.outcome, Ok(report) if report.skipped);
                if done.generation >= self.generation && !(self.require_router && skipped) {
                    return done.outcome.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                return Err(ReconcileError::Cancelled);
            }
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub async fn wait_timeout(self, timeout: Duration) -> Option<ReconcileResult<ResyncReport>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

/// Per-VPC scheduling state.
struct Schedule {
    requested: u64,
    completed: u64,
    running: bool,
    done_tx: watch::Sender<Option<Completion>>,
}

impl Schedule {
    fn new() -> Self {
        let (done_tx, _) = watch::channel(None);
        Self {
            requested: 0,
            completed: 0,
            running: false,
            done_tx,
        }
    }
}

struct Inner {
    state: StateStore,
    agent: Arc<dyn RouterAgent>,
    config: ReconcileConfig,
    /// One pass per VPC at a time, whether scheduled or called directly.
    vpc_locks: Mutex<HashMap<VpcId, Arc<tokio::sync::Mutex<()>>>>,
    schedules: Mutex<HashMap<VpcId, Schedule>>,
}

/// Converges VPC routers to the rule store. Cheap to clone.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(state: StateStore, agent: Arc<dyn RouterAgent>, config: ReconcileConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                agent,
                config,
                vpc_locks: Mutex::new(HashMap::new()),
                schedules: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn vpc_lock(&self, vpc_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.vpc_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(vpc_id.to_string()).or_default().clone()
    }

    // ── Scheduling ─────────────────────────────────────────────────

    /// Schedule a resync of `vpc_id` on a background task.
    ///
    /// Requests that arrive while a pass is running are folded into one
    /// follow-up pass.
    pub fn request(&self, vpc_id: &str) -> CompletionToken {
        let mut schedules = self.inner.schedules.lock().unwrap_or_else(|e| e.into_inner());
        let schedule = schedules
            .entry(vpc_id.to_string())
            .or_insert_with(Schedule::new);
        schedule.requested += 1;
        let token = CompletionToken {
            generation: schedule.requested,
            require_router: false,
            rx: schedule.done_tx.subscribe(),
        };

        if !schedule.running {
            schedule.running = true;
            let this = self.clone();
            let vpc_id = vpc_id.to_string();
            tokio::spawn(async move { this.drive(vpc_id).await });
        } else {
            debug!(%vpc_id, generation = token.generation, "resync coalesced into pending pass");
        }
        token
    }

    /// A token for the next pass of `vpc_id` that reaches a running
    /// router, without scheduling one. Used when the router is going away
    /// and its replacement will request the pass.
    pub fn next_router_pass(&self, vpc_id: &str) -> CompletionToken {
        let mut schedules = self.inner.schedules.lock().unwrap_or_else(|e| e.into_inner());
        let schedule = schedules
            .entry(vpc_id.to_string())
            .or_insert_with(Schedule::new);
        CompletionToken {
            generation: schedule.requested + 1,
            require_router: true,
            rx: schedule.done_tx.subscribe(),
        }
    }

    async fn drive(self, vpc_id: VpcId) {
        loop {
            let target = {
                let mut schedules = self.inner.schedules.lock().unwrap_or_else(|e| e.into_inner());
                let Some(schedule) = schedules.get_mut(&vpc_id) else {
                    return;
                };
                if schedule.completed >= schedule.requested {
                    schedule.running = false;
                    return;
                }
                schedule.requested
            };

            let outcome = self.resync(&vpc_id).await;
            if let Err(e) = &outcome {
                warn!(%vpc_id, error = %e, "scheduled resync failed");
            }

            let mut schedules = self.inner.schedules.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(schedule) = schedules.get_mut(&vpc_id) {
                schedule.completed = target;
                schedule.done_tx.send_replace(Some(Completion {
                    generation: target,
                    outcome,
                }));
            }
        }
    }

    /// The most recent completed scheduled pass for a VPC.
    pub fn latest(&self, vpc_id: &str) -> Option<Completion> {
        let schedules = self.inner.schedules.lock().unwrap_or_else(|e| e.into_inner());
        schedules
            .get(vpc_id)
            .and_then(|s| s.done_tx.borrow().clone())
    }

    // ── Resync ─────────────────────────────────────────────────────

    /// Run one resync pass for `vpc_id` now.
    pub async fn resync(&self, vpc_id: &str) -> ReconcileResult<ResyncReport> {
        let lock = self.vpc_lock(vpc_id);
        let _guard = lock.lock().await;

        let state = &self.inner.state;
        state
            .get_vpc(vpc_id)?
            .ok_or_else(|| ReconcileError::VpcNotFound(vpc_id.to_string()))?;

        let router = state
            .active_router_for_vpc(vpc_id)?
            .filter(|r| r.state == RouterState::Running);
        let Some((router, handle)) =
            router.and_then(|r| r.agent_handle.clone().map(|h| (r, AgentHandle(h))))
        else {
            debug!(%vpc_id, "no running router, resync skipped");
            return Ok(ResyncReport::skipped(vpc_id));
        };

        let mut networks = state.list_networks_for_vpc(vpc_id)?;
        networks.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        let mut tiers = Vec::with_capacity(networks.len());
        for network in networks {
            let rules = state.list_rules(&network.id)?;
            tiers.push((network, rules));
        }

        let desired = desired_config(&tiers);
        let live = self
            .bounded("live_config", self.inner.agent.live_config(&handle))
            .await??;
        let ops = plan_ops(&desired, &live);

        let mut report = ResyncReport {
            vpc_id: vpc_id.to_string(),
            router_id: Some(router.id.clone()),
            ..Default::default()
        };

        for op in &ops {
            report.operations += 1;
            let pushed = match self
                .bounded("push_config", self.inner.agent.push_config(&handle, op))
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match (pushed, op.rule_id()) {
                (Ok(()), None) if op.is_add() => report.attached.push(op.network_id().to_string()),
                (Ok(()), None) => report.detached.push(op.network_id().to_string()),
                (Ok(()), Some(rule_id)) if op.is_add() => {
                    state.mark_applied(rule_id, &router.id)?;
                    report.applied.push(rule_id.to_string());
                }
                (Ok(()), Some(_)) => report.removed += 1,
                (Err(reason), rule_id) => {
                    warn!(%vpc_id, router_id = %router.id, %op, %reason, "config push failed");
                    match rule_id {
                        Some(rule_id) => {
                            if op.is_add() {
                                state.mark_pending(rule_id)?;
                            }
                            report.failures.push(ReconcileError::RuleApply {
                                rule_id: rule_id.to_string(),
                                network_id: op.network_id().to_string(),
                                reason,
                            });
                        }
                        None => report.failures.push(ReconcileError::TierApply {
                            network_id: op.network_id().to_string(),
                            reason,
                        }),
                    }
                }
            }
        }

        // Desired items that were already live still need their records
        // pointed at this router.
        let pushed: Vec<&str> = ops
            .iter()
            .filter(|op| op.is_add())
            .filter_map(|op| op.rule_id())
            .collect();
        for (_, rules) in &tiers {
            for rule in rules {
                let in_desired = desired.nat.iter().any(|n| n.rule_id == rule.id)
                    || desired.acl.iter().any(|a| a.rule_id == rule.id);
                let up_to_date = rule.status == RuleStatus::Applied
                    && rule.applied_router.as_deref() == Some(router.id.as_str());
                if in_desired && !up_to_date && !pushed.contains(&rule.id.as_str()) {
                    state.mark_applied(&rule.id, &router.id)?;
                }
            }
        }

        self.update_network_status(&tiers, &mut report)?;

        if ops.is_empty() {
            debug!(%vpc_id, router_id = %router.id, "router already converged");
        } else {
            info!(
                %vpc_id,
                router_id = %router.id,
                operations = report.operations,
                attached = report.attached.len(),
                applied = report.applied.len(),
                removed = report.removed,
                failures = report.failures.len(),
                "resync complete"
            );
        }
        Ok(report)
    }

    /// Recompute `pending_failures` and `status` for every tier.
    fn update_network_status(
        &self,
        tiers: &[(Network, Vec<RuleRecord>)],
        report: &mut ResyncReport,
    ) -> ReconcileResult<()> {
        let state = &self.inner.state;
        let threshold = self.inner.config.degraded_threshold;
        for (network, _) in tiers {
            let pending_failures: u32 = state
                .list_rules(&network.id)?
                .iter()
                .filter(|r| r.status == RuleStatus::Pending)
                .map(|r| r.failures)
                .sum();
            let status = if pending_failures > threshold {
                NetworkStatus::Degraded
            } else if pending_failures == 0 {
                NetworkStatus::Ready
            } else {
                network.status
            };

            if status == NetworkStatus::Degraded {
                report.degraded_networks.push(network.id.clone());
            }
            if status == network.status && pending_failures == network.pending_failures {
                continue;
            }
            if status != network.status {
                match status {
                    NetworkStatus::Degraded => warn!(
                        network_id = %network.id,
                        pending_failures,
                        threshold,
                        "network degraded"
                    ),
                    NetworkStatus::Ready => info!(network_id = %network.id, "network recovered"),
                }
            }
            state.update_network(&network.id, |n| {
                n.pending_failures = pending_failures;
                n.status = status;
            })?;
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        call: &str,
        fut: impl Future<Output = T>,
    ) -> ReconcileResult<T> {
        let timeout = self.inner.config.push_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| ReconcileError::Timeout(format!("{call} after {timeout:?}")))
    }
}
