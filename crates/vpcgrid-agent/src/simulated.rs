//! In-memory router agent with fault injection.
//!
//! Each booted instance holds its own [`RouterConfig`], starting with the
//! tiers named at boot. NAT entries and ACL items are refused for tiers the
//! instance has no interface on. Terminating an instance discards its
//! config, so a replacement router must be rebuilt by reconciliation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use vpcgrid_state::RouterId;

use crate::agent::*;

struct Instance {
    router_id: RouterId,
    config: RouterConfig,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    instances: HashMap<AgentHandle, Instance>,
    boot_failures: u32,
    boot_delay: Duration,
    rejected_rules: HashSet<String>,
    unhealthy_routers: HashSet<RouterId>,
    push_count: u64,
    boot_count: u64,
}

/// A [`RouterAgent`] that keeps routers in memory.
#[derive(Default)]
pub struct SimulatedAgent {
    state: Mutex<SimState>,
}

impl SimulatedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    // ── Fault injection ────────────────────────────────────────────

    /// Make the next `n` boots fail.
    pub fn fail_next_boots(&self, n: u32) {
        self.with_state(|s| s.boot_failures = n);
    }

    /// Delay every boot by `delay`.
    pub fn set_boot_delay(&self, delay: Duration) {
        self.with_state(|s| s.boot_delay = delay);
    }

    /// Reject every push that touches `rule_id`.
    pub fn reject_rule(&self, rule_id: &str) {
        self.with_state(|s| s.rejected_rules.insert(rule_id.to_string()));
    }

    pub fn accept_all_rules(&self) {
        self.with_state(|s| s.rejected_rules.clear());
    }

    /// Force health checks of a router's instances to fail (or recover).
    pub fn set_router_healthy(&self, router_id: &str, healthy: bool) {
        self.with_state(|s| {
            if healthy {
                s.unhealthy_routers.remove(router_id);
            } else {
                s.unhealthy_routers.insert(router_id.to_string());
            }
        });
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Config operations pushed so far, across all instances.
    pub fn push_count(&self) -> u64 {
        self.with_state(|s| s.push_count)
    }

    pub fn boot_count(&self) -> u64 {
        self.with_state(|s| s.boot_count)
    }

    /// Live config of the instance currently serving `router_id`.
    pub fn config_for_router(&self, router_id: &str) -> Option<RouterConfig> {
        self.with_state(|s| {
            s.instances
                .values()
                .find(|i| i.router_id == router_id)
                .map(|i| i.config.clone())
        })
    }

    pub fn instance_count(&self) -> usize {
        self.with_state(|s| s.instances.len())
    }
}

#[async_trait]
impl RouterAgent for SimulatedAgent {
    async fn boot(&self, spec: &RouterSpec) -> AgentResult<AgentHandle> {
        let (fail, delay) = self.with_state(|s| {
            s.boot_count += 1;
            if s.boot_failures > 0 {
                s.boot_failures -= 1;
                (true, s.boot_delay)
            } else {
                (false, s.boot_delay)
            }
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            debug!(router_id = %spec.router_id, "simulated boot failure");
            return Err(AgentError::BootFailed(format!(
                "injected failure for {}",
                spec.router_id
            )));
        }

        let handle = self.with_state(|s| {
            s.next_handle += 1;
            let handle = AgentHandle(format!("sim-{}", s.next_handle));
            let mut tiers = spec.tiers.clone();
            tiers.sort_by(|a, b| a.network_id.cmp(&b.network_id));
            s.instances.insert(
                handle.clone(),
                Instance {
                    router_id: spec.router_id.clone(),
                    config: RouterConfig {
                        tiers,
                        ..Default::default()
                    },
                },
            );
            handle
        });
        debug!(router_id = %spec.router_id, %handle, tiers = spec.tiers.len(), "simulated router booted");
        Ok(handle)
    }

    async fn push_config(&self, handle: &AgentHandle, op: &ConfigOp) -> AgentResult<()> {
        self.with_state(|s| {
            s.push_count += 1;
            if op.rule_id().is_some_and(|id| s.rejected_rules.contains(id)) {
                return Err(AgentError::Rejected {
                    op: op.to_string(),
                    reason: "injected rejection".to_string(),
                });
            }
            let instance = s
                .instances
                .get_mut(handle)
                .ok_or_else(|| AgentError::UnknownHandle(handle.to_string()))?;
            let config = &mut instance.config;
            if matches!(op, ConfigOp::AddNat(_) | ConfigOp::AddAcl(_))
                && !config.has_tier(op.network_id())
            {
                return Err(AgentError::Rejected {
                    op: op.to_string(),
                    reason: format!("no interface on tier {}", op.network_id()),
                });
            }
            match op {
                ConfigOp::AttachTier(tier) => {
                    if !config.tiers.contains(tier) {
                        config.tiers.push(tier.clone());
                        config.tiers.sort_by(|a, b| a.network_id.cmp(&b.network_id));
                    }
                }
                ConfigOp::DetachTier(tier) => {
                    config.tiers.retain(|t| t != tier);
                    config.nat.retain(|n| n.network_id != tier.network_id);
                    config.acl.retain(|a| a.network_id != tier.network_id);
                }
                ConfigOp::AddNat(item) => {
                    if !config.nat.contains(item) {
                        config.nat.push(item.clone());
                    }
                }
                ConfigOp::RemoveNat(item) => config.nat.retain(|n| n != item),
                ConfigOp::AddAcl(item) => {
                    if !config.acl.contains(item) {
                        config.acl.push(item.clone());
                    }
                }
                ConfigOp::RemoveAcl(item) => config.acl.retain(|a| a != item),
            }
            Ok(())
        })
    }

    async fn live_config(&self, handle: &AgentHandle) -> AgentResult<RouterConfig> {
        self.with_state(|s| {
            s.instances
                .get(handle)
                .map(|i| i.config.clone())
                .ok_or_else(|| AgentError::UnknownHandle(handle.to_string()))
        })
    }

    async fn health_check(&self, handle: &AgentHandle) -> AgentResult<bool> {
        self.with_state(|s| {
            let instance = s
                .instances
                .get(handle)
                .ok_or_else(|| AgentError::UnknownHandle(handle.to_string()))?;
            Ok(!s.unhealthy_routers.contains(&instance.router_id))
        })
    }

    async fn terminate(&self, handle: &AgentHandle) -> AgentResult<()> {
        self.with_state(|s| {
            s.instances
                .remove(handle)
                .map(|i| debug!(router_id = %i.router_id, %handle, "simulated router terminated"))
                .ok_or_else(|| AgentError::UnknownHandle(handle.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use vpcgrid_state::{NatRule, Protocol};

    use super::*;

    fn tier(network_id: &str, third_octet: u8) -> TierSpec {
        TierSpec {
            network_id: network_id.to_string(),
            cidr: format!("10.1.{third_octet}.0/24"),
            gateway: Ipv4Addr::new(10, 1, third_octet, 1),
        }
    }

    fn spec(router_id: &str) -> RouterSpec {
        RouterSpec {
            router_id: router_id.to_string(),
            vpc_id: "vpc-1".to_string(),
            public_ip: Ipv4Addr::new(192, 0, 2, 1),
            tiers: vec![tier("network-1", 1)],
        }
    }

    fn nat_item(rule_id: &str) -> NatItem {
        nat_item_on("network-1", rule_id)
    }

    fn nat_item_on(network_id: &str, rule_id: &str) -> NatItem {
        NatItem {
            network_id: network_id.to_string(),
            rule_id: rule_id.to_string(),
            rule: NatRule {
                public_ip: Ipv4Addr::new(192, 0, 2, 1),
                public_port: 22,
                private_ip: Ipv4Addr::new(10, 1, 1, 2),
                private_port: 22,
                protocol: Protocol::Tcp,
            },
        }
    }

    #[tokio::test]
    async fn boot_push_and_read_back() {
        let agent = SimulatedAgent::new();
        let handle = agent.boot(&spec("router-1")).await.unwrap();

        agent
            .push_config(&handle, &ConfigOp::AddNat(nat_item("r1")))
            .await
            .unwrap();
        // Re-adding the same item is a no-op on the router.
        agent
            .push_config(&handle, &ConfigOp::AddNat(nat_item("r1")))
            .await
            .unwrap();

        let live = agent.live_config(&handle).await.unwrap();
        assert_eq!(live.nat, vec![nat_item("r1")]);
        assert_eq!(agent.push_count(), 2);
        assert!(agent.health_check(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn rules_need_an_attached_tier() {
        let agent = SimulatedAgent::new();
        let handle = agent.boot(&spec("router-1")).await.unwrap();
        assert_eq!(agent.live_config(&handle).await.unwrap().tiers, vec![tier("network-1", 1)]);

        let err = agent
            .push_config(&handle, &ConfigOp::AddNat(nat_item_on("network-2", "r2")))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Rejected { .. }));

        agent
            .push_config(&handle, &ConfigOp::AttachTier(tier("network-2", 2)))
            .await
            .unwrap();
        agent
            .push_config(&handle, &ConfigOp::AddNat(nat_item_on("network-2", "r2")))
            .await
            .unwrap();

        agent
            .push_config(&handle, &ConfigOp::DetachTier(tier("network-2", 2)))
            .await
            .unwrap();
        let live = agent.live_config(&handle).await.unwrap();
        assert_eq!(live.tiers, vec![tier("network-1", 1)]);
        assert!(live.has_no_rules());
    }

    #[tokio::test]
    async fn terminate_discards_config() {
        let agent = SimulatedAgent::new();
        let handle = agent.boot(&spec("router-1")).await.unwrap();
        agent
            .push_config(&handle, &ConfigOp::AddNat(nat_item("r1")))
            .await
            .unwrap();

        agent.terminate(&handle).await.unwrap();
        assert_eq!(agent.instance_count(), 0);
        assert!(matches!(
            agent.live_config(&handle).await,
            Err(AgentError::UnknownHandle(_))
        ));
        assert!(agent.terminate(&handle).await.is_err());
    }

    #[tokio::test]
    async fn injected_boot_failures_are_consumed() {
        let agent = SimulatedAgent::new();
        agent.fail_next_boots(1);

        assert!(matches!(
            agent.boot(&spec("router-1")).await,
            Err(AgentError::BootFailed(_))
        ));
        agent.boot(&spec("router-1")).await.unwrap();
        assert_eq!(agent.boot_count(), 2);
    }

    #[tokio::test]
    async fn rejected_rules_fail_pushes() {
        let agent = SimulatedAgent::new();
        let handle = agent.boot(&spec("router-1")).await.unwrap();
        agent.reject_rule("r1");

        let err = agent
            .push_config(&handle, &ConfigOp::AddNat(nat_item("r1")))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Rejected { .. }));

        agent.accept_all_rules();
        agent
            .push_config(&handle, &ConfigOp::AddNat(nat_item("r1")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn forced_unhealthy_router() {
        let agent = SimulatedAgent::new();
        let handle = agent.boot(&spec("router-1")).await.unwrap();

        agent.set_router_healthy("router-1", false);
        assert!(!agent.health_check(&handle).await.unwrap());

        agent.set_router_healthy("router-1", true);
        assert!(agent.health_check(&handle).await.unwrap());
    }
}
