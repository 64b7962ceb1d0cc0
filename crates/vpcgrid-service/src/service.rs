//! The network service: what a tenant (or the REST API) calls.
//!
//! Mutations land in the state store first. Rule changes then ask the
//! reconciler for a resync of the owning VPC and hand the caller the
//! completion token, so a caller can wait for the router to catch up
//! instead of sleeping.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use vpcgrid_agent::{IpPool, RouterAgent};
use vpcgrid_core::VpcGridConfig;
use vpcgrid_core::cidr::{TierCidr, parse_cidr};
use vpcgrid_lifecycle::{LifecycleError, LifecycleManager, RouterReady};
use vpcgrid_reconcile::{CompletionToken, Reconciler};
use vpcgrid_state::NetworkService as Capability;
use vpcgrid_state::*;

use crate::error::{ServiceError, ServiceResult};

const ROUTER_POLL: Duration = Duration::from_millis(25);

/// The result of a mutation plus the resync that will carry it to the
/// router.
pub struct Submitted<T> {
    pub value: T,
    pub completion: CompletionToken,
}

/// A VM placed in a tier, and the router serving its VPC.
#[derive(Debug, Clone, Serialize)]
pub struct DeployedVm {
    pub vm: Vm,
    pub router: Router,
}

/// Facade over the store, the lifecycle manager, and the reconciler.
/// Cheap to clone.
#[derive(Clone)]
pub struct NetworkService {
    state: StateStore,
    lifecycle: LifecycleManager,
    pool: Arc<dyn IpPool>,
    /// Longest a caller is kept waiting for a router to come up.
    router_wait: Duration,
    /// Serializes tier placement so two tiers cannot claim overlapping
    /// blocks.
    placement: Arc<tokio::sync::Mutex<()>>,
}

impl NetworkService {
    pub fn new(
        state: StateStore,
        lifecycle: LifecycleManager,
        pool: Arc<dyn IpPool>,
        config: &VpcGridConfig,
    ) -> Self {
        let lifecycle_cfg = &config.lifecycle;
        let router_wait = lifecycle_cfg.provision_timeout() * lifecycle_cfg.max_provision_attempts.max(1)
            + lifecycle_cfg.recreate_grace();
        Self {
            state,
            lifecycle,
            pool,
            router_wait,
            placement: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Wire up a reconciler and lifecycle manager around `agent`.
    pub fn assemble(
        state: StateStore,
        agent: Arc<dyn RouterAgent>,
        pool: Arc<dyn IpPool>,
        config: &VpcGridConfig,
    ) -> Self {
        let reconciler = Reconciler::new(state.clone(), agent.clone(), config.reconcile.clone());
        let lifecycle = LifecycleManager::new(state.clone(), agent, pool.clone(), reconciler, config);
        Self::new(state, lifecycle, pool, config)
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn reconciler(&self) -> &Reconciler {
        self.lifecycle.reconciler()
    }

    // ── VPCs and tiers ─────────────────────────────────────────────

    pub fn create_vpc(&self, name: &str, zone_id: &str, cidr: &str) -> ServiceResult<Vpc> {
        parse_cidr(cidr)?;
        if !self.pool.has_zone(zone_id) {
            return Err(ServiceError::InvalidRequest(format!("unknown zone {zone_id}")));
        }
        let vpc = Vpc {
            id: self.state.next_id("vpc")?,
            name: name.to_string(),
            zone_id: zone_id.to_string(),
            cidr: cidr.trim().to_string(),
            router_lost_at: None,
            failed_creates: 0,
            created_at: epoch_millis(),
        };
        self.state.put_vpc(&vpc)?;
        info!(vpc_id = %vpc.id, cidr = %vpc.cidr, %zone_id, "vpc created");
        Ok(vpc)
    }

    pub fn get_vpc(&self, vpc_id: &str) -> ServiceResult<Vpc> {
        self.state
            .get_vpc(vpc_id)?
            .ok_or_else(|| ServiceError::not_found("vpc", vpc_id))
    }

    pub fn list_vpcs(&self) -> ServiceResult<Vec<Vpc>> {
        Ok(self.state.list_vpcs()?)
    }

    /// Create a tier from its gateway and netmask. The derived block must
    /// sit inside the VPC CIDR and overlap no other tier. The completion
    /// resolves once a running router has an interface on the tier.
    pub async fn create_network(
        &self,
        vpc_id: &str,
        name: &str,
        gateway: &str,
        netmask: &str,
        offering: NetworkOffering,
    ) -> ServiceResult<Submitted<Network>> {
        let vpc = self.get_vpc(vpc_id)?;
        let tier = TierCidr::from_gateway(gateway, netmask)?;

        let _placement = self.placement.lock().await;
        let existing: Vec<String> = self
            .state
            .list_networks_for_vpc(vpc_id)?
            .into_iter()
            .map(|n| n.cidr)
            .collect();
        tier.validate_placement(&vpc.cidr, &existing)?;

        let network = Network {
            id: self.state.next_id("network")?,
            vpc_id: vpc_id.to_string(),
            name: name.to_string(),
            cidr: tier.network.to_string(),
            gateway: tier.gateway,
            offering,
            vm_ids: vec![],
            status: NetworkStatus::Ready,
            pending_failures: 0,
            created_at: epoch_millis(),
        };
        self.state.put_network(&network)?;
        info!(
            %vpc_id,
            network_id = %network.id,
            cidr = %network.cidr,
            offering = %network.offering.name,
            "network created"
        );
        Ok(Submitted {
            value: network,
            completion: self.reconciler().request(vpc_id),
        })
    }

    pub fn get_network(&self, network_id: &str) -> ServiceResult<Network> {
        self.state
            .get_network(network_id)?
            .ok_or_else(|| ServiceError::not_found("network", network_id))
    }

    pub fn list_networks(&self, vpc_id: &str) -> ServiceResult<Vec<Network>> {
        self.get_vpc(vpc_id)?;
        Ok(self.state.list_networks_for_vpc(vpc_id)?)
    }

    /// Delete a tier with its VMs, rules, and associated public IPs, then
    /// resync so the router drops its config.
    pub fn delete_network(&self, network_id: &str) -> ServiceResult<Submitted<()>> {
        let network = self.get_network(network_id)?;
        let addresses: Vec<PublicIpRecord> = self
            .state
            .list_public_ips_for_vpc(&network.vpc_id)?
            .into_iter()
            .filter(|record| record.network_id.as_deref() == Some(network_id))
            .collect();
        self.state.delete_network(network_id)?;
        for record in &addresses {
            self.free_public_ip(record)?;
        }
        info!(%network_id, vpc_id = %network.vpc_id, "network deleted");
        Ok(Submitted {
            value: (),
            completion: self.reconciler().request(&network.vpc_id),
        })
    }

    // ── VMs ────────────────────────────────────────────────────────

    /// Place a VM in a tier. The VPC gets a router if it has none, and a
    /// stopped router is started.
    pub async fn deploy_vm(&self, network_id: &str, name: &str) -> ServiceResult<DeployedVm> {
        let network = self.get_network(network_id)?;
        let vm = {
            let _placement = self.placement.lock().await;
            let tier = TierCidr {
                network: parse_cidr(&network.cidr)?,
                gateway: network.gateway,
            };
            let taken: Vec<Ipv4Addr> = self
                .state
                .list_vms_for_network(network_id)?
                .iter()
                .map(|vm| vm.private_ip)
                .collect();
            let vm = Vm {
                id: self.state.next_id("vm")?,
                network_id: network_id.to_string(),
                name: name.to_string(),
                private_ip: tier.next_free_host(&taken)?,
                created_at: epoch_millis(),
            };
            self.state.put_vm(&vm)?;
            self.state.update_network(network_id, |n| n.vm_ids.push(vm.id.clone()))?;
            vm
        };
        info!(vm_id = %vm.id, %network_id, private_ip = %vm.private_ip, "vm deployed");

        let router = self.ensure_router(&network.vpc_id).await?;
        Ok(DeployedVm { vm, router })
    }

    pub fn list_vms(&self, network_id: &str) -> ServiceResult<Vec<Vm>> {
        self.get_network(network_id)?;
        Ok(self.state.list_vms_for_network(network_id)?)
    }

    async fn ensure_router(&self, vpc_id: &str) -> ServiceResult<Router> {
        match self.state.active_router_for_vpc(vpc_id)? {
            Some(router) if router.state == RouterState::Running => Ok(router),
            Some(router) if matches!(router.state, RouterState::Stopped | RouterState::Stopping) => {
                debug!(%vpc_id, router_id = %router.id, "starting stopped router");
                Ok(self.lifecycle.start(&router.id).await?.router)
            }
            Some(_) => self.wait_for_running_router(vpc_id, self.router_wait).await,
            None => match self.lifecycle.create(vpc_id).await {
                Ok(ready) => Ok(ready.router),
                // Someone else (the supervisor, usually) got there first.
                Err(LifecycleError::InvalidTransition { .. }) => {
                    self.wait_for_running_router(vpc_id, self.router_wait).await
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    // ── Public IPs ─────────────────────────────────────────────────

    /// Allocate a public IP from the VPC's zone and associate it with a tier.
    pub fn acquire_public_ip(&self, network_id: &str) -> ServiceResult<PublicIpRecord> {
        let network = self.get_network(network_id)?;
        let vpc = self.get_vpc(&network.vpc_id)?;
        let address = self.pool.allocate(&vpc.zone_id, network_id)?;
        let record = PublicIpRecord {
            address,
            zone_id: vpc.zone_id.clone(),
            vpc_id: vpc.id.clone(),
            network_id: Some(network_id.to_string()),
            source_nat: false,
            allocated_at: epoch_millis(),
        };
        if let Err(e) = self.state.put_public_ip(&record) {
            let _ = self.pool.release(&vpc.zone_id, address);
            return Err(e.into());
        }
        info!(%address, %network_id, vpc_id = %vpc.id, "public IP acquired");
        Ok(record)
    }

    /// Return a tier's public IP to the pool. Refused while NAT rules still
    /// use it; a router's source NAT address is released by the router.
    pub fn release_public_ip(&self, address: Ipv4Addr) -> ServiceResult<()> {
        let record = self
            .state
            .get_public_ip(&address.to_string())?
            .ok_or_else(|| ServiceError::not_found("public ip", address.to_string()))?;
        if record.source_nat {
            return Err(ServiceError::InvalidRequest(format!(
                "{address} is a router source NAT address"
            )));
        }
        self.free_public_ip(&record)?;
        info!(%address, "public IP released");
        Ok(())
    }

    pub fn list_public_ips(&self, vpc_id: &str) -> ServiceResult<Vec<PublicIpRecord>> {
        self.get_vpc(vpc_id)?;
        Ok(self.state.list_public_ips_for_vpc(vpc_id)?)
    }

    fn free_public_ip(&self, record: &PublicIpRecord) -> ServiceResult<()> {
        let key = record.address.to_string();
        let rules = self.state.nat_rules_for_ip(&key)?;
        if !rules.is_empty() {
            return Err(ServiceError::IpInUse {
                address: record.address,
                rules: rules.len(),
            });
        }
        self.pool.release(&record.zone_id, record.address)?;
        self.state.delete_public_ip(&key)?;
        Ok(())
    }

    // ── Rules ──────────────────────────────────────────────────────

    /// Add a port-forwarding rule to a tier.
    ///
    /// The public IP must belong to the tier's VPC and the private IP to a
    /// VM of the tier. Fails with [`ServiceError::DuplicateRule`] when the
    /// public (ip, port, protocol) tuple is taken anywhere.
    pub fn add_nat_rule(&self, network_id: &str, rule: NatRule) -> ServiceResult<Submitted<RuleId>> {
        let network = self.supporting(network_id, Capability::PortForwarding)?;

        let ip = self
            .state
            .get_public_ip(&rule.public_ip.to_string())?
            .ok_or_else(|| ServiceError::not_found("public ip", rule.public_ip.to_string()))?;
        if ip.vpc_id != network.vpc_id {
            return Err(ServiceError::InvalidRequest(format!(
                "{} belongs to vpc {}, not {}",
                rule.public_ip, ip.vpc_id, network.vpc_id
            )));
        }
        if let Some(owner) = ip.network_id.as_deref().filter(|owner| *owner != network_id) {
            return Err(ServiceError::InvalidRequest(format!(
                "{} is associated with network {owner}",
                rule.public_ip
            )));
        }
        let vms = self.state.list_vms_for_network(network_id)?;
        if !vms.iter().any(|vm| vm.private_ip == rule.private_ip) {
            return Err(ServiceError::InvalidRequest(format!(
                "no VM with address {} in network {network_id}",
                rule.private_ip
            )));
        }
        if rule.public_port == 0 || rule.private_port == 0 {
            return Err(ServiceError::InvalidRequest("ports must be non-zero".to_string()));
        }

        let rule_id = self.state.upsert_rule(network_id, None, RuleSpec::Nat(rule))?;
        info!(%rule_id, %network_id, "nat rule added");
        Ok(Submitted {
            value: rule_id,
            completion: self.reconciler().request(&network.vpc_id),
        })
    }

    /// Append an entry to a tier's ACL.
    pub fn add_acl_entry(&self, network_id: &str, entry: AclEntry) -> ServiceResult<Submitted<RuleId>> {
        let network = self.supporting(network_id, Capability::NetworkAcl)?;
        parse_cidr(&entry.cidr)?;
        if entry.start_port > entry.end_port {
            return Err(ServiceError::InvalidRequest(format!(
                "port range {}-{} is reversed",
                entry.start_port, entry.end_port
            )));
        }

        let rule_id = self.state.upsert_rule(network_id, None, RuleSpec::Acl(entry))?;
        info!(%rule_id, %network_id, "acl entry added");
        Ok(Submitted {
            value: rule_id,
            completion: self.reconciler().request(&network.vpc_id),
        })
    }

    /// Delete a NAT rule or ACL entry.
    pub fn remove_rule(&self, rule_id: &str) -> ServiceResult<Submitted<RuleRecord>> {
        let removed = self
            .state
            .remove_rule(rule_id)?
            .ok_or_else(|| ServiceError::not_found("rule", rule_id))?;
        let network = self.get_network(&removed.network_id)?;
        info!(%rule_id, network_id = %network.id, "rule removed");
        Ok(Submitted {
            value: removed,
            completion: self.reconciler().request(&network.vpc_id),
        })
    }

    pub fn list_rules(&self, network_id: &str) -> ServiceResult<Vec<RuleRecord>> {
        self.get_network(network_id)?;
        Ok(self.state.list_rules(network_id)?)
    }

    /// Ask for a resync of the VPC without changing anything.
    pub fn resync(&self, vpc_id: &str) -> ServiceResult<CompletionToken> {
        self.get_vpc(vpc_id)?;
        Ok(self.reconciler().request(vpc_id))
    }

    fn supporting(&self, network_id: &str, service: Capability) -> ServiceResult<Network> {
        let network = self.get_network(network_id)?;
        if !network.offering.supports(service) {
            return Err(ServiceError::ServiceNotSupported {
                network_id: network_id.to_string(),
                service,
            });
        }
        Ok(network)
    }

    // ── Routers ────────────────────────────────────────────────────

    /// Stop a router. Rules stay in the store; the completion resolves
    /// once a running router for the VPC has them again.
    pub async fn stop_router(&self, router_id: &str) -> ServiceResult<Submitted<Router>> {
        let router = self.lifecycle.stop(router_id).await?;
        Ok(Submitted {
            completion: self.reconciler().next_router_pass(&router.vpc_id),
            value: router,
        })
    }

    pub async fn start_router(&self, router_id: &str) -> ServiceResult<RouterReady> {
        Ok(self.lifecycle.start(router_id).await?)
    }

    /// Destroy a router. Rules stay in the store and are replayed onto the
    /// replacement; the completion resolves when that replay finishes.
    pub async fn destroy_router(&self, router_id: &str) -> ServiceResult<Submitted<Router>> {
        let router = self.lifecycle.destroy(router_id).await?;
        Ok(Submitted {
            completion: self.reconciler().next_router_pass(&router.vpc_id),
            value: router,
        })
    }

    pub fn list_routers(&self, vpc_id: &str) -> ServiceResult<Vec<Router>> {
        self.get_vpc(vpc_id)?;
        Ok(self.lifecycle.list_routers(vpc_id)?)
    }

    /// Poll until the VPC has a Running router.
    pub async fn wait_for_running_router(
        &self,
        vpc_id: &str,
        timeout: Duration,
    ) -> ServiceResult<Router> {
        self.get_vpc(vpc_id)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(router) = self.state.active_router_for_vpc(vpc_id)? {
                if router.state == RouterState::Running {
                    return Ok(router);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ServiceError::Timeout(format!("a running router in {vpc_id}")));
            }
            tokio::time::sleep(ROUTER_POLL).await;
        }
    }
}
