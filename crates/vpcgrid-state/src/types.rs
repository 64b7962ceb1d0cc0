//! Domain types for the vpcgrid state store.
//!
//! These types represent the persisted state of VPCs, tiers, VMs, routers,
//! public IPs, and rules. All types are serializable to/from JSON for
//! storage in redb tables.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

pub type VpcId = String;
pub type NetworkId = String;
pub type VmId = String;
pub type RouterId = String;
pub type ZoneId = String;

/// Rule id; doubles as the `{network_id}:{seq}` table key.
pub type RuleId = String;

// ── VPC ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vpc {
    pub id: VpcId,
    pub name: String,
    pub zone_id: ZoneId,
    /// Super-CIDR all tiers must fall within, as given by the caller.
    pub cidr: String,
    /// When the VPC last lost its active router.
    /// Cleared once a replacement is provisioned.
    pub router_lost_at: Option<u64>,
    /// Creates in a row that ran out of boot attempts. Reset once a router
    /// reaches `Running`.
    #[serde(default)]
    pub failed_creates: u32,
    pub created_at: u64,
}

// ── Network offerings ─────────────────────────────────────────────

/// A service a tier can be offered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkService {
    Vpn,
    Dhcp,
    Dns,
    SourceNat,
    PortForwarding,
    Lb,
    UserData,
    StaticNat,
    NetworkAcl,
}

/// Named capability set a tier is created with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkOffering {
    pub name: String,
    pub services: BTreeSet<NetworkService>,
}

impl NetworkOffering {
    /// Every VPC tier service, load balancing included.
    pub fn default_vpc() -> Self {
        use NetworkService::*;
        Self {
            name: "default".to_string(),
            services: [Vpn, Dhcp, Dns, SourceNat, PortForwarding, Lb, UserData, StaticNat, NetworkAcl]
                .into_iter()
                .collect(),
        }
    }

    /// Same as [`default_vpc`](Self::default_vpc) without load balancing or VPN.
    pub fn no_lb() -> Self {
        use NetworkService::*;
        Self {
            name: "no_lb".to_string(),
            services: [Dhcp, Dns, SourceNat, PortForwarding, UserData, StaticNat, NetworkAcl]
                .into_iter()
                .collect(),
        }
    }

    pub fn supports(&self, service: NetworkService) -> bool {
        self.services.contains(&service)
    }
}

// ── Network ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Network {
    pub id: NetworkId,
    pub vpc_id: VpcId,
    pub name: String,
    /// Normalized tier CIDR, e.g. `10.1.1.0/24`.
    pub cidr: String,
    pub gateway: Ipv4Addr,
    pub offering: NetworkOffering,
    pub vm_ids: Vec<VmId>,
    pub status: NetworkStatus,
    /// Rules on this tier whose last push failed.
    pub pending_failures: u32,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Ready,
    /// Too many rules failed to apply; the rest are still served.
    Degraded,
}

// ── VM ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vm {
    pub id: VmId,
    pub network_id: NetworkId,
    pub name: String,
    pub private_ip: Ipv4Addr,
    pub created_at: u64,
}

impl Vm {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.network_id, self.id)
    }
}

// ── Router ────────────────────────────────────────────────────────

/// Router lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    Failed,
}

impl RouterState {
    /// Whether a router in this state counts as the VPC's router.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RouterState::Provisioning
                | RouterState::Running
                | RouterState::Stopping
                | RouterState::Stopped
        )
    }
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouterState::Provisioning => "provisioning",
            RouterState::Running => "running",
            RouterState::Stopping => "stopping",
            RouterState::Stopped => "stopped",
            RouterState::Destroying => "destroying",
            RouterState::Destroyed => "destroyed",
            RouterState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Router {
    pub id: RouterId,
    pub vpc_id: VpcId,
    pub state: RouterState,
    /// Source NAT address held by the router.
    pub public_ip: Option<Ipv4Addr>,
    /// Handle of the live agent instance, absent unless booted.
    pub agent_handle: Option<String>,
    /// When the last successful health check completed.
    pub last_health_at: Option<u64>,
    pub provision_attempts: u32,
    /// Set when destruction left the public IP referenced by NAT rules.
    pub ip_release_deferred: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Public IP ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicIpRecord {
    pub address: Ipv4Addr,
    pub zone_id: ZoneId,
    pub vpc_id: VpcId,
    /// Tier this address is associated with; `None` for a router's
    /// source NAT address.
    pub network_id: Option<NetworkId>,
    pub source_nat: bool,
    pub allocated_at: u64,
}

// ── Rules ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::All => "all",
        };
        f.write_str(s)
    }
}

/// Port-forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NatRule {
    pub public_ip: Ipv4Addr,
    pub public_port: u16,
    pub private_ip: Ipv4Addr,
    pub private_port: u16,
    pub protocol: Protocol,
}

impl NatRule {
    /// Uniqueness key for the public side of the rule.
    pub fn public_key(&self) -> String {
        format!("{}:{}:{}", self.public_ip, self.public_port, self.protocol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficDirection {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclAction {
    Allow,
    Deny,
}

/// One network ACL entry. Entries are evaluated in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AclEntry {
    pub direction: TrafficDirection,
    pub protocol: Protocol,
    pub start_port: u16,
    pub end_port: u16,
    pub cidr: String,
    pub action: AclAction,
}

/// The desired-state payload of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSpec {
    Nat(NatRule),
    Acl(AclEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Pending,
    Applied,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleRecord {
    pub id: RuleId,
    pub network_id: NetworkId,
    pub spec: RuleSpec,
    pub status: RuleStatus,
    /// Router the rule was last confirmed on.
    pub applied_router: Option<RouterId>,
    /// Consecutive failed pushes.
    pub failures: u32,
    pub created_at: u64,
}

impl RuleRecord {
    pub fn nat(&self) -> Option<&NatRule> {
        match &self.spec {
            RuleSpec::Nat(nat) => Some(nat),
            RuleSpec::Acl(_) => None,
        }
    }

    pub fn acl(&self) -> Option<&AclEntry> {
        match &self.spec {
            RuleSpec::Acl(acl) => Some(acl),
            RuleSpec::Nat(_) => None,
        }
    }
}

/// Build the rule key for a network and sequence number.
pub fn rule_key(network_id: &str, seq: u64) -> String {
    format!("{network_id}:{seq:012}")
}

/// Current unix time in milliseconds. All `*_at` fields use this unit.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
