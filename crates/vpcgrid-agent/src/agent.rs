//! Router agent trait and the configuration vocabulary it speaks.

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vpcgrid_state::{AclEntry, NatRule, NetworkId, RouterId, RuleId, VpcId};

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    #[error("router rejected {op}: {reason}")]
    Rejected { op: String, reason: String },

    #[error("unknown agent handle {0}")]
    UnknownHandle(String),

    #[error("boot failed: {0}")]
    BootFailed(String),
}

/// Opaque reference to one booted router instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentHandle(pub String);

impl fmt::Display for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tier the router must attach a gateway interface to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub network_id: NetworkId,
    pub cidr: String,
    pub gateway: Ipv4Addr,
}

/// Everything needed to boot a router instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSpec {
    pub router_id: RouterId,
    pub vpc_id: VpcId,
    pub public_ip: Ipv4Addr,
    pub tiers: Vec<TierSpec>,
}

/// A port-forwarding entry as programmed on a router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NatItem {
    pub network_id: NetworkId,
    pub rule_id: RuleId,
    pub rule: NatRule,
}

/// An ACL entry as programmed on a router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AclItem {
    pub network_id: NetworkId,
    pub rule_id: RuleId,
    pub entry: AclEntry,
}

/// Router configuration: attached tiers and NAT entries are sets, ACL
/// items are evaluated in list order per network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub tiers: Vec<TierSpec>,
    pub nat: Vec<NatItem>,
    pub acl: Vec<AclItem>,
}

impl RouterConfig {
    /// ACL items of one network in evaluation order.
    pub fn acl_for<'a>(&'a self, network_id: &'a str) -> impl Iterator<Item = &'a AclItem> + 'a {
        self.acl.iter().filter(move |item| item.network_id == network_id)
    }

    pub fn has_tier(&self, network_id: &str) -> bool {
        self.tiers.iter().any(|t| t.network_id == network_id)
    }

    /// No NAT entries and no ACL items, whatever tiers are attached.
    pub fn has_no_rules(&self) -> bool {
        self.nat.is_empty() && self.acl.is_empty()
    }
}

/// One incremental configuration change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigOp {
    AttachTier(TierSpec),
    DetachTier(TierSpec),
    AddNat(NatItem),
    RemoveNat(NatItem),
    AddAcl(AclItem),
    RemoveAcl(AclItem),
}

impl ConfigOp {
    /// The rule this operation programs; `None` for tier operations.
    pub fn rule_id(&self) -> Option<&str> {
        match self {
            ConfigOp::AttachTier(_) | ConfigOp::DetachTier(_) => None,
            ConfigOp::AddNat(item) | ConfigOp::RemoveNat(item) => Some(&item.rule_id),
            ConfigOp::AddAcl(item) | ConfigOp::RemoveAcl(item) => Some(&item.rule_id),
        }
    }

    pub fn network_id(&self) -> &str {
        match self {
            ConfigOp::AttachTier(tier) | ConfigOp::DetachTier(tier) => &tier.network_id,
            ConfigOp::AddNat(item) | ConfigOp::RemoveNat(item) => &item.network_id,
            ConfigOp::AddAcl(item) | ConfigOp::RemoveAcl(item) => &item.network_id,
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(
            self,
            ConfigOp::AttachTier(_) | ConfigOp::AddNat(_) | ConfigOp::AddAcl(_)
        )
    }
}

impl fmt::Display for ConfigOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigOp::AttachTier(tier) => write!(f, "attach-tier {}", tier.network_id),
            ConfigOp::DetachTier(tier) => write!(f, "detach-tier {}", tier.network_id),
            ConfigOp::AddNat(item) => write!(f, "add-nat {}", item.rule_id),
            ConfigOp::RemoveNat(item) => write!(f, "remove-nat {}", item.rule_id),
            ConfigOp::AddAcl(item) => write!(f, "add-acl {}", item.rule_id),
            ConfigOp::RemoveAcl(item) => write!(f, "remove-acl {}", item.rule_id),
        }
    }
}

/// Drives router instances on the hypervisor.
///
/// Implementations must be safe to call concurrently for different
/// handles. Callers bound every call with their own timeout.
#[async_trait]
pub trait RouterAgent: Send + Sync {
    async fn boot(&self, spec: &RouterSpec) -> AgentResult<AgentHandle>;

    async fn push_config(&self, handle: &AgentHandle, op: &ConfigOp) -> AgentResult<()>;

    async fn live_config(&self, handle: &AgentHandle) -> AgentResult<RouterConfig>;

    async fn health_check(&self, handle: &AgentHandle) -> AgentResult<bool>;

    async fn terminate(&self, handle: &AgentHandle) -> AgentResult<()>;
}
