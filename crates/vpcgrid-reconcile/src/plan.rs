//! Desired-config construction and diffing.
//!
//! Both functions are pure; the reconciler feeds them store and agent
//! state and pushes the resulting operations.

use vpcgrid_agent::{AclItem, ConfigOp, NatItem, RouterConfig, TierSpec};
use vpcgrid_state::{Network, NetworkService, RuleRecord, RuleSpec};

/// Build the configuration a VPC's router should carry.
///
/// Every tier gets an interface. NAT rules are only included for tiers offering port forwarding, ACL
/// entries only for tiers offering network ACLs. Rule order within a tier
/// is preserved.
pub fn desired_config(tiers: &[(Network, Vec<RuleRecord>)]) -> RouterConfig {
    let mut config = RouterConfig::default();
    for (network, rules) in tiers {
        config.tiers.push(TierSpec {
            network_id: network.id.clone(),
            cidr: network.cidr.clone(),
            gateway: network.gateway,
        });
        let nat_allowed = network.offering.supports(NetworkService::PortForwarding);
        let acl_allowed = network.offering.supports(NetworkService::NetworkAcl);
        for rule in rules {
            match &rule.spec {
                RuleSpec::Nat(nat) if nat_allowed => config.nat.push(NatItem {
                    network_id: network.id.clone(),
                    rule_id: rule.id.clone(),
                    rule: nat.clone(),
                }),
                RuleSpec::Acl(entry) if acl_allowed => config.acl.push(AclItem {
                    network_id: network.id.clone(),
                    rule_id: rule.id.clone(),
                    entry: entry.clone(),
                }),
                _ => {}
            }
        }
    }
    config
}

/// Operations that turn `live` into `desired`.
///
/// Order: NAT removals, ACL removals, tier detaches, tier attaches, NAT
/// additions, ACL additions. A tier's rules therefore leave before its
/// interface does and arrive after it. ACL lists are ordered, so per
/// network everything after the longest common prefix is removed (last
/// first) and re-added in desired order. Returns no operations when the
/// two configs already match.
pub fn plan_ops(desired: &RouterConfig, live: &RouterConfig) -> Vec<ConfigOp> {
    let mut removals = Vec::new();
    let mut additions = Vec::new();

    for item in &live.nat {
        if !desired.nat.contains(item) {
            removals.push(ConfigOp::RemoveNat(item.clone()));
        }
    }
    for item in &desired.nat {
        if !live.nat.contains(item) {
            additions.push(ConfigOp::AddNat(item.clone()));
        }
    }

    let mut networks: Vec<&str> = Vec::new();
    for item in desired.acl.iter().chain(live.acl.iter()) {
        if !networks.contains(&item.network_id.as_str()) {
            networks.push(&item.network_id);
        }
    }
    for network_id in networks {
        let want: Vec<&AclItem> = desired.acl_for(network_id).collect();
        let have: Vec<&AclItem> = live.acl_for(network_id).collect();
        let common = want
            .iter()
            .zip(have.iter())
            .take_while(|(w, h)| w == h)
            .count();

        for item in have[common..].iter().rev() {
            removals.push(ConfigOp::RemoveAcl((*item).clone()));
        }
        for item in &want[common..] {
            additions.push(ConfigOp::AddAcl((*item).clone()));
        }
    }

    let mut ops = removals;
    for tier in &live.tiers {
        if !desired.tiers.contains(tier) {
            ops.push(ConfigOp::DetachTier(tier.clone()));
        }
    }
    for tier in &desired.tiers {
        if !live.tiers.contains(tier) {
            ops.push(ConfigOp::AttachTier(tier.clone()));
        }
    }
    ops.extend(additions);
    ops
}
