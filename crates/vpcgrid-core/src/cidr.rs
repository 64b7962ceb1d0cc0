//! CIDR arithmetic for VPCs and their tiers.
//!
//! VPC super-CIDRs are accepted with host bits set (`10.1.1.1/16`), the
//! same way the management API accepts them; all comparisons are made on
//! the normalized network address.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("invalid CIDR {0}")]
    Invalid(String),

    #[error("invalid gateway/netmask {gateway}/{netmask}")]
    InvalidNetmask { gateway: String, netmask: String },

    #[error("gateway {gateway} is not a host address of {tier}")]
    ReservedGateway { gateway: String, tier: String },

    #[error("tier {tier} is not inside VPC CIDR {vpc}")]
    OutsideVpc { tier: String, vpc: String },

    #[error("tier {tier} overlaps existing tier {existing}")]
    Overlap { tier: String, existing: String },

    #[error("no free address left in {0}")]
    Exhausted(String),
}

/// Parse a CIDR string, normalizing away host bits.
pub fn parse_cidr(s: &str) -> Result<Ipv4Network, CidrError> {
    let net: Ipv4Network = s.trim().parse().map_err(|_| CidrError::Invalid(s.to_string()))?;
    Ipv4Network::new(net.network(), net.prefix()).map_err(|_| CidrError::Invalid(s.to_string()))
}

/// A guest tier's address block, derived from its gateway and netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCidr {
    pub network: Ipv4Network,
    pub gateway: Ipv4Addr,
}

impl TierCidr {
    /// Build from `gateway=10.1.1.1`, `netmask=255.255.255.0` → `10.1.1.0/24`.
    pub fn from_gateway(gateway: &str, netmask: &str) -> Result<Self, CidrError> {
        let bad = || CidrError::InvalidNetmask {
            gateway: gateway.to_string(),
            netmask: netmask.to_string(),
        };
        let gw: Ipv4Addr = gateway.trim().parse().map_err(|_| bad())?;
        let mask: Ipv4Addr = netmask.trim().parse().map_err(|_| bad())?;
        let with_host = Ipv4Network::with_netmask(gw, mask).map_err(|_| bad())?;
        let network = Ipv4Network::new(with_host.network(), with_host.prefix()).map_err(|_| bad())?;
        if network.prefix() < 31 && (gw == network.network() || gw == network.broadcast()) {
            return Err(CidrError::ReservedGateway {
                gateway: gw.to_string(),
                tier: network.to_string(),
            });
        }
        Ok(Self { network, gateway: gw })
    }

    /// Check that this tier sits inside `vpc` and is disjoint from `existing`.
    pub fn validate_placement(&self, vpc: &str, existing: &[String]) -> Result<(), CidrError> {
        let vpc_net = parse_cidr(vpc)?;
        if !is_subnet_of(&self.network, &vpc_net) {
            return Err(CidrError::OutsideVpc {
                tier: self.network.to_string(),
                vpc: vpc_net.to_string(),
            });
        }
        for other in existing {
            let other_net = parse_cidr(other)?;
            if !disjoint(&self.network, &other_net) {
                return Err(CidrError::Overlap {
                    tier: self.network.to_string(),
                    existing: other_net.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Pick the first host address not in `taken`, skipping the network,
    /// gateway, and broadcast addresses.
    pub fn next_free_host(&self, taken: &[Ipv4Addr]) -> Result<Ipv4Addr, CidrError> {
        let network = self.network.network();
        let broadcast = self.network.broadcast();
        self.network
            .iter()
            .find(|ip| {
                *ip != network && *ip != broadcast && *ip != self.gateway && !taken.contains(ip)
            })
            .ok_or_else(|| CidrError::Exhausted(self.network.to_string()))
    }
}

/// Whether `inner` lies entirely within `outer`.
pub fn is_subnet_of(inner: &Ipv4Network, outer: &Ipv4Network) -> bool {
    inner.prefix() >= outer.prefix()
        && outer.contains(inner.network())
        && outer.contains(inner.broadcast())
}

/// Whether two blocks share no address.
pub fn disjoint(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    !a.contains(b.network()) && !b.contains(a.network())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpc_cidr_with_host_bits_normalizes() {
        let net = parse_cidr("10.1.1.1/16").unwrap();
        assert_eq!(net.to_string(), "10.1.0.0/16");
    }

    #[test]
    fn tier_from_gateway_and_netmask() {
        let tier = TierCidr::from_gateway("10.1.1.1", "255.255.255.0").unwrap();
        assert_eq!(tier.network.to_string(), "10.1.1.0/24");
        assert_eq!(tier.gateway, Ipv4Addr::new(10, 1, 1, 1));
    }

    #[test]
    fn gateway_must_be_a_host_address() {
        assert!(matches!(
            TierCidr::from_gateway("10.1.1.0", "255.255.255.0"),
            Err(CidrError::ReservedGateway { .. })
        ));
        assert!(matches!(
            TierCidr::from_gateway("10.1.1.255", "255.255.255.0"),
            Err(CidrError::ReservedGateway { .. })
        ));
        TierCidr::from_gateway("10.1.1.254", "255.255.255.0").unwrap();
    }

    #[test]
    fn tiers_must_sit_inside_vpc() {
        let tier = TierCidr::from_gateway("10.2.1.1", "255.255.255.0").unwrap();
        let err = tier.validate_placement("10.1.1.1/16", &[]).unwrap_err();
        assert!(matches!(err, CidrError::OutsideVpc { .. }));
    }

    #[test]
    fn tiers_must_be_disjoint() {
        let tier = TierCidr::from_gateway("10.1.1.1", "255.255.255.0").unwrap();
        let existing = vec!["10.1.0.0/20".to_string()];
        let err = tier.validate_placement("10.1.1.1/16", &existing).unwrap_err();
        assert!(matches!(err, CidrError::Overlap { .. }));

        let sibling = vec!["10.1.2.0/24".to_string()];
        tier.validate_placement("10.1.1.1/16", &sibling).unwrap();
    }

    #[test]
    fn host_allocation_skips_reserved_addresses() {
        let tier = TierCidr::from_gateway("10.1.1.1", "255.255.255.0").unwrap();
        let first = tier.next_free_host(&[]).unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 1, 1, 2));

        let second = tier.next_free_host(&[first]).unwrap();
        assert_eq!(second, Ipv4Addr::new(10, 1, 1, 3));
    }

    #[test]
    fn tiny_tier_exhausts() {
        // /30: network, gateway, one host, broadcast.
        let tier = TierCidr::from_gateway("10.1.1.1", "255.255.255.252").unwrap();
        let host = tier.next_free_host(&[]).unwrap();
        assert_eq!(host, Ipv4Addr::new(10, 1, 1, 2));
        assert!(matches!(tier.next_free_host(&[host]), Err(CidrError::Exhausted(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_cidr("not-a-cidr").is_err());
        assert!(TierCidr::from_gateway("10.1.1.1", "255.0.255.0").is_err());
    }
}
