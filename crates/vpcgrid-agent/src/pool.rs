//! Public IP pools.
//!
//! Each zone owns one public range. Allocation walks the range in address
//! order and hands out the first free host address; the network and
//! broadcast addresses are never handed out.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use ipnetwork::Ipv4Network;
use thiserror::Error;
use tracing::{debug, warn};

use vpcgrid_core::cidr::parse_cidr;
use vpcgrid_core::config::ZoneConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("public IP pool of zone {0} is exhausted")]
    Exhausted(String),

    #[error("unknown zone {0}")]
    UnknownZone(String),

    #[error("{address} is not allocated in zone {zone}")]
    NotAllocated { zone: String, address: Ipv4Addr },

    #[error("invalid range for zone {zone}: {reason}")]
    InvalidRange { zone: String, reason: String },
}

/// Allocates public addresses per zone.
pub trait IpPool: Send + Sync {
    /// Hand out a free address to `owner` (a VPC or router id).
    fn allocate(&self, zone_id: &str, owner: &str) -> Result<Ipv4Addr, PoolError>;

    /// Return an address to the pool.
    fn release(&self, zone_id: &str, address: Ipv4Addr) -> Result<(), PoolError>;

    /// Mark an address as taken, e.g. when rebuilding from persisted state.
    fn reserve(&self, zone_id: &str, address: Ipv4Addr, owner: &str) -> Result<(), PoolError>;

    /// Whether the pool serves `zone_id` at all.
    fn has_zone(&self, zone_id: &str) -> bool;
}

struct ZoneRange {
    network: Ipv4Network,
    /// address → owner
    allocated: BTreeMap<Ipv4Addr, String>,
}

impl ZoneRange {
    fn usable(&self, ip: Ipv4Addr) -> bool {
        self.network.prefix() >= 31
            || (ip != self.network.network() && ip != self.network.broadcast())
    }
}

/// [`IpPool`] over the configured zone ranges, one lock per zone.
pub struct ZonePool {
    zones: HashMap<String, Mutex<ZoneRange>>,
}

impl ZonePool {
    pub fn new(zones: &[ZoneConfig]) -> Result<Self, PoolError> {
        let mut map = HashMap::new();
        for zone in zones {
            let network = parse_cidr(&zone.public_range).map_err(|e| PoolError::InvalidRange {
                zone: zone.id.clone(),
                reason: e.to_string(),
            })?;
            map.insert(
                zone.id.clone(),
                Mutex::new(ZoneRange {
                    network,
                    allocated: BTreeMap::new(),
                }),
            );
        }
        Ok(Self { zones: map })
    }

    fn zone(&self, zone_id: &str) -> Result<&Mutex<ZoneRange>, PoolError> {
        self.zones
            .get(zone_id)
            .ok_or_else(|| PoolError::UnknownZone(zone_id.to_string()))
    }

    /// Number of addresses currently handed out in a zone.
    pub fn allocated_count(&self, zone_id: &str) -> usize {
        self.zone(zone_id)
            .map(|z| z.lock().unwrap_or_else(|e| e.into_inner()).allocated.len())
            .unwrap_or(0)
    }
}

impl IpPool for ZonePool {
    fn allocate(&self, zone_id: &str, owner: &str) -> Result<Ipv4Addr, PoolError> {
        let mut range = self.zone(zone_id)?.lock().unwrap_or_else(|e| e.into_inner());
        let address = range
            .network
            .iter()
            .find(|ip| range.usable(*ip) && !range.allocated.contains_key(ip))
            .ok_or_else(|| {
                warn!(%zone_id, "public IP pool exhausted");
                PoolError::Exhausted(zone_id.to_string())
            })?;
        range.allocated.insert(address, owner.to_string());
        debug!(%zone_id, %address, %owner, "public IP allocated");
        Ok(address)
    }

    fn release(&self, zone_id: &str, address: Ipv4Addr) -> Result<(), PoolError> {
        let mut range = self.zone(zone_id)?.lock().unwrap_or_else(|e| e.into_inner());
        match range.allocated.remove(&address) {
            Some(owner) => {
                debug!(%zone_id, %address, %owner, "public IP released");
                Ok(())
            }
            None => Err(PoolError::NotAllocated {
                zone: zone_id.to_string(),
                address,
            }),
        }
    }

    fn reserve(&self, zone_id: &str, address: Ipv4Addr, owner: &str) -> Result<(), PoolError> {
        let mut range = self.zone(zone_id)?.lock().unwrap_or_else(|e| e.into_inner());
        if !range.network.contains(address) {
            return Err(PoolError::InvalidRange {
                zone: zone_id.to_string(),
                reason: format!("{address} is outside {}", range.network),
            });
        }
        range.allocated.insert(address, owner.to_string());
        Ok(())
    }

    fn has_zone(&self, zone_id: &str) -> bool {
        self.zones.contains_key(zone_id)
    }
}
