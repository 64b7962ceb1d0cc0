//! redb table definitions for the vpcgrid state store.
//!
//! Each entity table uses `&str` keys and `&[u8]` values (JSON-serialized
//! domain types).

use redb::TableDefinition;

/// VPCs keyed by `{vpc_id}`.
pub const VPCS: TableDefinition<&str, &[u8]> = TableDefinition::new("vpcs");

/// Guest tiers keyed by `{network_id}`.
pub const NETWORKS: TableDefinition<&str, &[u8]> = TableDefinition::new("networks");

/// VMs keyed by `{network_id}:{vm_id}`.
pub const VMS: TableDefinition<&str, &[u8]> = TableDefinition::new("vms");

/// Routers keyed by `{router_id}`.
pub const ROUTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("routers");

/// Rules keyed by `{network_id}:{seq:012}`; the key is the rule id.
pub const RULES: TableDefinition<&str, &[u8]> = TableDefinition::new("rules");

/// NAT uniqueness index: `{public_ip}:{port}:{protocol}` → rule id.
pub const NAT_INDEX: TableDefinition<&str, &str> = TableDefinition::new("nat_index");

/// Public IP associations keyed by address.
pub const PUBLIC_IPS: TableDefinition<&str, &[u8]> = TableDefinition::new("public_ips");

/// Monotonic id sequences keyed by sequence name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
