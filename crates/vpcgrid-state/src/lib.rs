//! vpcgrid-state — durable desired state for VPC networking.
//!
//! Backed by [redb](https://docs.rs/redb), holds VPCs, tiers, VMs, public
//! IPs, routers, and the rule store (NAT rules and ACL entries).
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Rules are keyed `{network_id}:{seq}` with a zero-padded sequence, so a
//! prefix scan over a network yields its rules in insertion order, which is
//! also ACL evaluation order. A secondary index keyed
//! `{public_ip}:{port}:{protocol}` enforces NAT tuple uniqueness inside the
//! same write transaction as the rule insert.
//!
//! Rule records are never keyed by router: desired state outlives any
//! particular router instance.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
