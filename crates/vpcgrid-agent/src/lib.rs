//! vpcgrid-agent — the boundary between the control plane and the
//! hypervisor that actually runs VPC routers.
//!
//! # Architecture
//!
//! ```text
//! RouterAgent (async trait, object safe)
//!   ├── boot / terminate        → one router instance per AgentHandle
//!   ├── push_config(ConfigOp)   → attach/detach a tier, add/remove one
//!   │                             NAT entry or ACL item
//!   ├── live_config             → what the instance reports as programmed
//!   └── health_check
//!
//! IpPool (sync trait)
//!   └── ZonePool                → per-zone public ranges, one lock per zone
//! ```
//!
//! [`SimulatedAgent`] keeps router instances in memory and supports fault
//! injection. The daemon's standalone mode and every test use it.

pub mod agent;
pub mod pool;
pub mod simulated;

pub use agent::{
    AclItem, AgentError, AgentHandle, AgentResult, ConfigOp, NatItem, RouterAgent, RouterConfig,
    RouterSpec, TierSpec,
};
pub use pool::{IpPool, PoolError, ZonePool};
pub use simulated::SimulatedAgent;
