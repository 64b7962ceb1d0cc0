//! vpcgrid-lifecycle — the VPC router state machine.
//!
//! # Components
//!
//! - **`transition`** — the legal router state transitions
//! - **`manager`** — create / start / stop / destroy / replace / fail
//! - **`supervisor`** — background loop reacting to health events and
//!   recreating routers for VPCs that lost theirs
//!
//! Routers move through
//! `Provisioning → Running → Stopping → Stopped → Destroying → Destroyed`,
//! with `Provisioning | Running → Failed` on error. No transition touches
//! rule records; a router that reaches `Running` is handed to the
//! reconciler to be filled from the rule store.

pub mod error;
pub mod manager;
pub mod supervisor;
pub mod transition;

#[cfg(test)]
mod test_support;

pub use error::{LifecycleError, LifecycleResult};
pub use manager::{LifecycleManager, RouterReady};
pub use transition::can_transition;
