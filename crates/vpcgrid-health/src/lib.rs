//! vpcgrid-health — health checking for VPC routers.
//!
//! The health monitor runs a background task per Running router that
//! periodically calls the agent's health check and reports the outcome.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── Per-router background task (fixed interval)
//!   │   ├── HealthTracker (consecutive failures, time since last success)
//!   │   ├── probe() → ProbeResult, bounded by the check timeout
//!   │   └── last_health_at persisted on success
//!   └── HealthEvent channel → lifecycle supervisor
//! ```
//!
//! # Loss detection
//!
//! A router is `Lost` only when it has failed `unhealthy_threshold`
//! consecutive checks *and* has gone `grace_period` without a successful
//! one. Anything short of that is `Suspect`, and a single success restores
//! `Healthy`. After reporting `Lost` the task exits; the lifecycle manager
//! owns what happens next.

pub mod checker;
pub mod monitor;

pub use checker::{HealthStatus, HealthTracker, ProbeResult, probe};
pub use monitor::{HealthEvent, HealthMonitor};
