//! vpcgrid-reconcile — makes a VPC's router match the rule store.
//!
//! A resync builds the desired router configuration from every tier of the
//! VPC, reads back what the router reports as live, and pushes only the
//! difference. Rule records are the single source of truth; the router's
//! own state is disposable.
//!
//! Resyncs are requested through [`Reconciler::request`], which coalesces
//! concurrent requests per VPC into at most one running and one queued
//! pass, and hands back a [`CompletionToken`] that resolves once a pass
//! that started after the request has finished.

pub mod error;
pub mod plan;
pub mod reconciler;

pub use error::{ReconcileError, ReconcileResult};
pub use plan::{desired_config, plan_ops};
pub use reconciler::{Completion, CompletionToken, Reconciler, ResyncReport};
