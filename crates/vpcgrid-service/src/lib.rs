//! vpcgrid-service — the tenant-facing network service.
//!
//! [`NetworkService`] is what the REST API and the integration scenarios
//! drive: create a VPC and its tiers, deploy VMs, acquire public IPs, add
//! NAT rules and ACL entries, and stop, start, or destroy the VPC router.
//!
//! Rule mutations return a [`Submitted`] value carrying the completion
//! token of the resync that pushes them. Router operations never touch
//! rule records; a replacement router is rebuilt from the store.

pub mod error;
pub mod service;

pub use error::{ServiceError, ServiceResult};
pub use service::{DeployedVm, NetworkService, Submitted};
