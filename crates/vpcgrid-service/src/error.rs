//! Errors surfaced by the network service.

use std::net::Ipv4Addr;

use thiserror::Error;

use vpcgrid_agent::PoolError;
use vpcgrid_core::CidrError;
use vpcgrid_lifecycle::LifecycleError;
use vpcgrid_reconcile::ReconcileError;
use vpcgrid_state::{NetworkService, StateError};

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    InvalidCidr(#[from] CidrError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("network {network_id} does not offer {service:?}")]
    ServiceNotSupported {
        network_id: String,
        service: NetworkService,
    },

    #[error("duplicate NAT rule for {key} (held by {existing})")]
    DuplicateRule { key: String, existing: String },

    #[error("public IP {address} is still used by {rules} NAT rule(s)")]
    IpInUse { address: Ipv4Addr, rules: usize },

    #[error("no public IP left in zone {0}")]
    ResourceExhausted(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error(transparent)]
    Lifecycle(LifecycleError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("ip pool error: {0}")]
    Pool(PoolError),

    #[error("state store error: {0}")]
    State(StateError),
}

impl ServiceError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ServiceError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<StateError> for ServiceError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::DuplicateRule { key, existing } => {
                ServiceError::DuplicateRule { key, existing }
            }
            StateError::NotFound(what) => ServiceError::NotFound {
                kind: "record",
                id: what,
            },
            other => ServiceError::State(other),
        }
    }
}

impl From<PoolError> for ServiceError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted(zone) => ServiceError::ResourceExhausted(zone),
            other => ServiceError::Pool(other),
        }
    }
}

impl From<LifecycleError> for ServiceError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::ResourceExhausted(zone) => ServiceError::ResourceExhausted(zone),
            LifecycleError::VpcNotFound(id) => ServiceError::not_found("vpc", id),
            LifecycleError::RouterNotFound(id) => ServiceError::not_found("router", id),
            LifecycleError::State(e) => e.into(),
            other => ServiceError::Lifecycle(other),
        }
    }
}
