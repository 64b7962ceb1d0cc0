//! Lifecycle error types.

use thiserror::Error;

use vpcgrid_agent::{AgentError, PoolError};
use vpcgrid_state::RouterState;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("router {router_id} cannot go from {from} to {to}")]
    InvalidTransition {
        router_id: String,
        from: RouterState,
        to: RouterState,
    },

    #[error("router {router_id} did not become healthy after {attempts} attempt(s)")]
    ProvisioningTimeout { router_id: String, attempts: u32 },

    #[error("no public IP left in zone {0}")]
    ResourceExhausted(String),

    #[error("vpc not found: {0}")]
    VpcNotFound(String),

    #[error("router not found: {0}")]
    RouterNotFound(String),

    #[error("ip pool error: {0}")]
    Pool(PoolError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("state store error: {0}")]
    State(#[from] vpcgrid_state::StateError),

    #[error("lifecycle task failed: {0}")]
    Task(String),
}

impl From<PoolError> for LifecycleError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted(zone) => LifecycleError::ResourceExhausted(zone),
            other => LifecycleError::Pool(other),
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
