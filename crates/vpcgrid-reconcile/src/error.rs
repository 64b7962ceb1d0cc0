//! Reconciler error types.

use thiserror::Error;

use vpcgrid_agent::AgentError;

/// Errors produced by a resync.
///
/// `Clone` so a single outcome can be handed to every waiter of a
/// coalesced pass.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("vpc not found: {0}")]
    VpcNotFound(String),

    /// One rule could not be pushed to the router.
    #[error("failed to apply rule {rule_id} on network {network_id}: {reason}")]
    RuleApply {
        rule_id: String,
        network_id: String,
        reason: String,
    },

    /// A tier interface could not be attached or detached.
    #[error("failed to change interface of network {network_id}: {reason}")]
    TierApply { network_id: String, reason: String },

    #[error("agent call timed out: {0}")]
    Timeout(String),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("state store error: {0}")]
    State(String),

    #[error("reconciler shut down before the resync completed")]
    Cancelled,
}

impl From<vpcgrid_state::StateError> for ReconcileError {
    fn from(e: vpcgrid_state::StateError) -> Self {
        ReconcileError::State(e.to_string())
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
