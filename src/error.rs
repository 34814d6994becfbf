use thiserror::Error;

use crate::state_machine::RoleState;
use crate::store::StoreError;

/// Everything the coordination subsystem can report to a caller.
///
/// Any error means the requested change did not happen. The one exception is
/// [`CoordError::RollbackFailed`], which means consistency could not be
/// restored and the transaction has been poisoned.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("could not acquire lock {lock_id} after {attempts} attempt(s)")]
    LockAcquisitionFailed { lock_id: String, attempts: u32 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no transition from {from} to {to}")]
    InvalidTransition { from: RoleState, to: RoleState },

    #[error("guard condition failed: {0}")]
    GuardConditionFailed(String),

    #[error("snapshot {snapshot_id} failed checksum verification")]
    InvalidSnapshot { snapshot_id: String },

    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    #[error("rollback of transaction {transaction_id} failed: {source} (original error: {original})")]
    RollbackFailed {
        transaction_id: String,
        original: String,
        #[source]
        source: Box<CoordError>,
    },

    #[error("side effect {name} failed: {message}")]
    SideEffect { name: String, message: String },

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordError {
    pub fn not_found(entity_type: &str, id: &str) -> Self {
        CoordError::NotFound {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        }
    }

    /// Expected, caller-recoverable outcomes that need no operational alert.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            CoordError::Validation(_)
                | CoordError::InvalidTransition { .. }
                | CoordError::GuardConditionFailed(_)
                | CoordError::NotFound { .. }
        )
    }
}

pub type Result<T, E = CoordError> = std::result::Result<T, E>;
