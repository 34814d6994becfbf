//! Transactional mutation of roles: lifecycle tracking, the lock/snapshot
//! envelope around each update, and the monitored create/update/delete API.

mod coordinator;
mod executor;
mod monitored;

pub use coordinator::{
    DEFAULT_RETAINED_TRANSACTIONS, EntityRef, Transaction, TransactionCoordinator, TransactionState,
};
pub use executor::{
    HandlerConfig, RoleScope, RoleTransactionHandler, collaboration_lock_key, validate_update,
};
pub use monitored::{FailureRecord, MonitoredRoleOperations, OperationResult};

/// Fresh transaction identifier.
pub fn new_transaction_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
