//! Transactional coordination for collaboration roles.
//!
//! Roles are mutated under a per-role lease lock, with a checksummed
//! snapshot taken before every write so that any failure can be undone.
//! Lifecycle changes go through [`RoleStateMachine`], whose guarded,
//! compensable transitions are built on the same envelope.

pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod snapshot;
pub mod state_machine;
pub mod store;
pub mod transaction;

use std::sync::Arc;

pub use error::{CoordError, Result};
pub use state_machine::{RoleState, RoleStateMachine, TransitionRequest, TransitionTable};
pub use transaction::{MonitoredRoleOperations, RoleTransactionHandler};

use clock::Clock;
use state_machine::{Notifier, RoleApplication};
use store::{APPLICATIONS, DocumentStore};
use transaction::HandlerConfig;

/// The three entry points wired over one store, built once per process.
pub struct RoleCoordinator {
    pub handler: Arc<RoleTransactionHandler>,
    pub operations: MonitoredRoleOperations,
    pub machine: RoleStateMachine,
}

impl RoleCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: HandlerConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let handler = Arc::new(RoleTransactionHandler::new(store, clock, config));
        Self {
            operations: MonitoredRoleOperations::new(Arc::clone(&handler)),
            machine: RoleStateMachine::new(Arc::clone(&handler), TransitionTable::standard(notifier)),
            handler,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        self.handler.store()
    }

    /// File `user_id`'s application to a role that is open or in review.
    /// Applying twice replaces the earlier application.
    pub async fn submit_application(&self, role_id: &str, user_id: &str) -> Result<RoleApplication> {
        let (_, role) = self.handler.load_role(role_id).await?;
        if !matches!(role.status, RoleState::Open | RoleState::InReview) {
            return Err(CoordError::Validation(format!(
                "role {role_id} is {} and not accepting applications",
                role.status
            )));
        }
        let application = RoleApplication {
            id: format!("{role_id}:{user_id}"),
            role_id: role_id.to_string(),
            user_id: user_id.to_string(),
            created_at: self.handler.clock().now_ms(),
        };
        self.store()
            .set(APPLICATIONS, &application.id, serde_json::to_value(&application)?)
            .await?;
        Ok(application)
    }
}
