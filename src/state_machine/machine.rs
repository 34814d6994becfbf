use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info};

use super::role::{Role, RoleUpdate};
use super::state::RoleState;
use super::transition::{SideEffect, StateTransition, TransitionContext, TransitionRequest, TransitionTable};
use crate::error::{CoordError, Result};
use crate::lock::role_lock_key;
use crate::store::ROLES;
use crate::transaction::RoleTransactionHandler;

/// Drives roles through the lifecycle graph in [`TransitionTable`].
///
/// A transition holds the role's lock from the first read to the status
/// write. Guards run before anything changes; side effects that have run are
/// compensated in reverse if a later effect or the status write fails.
pub struct RoleStateMachine {
    handler: Arc<RoleTransactionHandler>,
    table: TransitionTable,
}

impl RoleStateMachine {
    pub fn new(handler: Arc<RoleTransactionHandler>, table: TransitionTable) -> Self {
        Self { handler, table }
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub fn available_transitions(&self, from: RoleState) -> Vec<RoleState> {
        self.table.available_transitions(from)
    }

    pub async fn transition(&self, role_id: &str, target: RoleState) -> Result<Role> {
        self.transition_with(role_id, target, TransitionRequest::default())
            .await
    }

    pub async fn transition_with(
        &self,
        role_id: &str,
        target: RoleState,
        request: TransitionRequest,
    ) -> Result<Role> {
        let scope = self.handler.open(vec![role_lock_key(role_id)]).await?;
        let outcome = self
            .run(&scope.transaction_id, role_id, target, &request)
            .await;
        self.handler.close(scope, outcome).await
    }

    async fn run(
        &self,
        transaction_id: &str,
        role_id: &str,
        target: RoleState,
        request: &TransitionRequest,
    ) -> Result<Role> {
        let (doc, role) = self.handler.load_role(role_id).await?;
        let transition = self
            .table
            .get(role.status, target)
            .ok_or(CoordError::InvalidTransition {
                from: role.status,
                to: target,
            })?;

        let ctx = TransitionContext {
            role: &role,
            from: role.status,
            to: target,
            request,
            transaction_id,
            store: self.handler.store().as_ref(),
            now_ms: self.handler.clock().now_ms(),
        };

        for condition in &transition.conditions {
            if !condition.holds(&ctx).await? {
                return Err(CoordError::GuardConditionFailed(
                    condition.description().to_string(),
                ));
            }
        }

        self.handler
            .coordinator()
            .snapshots()
            .create_snapshot(role_id, ROLES, &doc, transaction_id)
            .await?;

        let mut executed: Vec<&Arc<dyn SideEffect>> = Vec::new();
        let outcome = async {
            for effect in &transition.side_effects {
                effect.execute(&ctx).await?;
                executed.push(effect);
            }
            let update = status_update(transition, &role, request);
            self.handler.write_role(transaction_id, &doc, &role, &update).await
        }
        .await;

        match outcome {
            Ok(updated) => {
                info!(
                    role_id,
                    transaction_id,
                    from = %ctx.from,
                    to = %ctx.to,
                    "role transitioned"
                );
                Ok(updated)
            }
            Err(cause) => Err(compensate(&ctx, &executed, cause).await),
        }
    }
}

fn status_update(transition: &StateTransition, role: &Role, request: &TransitionRequest) -> RoleUpdate {
    let mut update = transition
        .patch
        .map(|patch| patch(role, request))
        .unwrap_or_default();
    update.insert(
        "status".into(),
        Value::String(transition.to.as_str().to_string()),
    );
    update
}

/// Roll back every executed effect, newest first. A failing rollback does not
/// stop the others; the first such failure is escalated.
async fn compensate(
    ctx: &TransitionContext<'_>,
    executed: &[&Arc<dyn SideEffect>],
    cause: CoordError,
) -> CoordError {
    let mut first_failure = None;
    for effect in executed.iter().rev() {
        if let Err(e) = effect.rollback(ctx).await {
            error!(
                role_id = %ctx.role.id,
                transaction_id = ctx.transaction_id,
                effect = effect.name(),
                error = %e,
                "side effect rollback failed"
            );
            first_failure.get_or_insert(e);
        }
    }

    match first_failure {
        None => cause,
        Some(source) => CoordError::RollbackFailed {
            transaction_id: ctx.transaction_id.to_string(),
            original: cause.to_string(),
            source: Box::new(source),
        },
    }
}
