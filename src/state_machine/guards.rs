//! Guards and side effects backing the standard role lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::notify::{Notifier, NotifyEffect, Recipients, RoleEvent, collaboration_owner};
use super::role::{CompletionRequest, Role, RoleUpdate};
use super::state::RoleState;
use super::transition::{
    Condition, RoleCondition, SideEffect, StateTransition, TransitionContext, TransitionRequest,
    TransitionTable,
};
use crate::error::Result;
use crate::store::{APPLICATIONS, COMPLETIONS, PROGRESS};

pub const MAX_ABANDONMENT_REASON: usize = 500;

/// At least one application has been filed for the role.
pub struct HasApplications;

#[async_trait]
impl Condition for HasApplications {
    fn description(&self) -> &str {
        "Role must have at least one application"
    }

    async fn holds(&self, ctx: &TransitionContext<'_>) -> Result<bool> {
        let applications = ctx
            .store
            .query(APPLICATIONS, "roleId", &Value::String(ctx.role.id.clone()))
            .await?;
        Ok(!applications.is_empty())
    }
}

/// The requesting actor owns the role's collaboration.
pub struct IsCollaborationOwner;

#[async_trait]
impl Condition for IsCollaborationOwner {
    fn description(&self) -> &str {
        "Only the collaboration owner can perform this transition"
    }

    async fn holds(&self, ctx: &TransitionContext<'_>) -> Result<bool> {
        let Some(actor) = ctx.request.actor_id.as_deref() else {
            return Ok(false);
        };
        Ok(collaboration_owner(ctx).await?.as_deref() == Some(actor))
    }
}

async fn completion_request(ctx: &TransitionContext<'_>) -> Result<Option<CompletionRequest>> {
    match ctx.store.get(COMPLETIONS, &ctx.role.id).await? {
        Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
        None => Ok(None),
    }
}

/// A completion request with evidence exists for the role.
pub struct CompletionSubmitted;

#[async_trait]
impl Condition for CompletionSubmitted {
    fn description(&self) -> &str {
        "Completion criteria must be satisfied"
    }

    async fn holds(&self, ctx: &TransitionContext<'_>) -> Result<bool> {
        Ok(completion_request(ctx)
            .await?
            .is_some_and(|c| !c.evidence.is_empty()))
    }
}

/// The role's completion request has been approved.
pub struct CompletionApproved;

#[async_trait]
impl Condition for CompletionApproved {
    fn description(&self) -> &str {
        "Completion must be approved"
    }

    async fn holds(&self, ctx: &TransitionContext<'_>) -> Result<bool> {
        Ok(completion_request(ctx).await?.is_some_and(|c| c.approved))
    }
}

/// Records that work on the role has started. Rolling back deletes the record.
pub struct InsertProgressRecord;

impl InsertProgressRecord {
    pub fn record_id(role_id: &str, transaction_id: &str) -> String {
        format!("{role_id}:{transaction_id}")
    }
}

#[async_trait]
impl SideEffect for InsertProgressRecord {
    fn name(&self) -> &str {
        "insert_progress_record"
    }

    async fn execute(&self, ctx: &TransitionContext<'_>) -> Result<()> {
        let id = Self::record_id(&ctx.role.id, ctx.transaction_id);
        let record = json!({
            "id": id,
            "roleId": ctx.role.id,
            "participantIds": ctx.role.accepted_user_ids,
            "startedAt": ctx.now_ms,
            "transactionId": ctx.transaction_id,
        });
        ctx.store.set(PROGRESS, &id, record).await?;
        Ok(())
    }

    async fn rollback(&self, ctx: &TransitionContext<'_>) -> Result<()> {
        let id = Self::record_id(&ctx.role.id, ctx.transaction_id);
        ctx.store.delete(PROGRESS, &id).await?;
        Ok(())
    }
}

fn has_requirements(role: &Role, _: &TransitionRequest) -> bool {
    !role.required_skills.is_empty()
}

fn allows_participants(role: &Role, _: &TransitionRequest) -> bool {
    role.max_participants > 0
}

fn assignment_within_capacity(role: &Role, _: &TransitionRequest) -> bool {
    let assigned = role.assigned_user_ids.len();
    assigned >= 1 && assigned <= role.max_participants as usize
}

fn all_accepted(role: &Role, _: &TransitionRequest) -> bool {
    role.all_assigned_accepted()
}

fn valid_abandonment_reason(_: &Role, request: &TransitionRequest) -> bool {
    request.reason.as_deref().is_some_and(|reason| {
        let reason = reason.trim();
        !reason.is_empty() && reason.chars().count() <= MAX_ABANDONMENT_REASON
    })
}

fn start_patch(role: &Role, _: &TransitionRequest) -> RoleUpdate {
    let mut patch = RoleUpdate::new();
    if let Some(first) = role.accepted_user_ids.first() {
        patch.insert("participantId".into(), Value::String(first.clone()));
    }
    patch
}

fn abandon_patch(role: &Role, request: &TransitionRequest) -> RoleUpdate {
    let mut patch = RoleUpdate::new();
    let previous = role
        .participant_id
        .clone()
        .or_else(|| role.assigned_user_ids.first().cloned());
    patch.insert(
        "previousParticipantId".into(),
        previous.map_or(Value::Null, Value::String),
    );
    patch.insert("participantId".into(), Value::Null);
    patch.insert(
        "abandonmentReason".into(),
        request
            .reason
            .as_deref()
            .map_or(Value::Null, |r| Value::String(r.trim().to_string())),
    );
    patch
}

fn reopen_patch(_: &Role, _: &TransitionRequest) -> RoleUpdate {
    let mut patch = RoleUpdate::new();
    patch.insert("assignedUserIds".into(), json!([]));
    patch.insert("acceptedUserIds".into(), json!([]));
    patch.insert("abandonmentReason".into(), Value::Null);
    patch
}

impl TransitionTable {
    /// The collaboration role lifecycle:
    ///
    /// ```text
    /// DRAFT → OPEN → IN_REVIEW → ASSIGNED → IN_PROGRESS → COMPLETION_REQUESTED → COMPLETED
    /// ASSIGNED | IN_PROGRESS | COMPLETION_REQUESTED → ABANDONED
    /// ABANDONED → OPEN | UNNEEDED
    /// ```
    pub fn standard(notifier: Arc<dyn Notifier>) -> TransitionTable {
        let notify = |event, recipients| -> Arc<dyn SideEffect> {
            Arc::new(NotifyEffect::new(event, recipients, Arc::clone(&notifier)))
        };

        let mut builder = TransitionTable::builder()
            .transition(
                StateTransition::new(RoleState::Draft, RoleState::Open)
                    .when(RoleCondition::new(
                        "Role must have at least one requirement",
                        has_requirements,
                    ))
                    .when(RoleCondition::new(
                        "Role must allow at least one participant",
                        allows_participants,
                    )),
            )
            .transition(
                StateTransition::new(RoleState::Open, RoleState::InReview).when(HasApplications),
            )
            .transition(
                StateTransition::new(RoleState::InReview, RoleState::Assigned).when(
                    RoleCondition::new(
                        "Role must have between 1 and maxParticipants assigned users",
                        assignment_within_capacity,
                    ),
                ),
            )
            .transition(
                StateTransition::new(RoleState::Assigned, RoleState::InProgress)
                    .when(RoleCondition::new(
                        "All assigned users must accept the role",
                        all_accepted,
                    ))
                    .then(Arc::new(InsertProgressRecord))
                    .then(notify(RoleEvent::Started, Recipients::Assignees))
                    .patch(start_patch),
            )
            .transition(
                StateTransition::new(RoleState::InProgress, RoleState::CompletionRequested)
                    .when(CompletionSubmitted)
                    .then(notify(RoleEvent::CompletionRequested, Recipients::Owner)),
            )
            .transition(
                StateTransition::new(RoleState::CompletionRequested, RoleState::Completed)
                    .when(CompletionApproved)
                    .then(notify(RoleEvent::Completed, Recipients::Participant)),
            )
            .transition(
                StateTransition::new(RoleState::Abandoned, RoleState::Open)
                    .when(IsCollaborationOwner)
                    .then(notify(RoleEvent::Reopened, Recipients::PreviousParticipant))
                    .patch(reopen_patch),
            )
            .transition(
                StateTransition::new(RoleState::Abandoned, RoleState::Unneeded)
                    .when(IsCollaborationOwner),
            );

        for from in RoleState::ALL.into_iter().filter(|s| s.is_active_assignment()) {
            builder = builder.transition(
                StateTransition::new(from, RoleState::Abandoned)
                    .when(IsCollaborationOwner)
                    .when(RoleCondition::new(
                        "A valid abandonment reason is required",
                        valid_abandonment_reason,
                    ))
                    .then(notify(RoleEvent::Abandoned, Recipients::Participant))
                    .patch(abandon_patch),
            );
        }
        builder.build()
    }
}
