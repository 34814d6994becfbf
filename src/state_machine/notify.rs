//! Notification hook points on lifecycle transitions.
//!
//! The coordinator decides *when* someone should hear about a transition and
//! *who*; what they are told, and how, belongs to the [`Notifier`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::role::{Collaboration, Role};
use super::transition::{SideEffect, TransitionContext};
use crate::error::{CoordError, Result};
use crate::store::COLLABORATIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleEvent {
    Started,
    CompletionRequested,
    Completed,
    Abandoned,
    Reopened,
}

impl fmt::Display for RoleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleEvent::Started => write!(f, "started"),
            RoleEvent::CompletionRequested => write!(f, "completion_requested"),
            RoleEvent::Completed => write!(f, "completed"),
            RoleEvent::Abandoned => write!(f, "abandoned"),
            RoleEvent::Reopened => write!(f, "reopened"),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: RoleEvent, role: &Role, recipients: &[String]) -> Result<()>;

    /// Withdraw a notification whose transition was rolled back.
    async fn retract(&self, _event: RoleEvent, _role: &Role, _recipients: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: RoleEvent, _role: &Role, _recipients: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Writes each notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: RoleEvent, role: &Role, recipients: &[String]) -> Result<()> {
        info!(%event, role_id = %role.id, recipients = ?recipients, "role notification");
        Ok(())
    }

    async fn retract(&self, event: RoleEvent, role: &Role, recipients: &[String]) -> Result<()> {
        info!(%event, role_id = %role.id, recipients = ?recipients, "role notification retracted");
        Ok(())
    }
}

/// Whom a [`NotifyEffect`] addresses, resolved against the role as it was
/// before the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    Assignees,
    Participant,
    PreviousParticipant,
    Owner,
}

pub struct NotifyEffect {
    name: String,
    event: RoleEvent,
    recipients: Recipients,
    notifier: Arc<dyn Notifier>,
}

impl NotifyEffect {
    pub fn new(event: RoleEvent, recipients: Recipients, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            name: format!("notify_{event}"),
            event,
            recipients,
            notifier,
        }
    }

    async fn resolve(&self, ctx: &TransitionContext<'_>) -> Result<Vec<String>> {
        let role = ctx.role;
        Ok(match self.recipients {
            Recipients::Assignees => role.assigned_user_ids.clone(),
            Recipients::Participant => role.participant_id.iter().cloned().collect(),
            Recipients::PreviousParticipant => role.previous_participant_id.iter().cloned().collect(),
            Recipients::Owner => collaboration_owner(ctx).await?.into_iter().collect(),
        })
    }
}

#[async_trait]
impl SideEffect for NotifyEffect {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &TransitionContext<'_>) -> Result<()> {
        let recipients = self.resolve(ctx).await?;
        if recipients.is_empty() {
            return Ok(());
        }
        self.notifier
            .notify(self.event, ctx.role, &recipients)
            .await
            .map_err(|e| CoordError::SideEffect {
                name: self.name.clone(),
                message: e.to_string(),
            })
    }

    async fn rollback(&self, ctx: &TransitionContext<'_>) -> Result<()> {
        let recipients = self.resolve(ctx).await?;
        if recipients.is_empty() {
            return Ok(());
        }
        self.notifier.retract(self.event, ctx.role, &recipients).await
    }
}

/// Owner of the role's collaboration, if the role belongs to one that exists.
pub async fn collaboration_owner(ctx: &TransitionContext<'_>) -> Result<Option<String>> {
    let Some(collaboration_id) = ctx.role.collaboration_id.as_deref() else {
        return Ok(None);
    };
    let Some(doc) = ctx.store.get(COLLABORATIONS, collaboration_id).await? else {
        return Ok(None);
    };
    let collaboration: Collaboration = serde_json::from_value(doc)?;
    Ok(Some(collaboration.owner_id))
}
