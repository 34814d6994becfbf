//! Demonstração embutida: percorre o ciclo de vida de uma role em memória.
//!
//! Cria uma collaboration e uma role, leva a role até IN_PROGRESS, abandona,
//! força uma falha de notificação para mostrar a compensação e reabre.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::json;

use rolecoord::clock::SystemClock;
use rolecoord::state_machine::{LogNotifier, Notifier, Role, RoleEvent};
use rolecoord::store::{COLLABORATIONS, DocumentStore, MemoryStore, ROLES};
use rolecoord::transaction::HandlerConfig;
use rolecoord::{CoordError, RoleCoordinator, RoleState, TransitionRequest};

use crate::ui::Terminal;

const OWNER: &str = "ana";
const MEMBER: &str = "bruno";
const ROLE_ID: &str = "sound-design";
const COLLABORATION_ID: &str = "short-film";

/// Notifier que falha uma única vez quando armado.
struct TrippableNotifier {
    inner: LogNotifier,
    armed: AtomicBool,
}

#[async_trait]
impl Notifier for TrippableNotifier {
    async fn notify(
        &self,
        event: RoleEvent,
        role: &Role,
        recipients: &[String],
    ) -> rolecoord::Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            return Err(CoordError::SideEffect {
                name: format!("notify_{event}"),
                message: "mail relay unreachable".to_string(),
            });
        }
        self.inner.notify(event, role, recipients).await
    }

    async fn retract(
        &self,
        event: RoleEvent,
        role: &Role,
        recipients: &[String],
    ) -> rolecoord::Result<()> {
        self.inner.retract(event, role, recipients).await
    }
}

pub async fn run(terminal: &Terminal) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(TrippableNotifier {
        inner: LogNotifier,
        armed: AtomicBool::new(false),
    });
    let coord = RoleCoordinator::new(
        store.clone(),
        Arc::new(SystemClock),
        HandlerConfig::default(),
        notifier.clone(),
    );

    terminal.step("setup");
    store
        .set(
            COLLABORATIONS,
            COLLABORATION_ID,
            json!({"id": COLLABORATION_ID, "ownerId": OWNER, "roleIds": []}),
        )
        .await?;
    let created = coord
        .operations
        .create_role(
            ROLE_ID,
            Some(json!({
                "title": "Sound designer",
                "collaborationId": COLLABORATION_ID,
                "requiredSkills": ["foley", "mixing"],
                "maxParticipants": 1,
            })),
            Some(json!({"source": "demo"})),
        )
        .await;
    terminal.print_result("create role", &created);
    if !created.success {
        return Err(anyhow!("demo could not create its role"));
    }

    terminal.step("staffing");
    show_step(terminal, coord.machine.transition(ROLE_ID, RoleState::Open).await, "open")?;

    let refused = coord.machine.transition(ROLE_ID, RoleState::InReview).await;
    report_refusal(terminal, "review without applications", refused);

    coord.submit_application(ROLE_ID, MEMBER).await?;
    terminal.success(&format!("{MEMBER} applied"));
    show_step(
        terminal,
        coord.machine.transition(ROLE_ID, RoleState::InReview).await,
        "review",
    )?;

    let assigned = coord
        .operations
        .update_role(
            ROLE_ID,
            Some(json!({"assignedUserIds": [MEMBER], "acceptedUserIds": [MEMBER]})),
            None,
        )
        .await;
    terminal.print_result("assign and accept", &assigned);
    show_step(
        terminal,
        coord.machine.transition(ROLE_ID, RoleState::Assigned).await,
        "assign",
    )?;
    show_step(
        terminal,
        coord
            .machine
            .transition_with(ROLE_ID, RoleState::InProgress, TransitionRequest::by(MEMBER))
            .await,
        "start",
    )?;

    terminal.step("abandon and reopen");
    let skipped = coord
        .machine
        .transition(ROLE_ID, RoleState::Completed)
        .await;
    report_refusal(terminal, "jump to completed", skipped);

    let no_reason = coord
        .machine
        .transition_with(ROLE_ID, RoleState::Abandoned, TransitionRequest::by(OWNER))
        .await;
    report_refusal(terminal, "abandon without a reason", no_reason);

    show_step(
        terminal,
        coord
            .machine
            .transition_with(
                ROLE_ID,
                RoleState::Abandoned,
                TransitionRequest::by(OWNER).with_reason("Schedule moved to next quarter"),
            )
            .await,
        "abandon",
    )?;

    notifier.armed.store(true, Ordering::SeqCst);
    let tripped = coord
        .machine
        .transition_with(ROLE_ID, RoleState::Open, TransitionRequest::by(OWNER))
        .await;
    report_refusal(terminal, "reopen with a failing notifier", tripped);
    let (_, after) = coord.handler.load_role(ROLE_ID).await?;
    terminal.success(&format!("role left untouched in {}", after.status));

    show_step(
        terminal,
        coord
            .machine
            .transition_with(ROLE_ID, RoleState::Open, TransitionRequest::by(OWNER))
            .await,
        "reopen",
    )?;

    terminal.step("history");
    let (_, role) = coord.handler.load_role(ROLE_ID).await?;
    terminal.print_role(&role, &coord.machine.available_transitions(role.status));

    let snapshots = coord.handler.coordinator().snapshots();
    let history = snapshots.snapshots_for_entity(ROLE_ID, ROLES).await?;
    let checked: Vec<_> = history
        .into_iter()
        .map(|s| {
            let valid = snapshots.validate_snapshot(&s);
            (s, valid)
        })
        .collect();
    terminal.print_snapshots(&checked);

    let bad_update = coord
        .operations
        .update_role(ROLE_ID, Some(json!({"maxParticipants": 0})), None)
        .await;
    terminal.print_result("invalid update", &bad_update);
    terminal.print_failures(&coord.operations.failures_for(ROLE_ID).await?);
    Ok(())
}

fn show_step(terminal: &Terminal, outcome: rolecoord::Result<Role>, label: &str) -> Result<()> {
    let role = outcome.map_err(|e| anyhow!("{label} failed: {e}"))?;
    terminal.success(&format!("{label}: {} is {}", role.id, role.status));
    Ok(())
}

fn report_refusal(terminal: &Terminal, label: &str, outcome: rolecoord::Result<Role>) {
    match outcome {
        Ok(role) => terminal.failure(&format!("{label} unexpectedly moved role to {}", role.status)),
        Err(e) => terminal.success(&format!("{label} refused: {e}")),
    }
}
