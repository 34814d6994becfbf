mod cli;
mod demo;
mod ui;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use rolecoord::clock::SystemClock;
use rolecoord::config::CoordinatorConfig;
use rolecoord::state_machine::LogNotifier;
use rolecoord::store::{JsonFileStore, ROLES};
use rolecoord::{RoleCoordinator, RoleState, TransitionRequest};
use ui::Terminal;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let terminal = Terminal::new();
    if let Command::Demo = cli.command {
        return demo::run(&terminal).await;
    }

    let mut config = CoordinatorConfig::load()?;
    if let Some(path) = cli.store {
        config.store_path = path;
    }
    let store = JsonFileStore::open(&config.store_path)
        .with_context(|| format!("failed to open store {}", config.store_path.display()))?;
    let coord = RoleCoordinator::new(
        Arc::new(store),
        Arc::new(SystemClock),
        config.handler_config(),
        Arc::new(LogNotifier),
    );

    match cli.command {
        Command::Create {
            role_id,
            title,
            collaboration,
            skills,
            max_participants,
        } => {
            let mut data = Map::new();
            if let Some(title) = title {
                data.insert("title".into(), Value::String(title));
            }
            if let Some(collaboration) = collaboration {
                data.insert("collaborationId".into(), Value::String(collaboration));
            }
            data.insert("requiredSkills".into(), json!(skills));
            data.insert("maxParticipants".into(), json!(max_participants));

            let pb = terminal.spinner(&format!("Creating {role_id}..."));
            let result = coord
                .operations
                .create_role(&role_id, Some(Value::Object(data)), Some(json!({"source": "cli"})))
                .await;
            pb.finish_and_clear();
            terminal.print_result(&format!("create {role_id}"), &result);
        }
        Command::Update { role_id, patch } => {
            let patch: Value =
                serde_json::from_str(&patch).context("patch must be a JSON object")?;
            let pb = terminal.spinner(&format!("Updating {role_id}..."));
            let result = coord
                .operations
                .update_role(&role_id, Some(patch), Some(json!({"source": "cli"})))
                .await;
            pb.finish_and_clear();
            terminal.print_result(&format!("update {role_id}"), &result);
        }
        Command::Transition {
            role_id,
            state,
            actor,
            reason,
        } => {
            let target: RoleState = state.parse().map_err(|e| anyhow!("{e}"))?;
            let request = TransitionRequest {
                actor_id: actor,
                reason,
            };
            let pb = terminal.spinner(&format!("Moving {role_id} to {target}..."));
            let outcome = coord.machine.transition_with(&role_id, target, request).await;
            pb.finish_and_clear();
            match outcome {
                Ok(role) => {
                    terminal.success(&format!("{role_id} is now {}", role.status));
                }
                Err(e) => {
                    terminal.failure(&e.to_string());
                    std::process::exit(1);
                }
            }
        }
        Command::Delete { role_id } => {
            let pb = terminal.spinner(&format!("Deleting {role_id}..."));
            let result = coord
                .operations
                .delete_role(&role_id, None, Some(json!({"source": "cli"})))
                .await;
            pb.finish_and_clear();
            terminal.print_result(&format!("delete {role_id}"), &result);
        }
        Command::Show { role_id } => {
            let (_, role) = coord.handler.load_role(&role_id).await?;
            terminal.print_role(&role, &coord.machine.available_transitions(role.status));
        }
        Command::Apply { role_id, user_id } => {
            let application = coord.submit_application(&role_id, &user_id).await?;
            terminal.success(&format!("{user_id} applied to {role_id} ({})", application.id));
        }
        Command::Snapshots { role_id } => {
            let snapshots = coord.handler.coordinator().snapshots();
            let checked: Vec<_> = snapshots
                .snapshots_for_entity(&role_id, ROLES)
                .await?
                .into_iter()
                .map(|s| {
                    let valid = snapshots.validate_snapshot(&s);
                    (s, valid)
                })
                .collect();
            terminal.print_snapshots(&checked);
        }
        Command::Restore { role_id } => {
            let pb = terminal.spinner(&format!("Restoring {role_id}..."));
            let outcome = coord.handler.restore_role(&role_id).await;
            pb.finish_and_clear();
            let snapshot = match outcome {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    terminal.failure(&e.to_string());
                    std::process::exit(1);
                }
            };
            terminal.success(&format!(
                "{role_id} restored from v{} ({})",
                snapshot.metadata.version, snapshot.id
            ));
        }
        Command::Prune { role_id, keep } => {
            let keep = keep.unwrap_or(config.snapshot_retention);
            let removed = coord
                .handler
                .coordinator()
                .snapshots()
                .prune_snapshots(&role_id, ROLES, keep)
                .await?;
            terminal.success(&format!("removed {removed} snapshot(s) of {role_id}, kept {keep}"));
        }
        Command::Failures { role_id } => {
            terminal.print_failures(&coord.operations.failures_for(&role_id).await?);
        }
        Command::Demo => {}
    }

    Ok(())
}
