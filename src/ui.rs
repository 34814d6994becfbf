//! Interface de terminal do rolecoord: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner exibido enquanto uma operação
//! aguarda locks e `console` para estilização com cores.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use rolecoord::snapshot::Snapshot;
use rolecoord::state_machine::{Role, RoleState};
use rolecoord::transaction::{FailureRecord, OperationResult};

/// Saída formatada dos comandos da CLI.
///
/// Sucesso em verde, falha em vermelho, avisos e estados em amarelo.
pub struct Terminal {
    green: Style,
    red: Style,
    yellow: Style,
    cyan: Style,
    dim: Style,
}

impl Default for Terminal {
    fn default() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            cyan: Style::new().cyan().bold(),
            dim: Style::new().dim(),
        }
    }
}

impl Terminal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inicia um spinner com a mensagem fornecida.
    pub fn spinner(&self, message: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn success(&self, message: &str) {
        println!("  {} {message}", self.green.apply_to("✓"));
    }

    pub fn failure(&self, message: &str) {
        println!("  {} {message}", self.red.apply_to("✗"));
    }

    pub fn step(&self, message: &str) {
        println!("{}", self.cyan.apply_to(format!("── {message}")));
    }

    /// Resultado de uma operação monitorada, com o id da transação.
    pub fn print_result(&self, action: &str, result: &OperationResult) {
        match &result.error {
            None if result.success => self.success(action),
            error => self.failure(&format!(
                "{action}: {}",
                error.as_deref().unwrap_or("unknown error")
            )),
        }
        println!("    {}", self.dim.apply_to(format!("transaction {}", result.transaction_id)));
    }

    pub fn print_role(&self, role: &Role, available: &[RoleState]) {
        println!("{} {}", self.cyan.apply_to(&role.id), role.title);
        println!("  status        {}", self.yellow.apply_to(role.status));
        if !role.required_skills.is_empty() {
            println!("  skills        {}", role.required_skills.join(", "));
        }
        println!("  participants  {}/{}", role.assigned_user_ids.len(), role.max_participants);
        if let Some(participant) = &role.participant_id {
            println!("  participant   {participant}");
        }
        if let Some(previous) = &role.previous_participant_id {
            println!("  previous      {previous}");
        }
        if let Some(reason) = &role.abandonment_reason {
            println!("  abandoned     {reason}");
        }
        let next = if available.is_empty() {
            "none (terminal)".to_string()
        } else {
            available
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!("  next          {}", self.dim.apply_to(next));
    }

    /// Snapshots com a indicação de integridade de cada um.
    pub fn print_snapshots(&self, snapshots: &[(Snapshot, bool)]) {
        if snapshots.is_empty() {
            println!("  {}", self.dim.apply_to("no snapshots"));
            return;
        }
        for (snapshot, valid) in snapshots {
            let mark = if *valid {
                self.green.apply_to("valid")
            } else {
                self.red.apply_to("CORRUPT")
            };
            println!(
                "  v{:<4} {}  {}  txn {}  {mark}",
                snapshot.metadata.version,
                snapshot.id,
                snapshot.timestamp,
                snapshot.metadata.transaction_id,
            );
        }
    }

    pub fn print_failures(&self, failures: &[FailureRecord]) {
        if failures.is_empty() {
            println!("  {}", self.dim.apply_to("no recorded failures"));
            return;
        }
        for failure in failures {
            println!(
                "  {} {} {}",
                self.dim.apply_to(failure.timestamp),
                self.yellow.apply_to(&failure.operation),
                failure.error
            );
            println!("    {}", self.dim.apply_to(format!("transaction {}", failure.transaction_id)));
        }
    }
}
