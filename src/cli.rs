//! Interface de linha de comando do rolecoord baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] para criar, alterar,
//! transicionar e recuperar roles, e flags globais (--store, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// rolecoord: coordenação transacional do ciclo de vida de roles.
#[derive(Debug, Parser)]
#[command(name = "rolecoord", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo JSON usado como document store (substitui a configuração).
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cria uma role em DRAFT.
    Create {
        role_id: String,

        /// Título da role.
        #[arg(long)]
        title: Option<String>,

        /// Collaboration à qual a role pertence.
        #[arg(long)]
        collaboration: Option<String>,

        /// Habilidade exigida (pode repetir).
        #[arg(long = "skill")]
        skills: Vec<String>,

        /// Número máximo de participantes.
        #[arg(long, default_value_t = 1)]
        max_participants: u32,
    },

    /// Aplica um patch JSON aos campos de uma role.
    Update {
        role_id: String,

        /// Objeto JSON com os campos a alterar; `null` remove o campo.
        patch: String,
    },

    /// Move uma role para outro estado do ciclo de vida.
    Transition {
        role_id: String,

        /// Estado alvo (ex.: open, in_review, IN_PROGRESS).
        state: String,

        /// Usuário que solicita a transição.
        #[arg(long)]
        actor: Option<String>,

        /// Motivo (obrigatório para abandonar).
        #[arg(long)]
        reason: Option<String>,
    },

    /// Remove uma role e a retira da sua collaboration.
    Delete { role_id: String },

    /// Mostra uma role e as transições disponíveis.
    Show { role_id: String },

    /// Registra a candidatura de um usuário a uma role.
    Apply { role_id: String, user_id: String },

    /// Lista os snapshots de uma role.
    Snapshots { role_id: String },

    /// Restaura uma role a partir do último snapshot válido.
    Restore { role_id: String },

    /// Remove snapshots antigos, mantendo os mais recentes.
    Prune {
        role_id: String,

        /// Quantidade de snapshots a manter (padrão: configuração).
        #[arg(long)]
        keep: Option<usize>,
    },

    /// Lista as falhas registradas para uma role.
    Failures { role_id: String },

    /// Executa a demonstração embutida do ciclo de vida em memória.
    Demo,
}
