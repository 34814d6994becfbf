//! Configuração do rolecoord carregada a partir de `rolecoord.toml`.
//!
//! A struct [`CoordinatorConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ROLECOORD_STORE` tem precedência sobre o arquivo.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::lock::RetryConfig;
use crate::transaction::{DEFAULT_RETAINED_TRANSACTIONS, HandlerConfig};

/// Variável de ambiente que substitui `store_path`.
pub const STORE_ENV: &str = "ROLECOORD_STORE";

/// Configuração de nível superior carregada de `rolecoord.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Arquivo JSON usado como document store.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Duração do lease de cada lock, em milissegundos.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Retentativas de aquisição de lock após a primeira tentativa.
    #[serde(default = "default_lock_retry_count")]
    pub lock_retry_count: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_lock_base_delay_ms")]
    pub lock_base_delay_ms: u64,

    /// Teto de qualquer atraso individual do backoff.
    #[serde(default = "default_lock_max_delay_ms")]
    pub lock_max_delay_ms: u64,

    /// Snapshots mantidos por role ao executar `prune` sem `--keep`.
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention: usize,

    /// Transações finalizadas mantidas em memória para inspeção.
    #[serde(default = "default_retained_transactions")]
    pub retained_transactions: usize,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("rolecoord.json")
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_lock_retry_count() -> u32 {
    3
}

fn default_lock_base_delay_ms() -> u64 {
    100
}

fn default_lock_max_delay_ms() -> u64 {
    2_000
}

fn default_snapshot_retention() -> usize {
    10
}

fn default_retained_transactions() -> usize {
    DEFAULT_RETAINED_TRANSACTIONS
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_retry_count: default_lock_retry_count(),
            lock_base_delay_ms: default_lock_base_delay_ms(),
            lock_max_delay_ms: default_lock_max_delay_ms(),
            snapshot_retention: default_snapshot_retention(),
            retained_transactions: default_retained_transactions(),
        }
    }
}

impl CoordinatorConfig {
    /// Carrega a configuração de `rolecoord.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("rolecoord.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<CoordinatorConfig>(&contents)
                .with_context(|| format!("invalid configuration in {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para o caminho do store.
        if let Ok(store) = std::env::var(STORE_ENV)
            && !store.is_empty()
        {
            config.store_path = PathBuf::from(store);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms == 0 {
            bail!("lock_timeout_ms must be greater than zero");
        }
        if self.lock_base_delay_ms > self.lock_max_delay_ms {
            bail!(
                "lock_base_delay_ms ({}) exceeds lock_max_delay_ms ({})",
                self.lock_base_delay_ms,
                self.lock_max_delay_ms
            );
        }
        Ok(())
    }

    /// Parâmetros de lock e backoff para o executor de roles.
    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            lock_timeout_ms: self.lock_timeout_ms,
            retry: RetryConfig {
                max_retries: self.lock_retry_count,
                base_delay_ms: self.lock_base_delay_ms,
                max_delay_ms: self.lock_max_delay_ms,
            },
            retained_transactions: self.retained_transactions,
        }
    }
}
