//! User configuration for stackplan.
//!
//! Settings live in `~/.stackplan/config.toml` (or `%LOCALAPPDATA%\stackplan\config.toml`
//! on Windows) and can be replaced with `--config <path>`. Every field is
//! optional; CLI flags override whatever the file says.
//!
//! ```toml
//! max_concurrency = 8
//! state_dir = "/var/lib/stackplan/state"
//! provider_dir = "/var/lib/stackplan/provider"
//! conflict_policy = "fail-fast"
//!
//! [retry]
//! max_attempts = 5
//! initial_delay_ms = 200
//! max_delay_ms = 30000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::constants::{
    DEFAULT_MAX_ATTEMPTS, MAX_BACKOFF_DELAY_MS, STARTING_BACKOFF_DELAY_MS, default_max_concurrency,
};
use crate::core::StackError;
use crate::executor::ExecutorConfig;
use crate::provider::{ConflictPolicy, RetryPolicy};

/// Backoff settings for provisioning calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per call, including the first
    pub max_attempts: usize,
    /// First backoff delay
    pub initial_delay_ms: u64,
    /// Cap on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: STARTING_BACKOFF_DELAY_MS,
            max_delay_ms: MAX_BACKOFF_DELAY_MS,
        }
    }
}

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Parallel applies; defaults to `max(10, 2 × cores)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    /// Where applied state is kept; defaults to `~/.stackplan/state`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Where the local provisioner keeps its resources; defaults to `~/.stackplan/provider`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_dir: Option<PathBuf>,

    /// Retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// What to do when the provider reports a conflicting operation
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

impl DeployConfig {
    /// Load from `path`, or the default location when `None`. A missing file
    /// yields the defaults.
    pub async fn load_with_optional(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => Self::default_path()?,
        };
        if path.exists() {
            Self::load_from(&path).await
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load and validate `path`.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&content).map_err(|e| StackError::ConfigError {
            message: format!("{}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty TOML, creating parent directories.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// `~/.stackplan`, or `%LOCALAPPDATA%\stackplan` on Windows.
    pub fn home_dir() -> Result<PathBuf> {
        let dir = if cfg!(target_os = "windows") {
            dirs::data_local_dir()
                .ok_or_else(|| anyhow::anyhow!("Unable to determine local data directory"))?
                .join("stackplan")
        } else {
            dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("Unable to determine home directory"))?
                .join(".stackplan")
        };
        Ok(dir)
    }

    /// Default config file path.
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("config.toml"))
    }

    /// Configured state directory or the default.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::home_dir()?.join("state")),
        }
    }

    /// Configured provisioner directory or the default.
    pub fn provider_dir(&self) -> Result<PathBuf> {
        match &self.provider_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::home_dir()?.join("provider")),
        }
    }

    /// Reject settings the executor cannot run with.
    pub fn validate(&self) -> Result<(), StackError> {
        let invalid = |message: &str| {
            Err(StackError::ConfigError {
                message: message.to_string(),
            })
        };
        if self.max_concurrency == Some(0) {
            return invalid("max_concurrency must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        Ok(())
    }

    /// Executor settings, with `max_parallel` from the command line taking precedence.
    #[must_use]
    pub fn executor_config(&self, max_parallel: Option<usize>) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrency: max_parallel
                .or(self.max_concurrency)
                .unwrap_or_else(default_max_concurrency)
                .max(1),
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts.max(1),
                initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                conflict: self.conflict_policy,
            },
        }
    }
}
