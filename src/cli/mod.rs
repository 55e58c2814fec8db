//! Command-line interface for stackplan.
//!
//! # Commands
//!
//! - `plan` - plan a blueprint and preview what an apply would change
//! - `apply` - apply the plan, print the per-node report and root outputs
//! - `graph` - print apply order and the dependency tree
//! - `outputs` - print root outputs recorded by the last apply
//!
//! Every command takes the same deployment flags ([`common::DeployArgs`]):
//!
//! ```bash
//! stackplan apply --blueprint demos/ewa-stack.toml --scope /rg/ewa \
//!     --location westeurope --environment prod --owner alice --output-file
//! ```
//!
//! # Global options
//!
//! - `--verbose` debug logging, `--quiet` errors only; `RUST_LOG` wins over both
//! - `--config <path>` alternative to `~/.stackplan/config.toml`
//! - `--no-progress` hides the progress bar (also `STACKPLAN_NO_PROGRESS`)

mod apply;
pub mod common;
mod graph;
mod outputs;
mod plan;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Settings derived from the global flags.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: Option<String>,
    /// Hide progress bars
    pub no_progress: bool,
    /// Explicit config file
    pub config_path: Option<PathBuf>,
}

impl CliConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the global tracing subscriber on stderr.
    pub fn init_logging(&self) {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(self.log_level.as_deref().unwrap_or("error"))
        };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}

#[derive(Parser)]
#[command(
    name = "stackplan",
    about = "Declarative multi-resource deployment planner",
    version,
    long_about = "stackplan plans a blueprint of parameterized resources and modules into a \
                  dependency-ordered graph and applies it idempotently."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Config file instead of ~/.stackplan/config.toml
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Hide progress bars
    #[arg(long, global = true, env = "STACKPLAN_NO_PROGRESS", value_parser = clap::builder::BoolishValueParser::new())]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a blueprint and preview changes
    Plan(plan::PlanCommand),

    /// Apply a blueprint
    Apply(apply::ApplyCommand),

    /// Show the dependency graph
    Graph(graph::GraphCommand),

    /// Show recorded root outputs
    Outputs(outputs::OutputsCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = self.build_config();
        self.execute_with_config(config).await
    }

    #[must_use]
    pub fn build_config(&self) -> CliConfig {
        let log_level = if self.verbose {
            Some("stackplan=debug".to_string())
        } else if self.quiet {
            Some("error".to_string())
        } else {
            Some("stackplan=warn".to_string())
        };

        CliConfig {
            log_level,
            no_progress: self.no_progress,
            config_path: self.config.clone(),
        }
    }

    pub async fn execute_with_config(self, config: CliConfig) -> Result<()> {
        config.init_logging();
        let config_path = config.config_path.as_deref();

        match self.command {
            Commands::Plan(cmd) => cmd.execute(config_path).await,
            Commands::Apply(cmd) => cmd.execute(config_path, config.no_progress || self.quiet).await,
            Commands::Graph(cmd) => cmd.execute().await,
            Commands::Outputs(cmd) => cmd.execute(config_path).await,
        }
    }
}
