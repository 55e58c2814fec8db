//! `stackplan apply`: plan, then apply against the local provisioner.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::common::{DeployArgs, load_config, open_backends};
use crate::core::REDACTED;
use crate::executor::{ApplyReport, Executor, NodeStatus};
use crate::outputs::{OutputMap, OutputValue, aggregate};
use crate::utils::{ProgressBar, write_json_file};

/// Apply a blueprint.
#[derive(Args, Debug)]
pub struct ApplyCommand {
    #[command(flatten)]
    pub deploy: DeployArgs,

    /// Print the report and outputs as JSON
    #[arg(long)]
    pub json: bool,

    /// Show secure outputs in plaintext
    #[arg(long)]
    pub show_secrets: bool,

    /// Maximum number of nodes applied at once
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Write deployment info JSON; defaults to `deployment.json` or `deployment-<env>.json`
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub output_file: Option<Option<PathBuf>>,
}

impl ApplyCommand {
    pub async fn execute(self, config_path: Option<&Path>, no_progress: bool) -> Result<()> {
        let config = load_config(config_path).await?;
        let plan = self.deploy.load_plan()?;
        let (state, provider) = open_backends(&config)?;

        let cancel = CancellationToken::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} Cancelling; waiting for in-flight nodes", "!".yellow());
                ctrl_c.cancel();
            }
        });

        let progress = ProgressBar::new(plan.order.len() as u64, !no_progress && !self.json);
        let executor = Executor::new(provider, state)
            .with_config(config.executor_config(self.max_parallel))
            .with_cancellation(cancel)
            .with_progress(progress);
        let report = executor.execute(&plan).await?;
        let outputs = aggregate(&plan, &report.table, &report);

        if self.json {
            let document = serde_json::json!({
                "report": report.to_json(),
                "outputs": outputs.render(self.show_secrets),
            });
            println!("{}", serde_json::to_string_pretty(&document)?);
        } else {
            print_report(&report);
            print_outputs(&outputs, self.show_secrets);
        }

        if let Some(path) = &self.output_file {
            let path = path.clone().unwrap_or_else(|| self.deploy.deployment_file_name());
            self.write_deployment_info(&path, &report, &outputs)?;
            if !self.json {
                println!("{} Deployment info written to {}", "✓".green(), path.display());
            }
        }

        report.into_result()?;
        Ok(())
    }

    fn write_deployment_info(&self, path: &Path, report: &ApplyReport, outputs: &OutputMap) -> Result<()> {
        let info = serde_json::json!({
            "scope": report.scope_id,
            "runId": report.run_id.to_string(),
            "location": self.deploy.location,
            "environment": self.deploy.environment.clone().unwrap_or_default(),
            "deployedAt": chrono::Utc::now().to_rfc3339(),
            "outputs": outputs.values(self.show_secrets),
        });
        write_json_file(path, &info)
    }
}

fn print_report(report: &ApplyReport) {
    for (id, status) in &report.statuses {
        match status {
            NodeStatus::Applied {
                action,
            } => println!("  {} {id} {}", "✓".green(), action.to_string().dimmed()),
            NodeStatus::Failed {
                error,
            } => println!("  {} {id} {}", "✗".red(), error.to_string().red()),
            NodeStatus::Skipped {
                reason,
            } => println!("  {} {id} skipped: {reason}", "-".yellow()),
            NodeStatus::Excluded {
                reason,
            } => println!("  {} {id} excluded: {reason}", "·".dimmed()),
        }
    }
    if report.is_success() {
        println!("\n{} Applied {} change(s)", "✓".green(), report.change_count());
    } else {
        println!(
            "\n{} {} failed, {} skipped",
            "✗".red(),
            report.failed().len(),
            report.skipped().len()
        );
    }
}

fn print_outputs(outputs: &OutputMap, reveal: bool) {
    if outputs.is_empty() {
        return;
    }
    println!("\n{}", "Outputs:".bold());
    for (name, output) in outputs.iter() {
        match output {
            OutputValue::Present {
                value,
                ..
            } if reveal => println!("  {name} = {}", value.expose()),
            OutputValue::Present {
                secure: true,
                ..
            } => println!("  {name} = {} {}", REDACTED, "(secure)".dimmed()),
            OutputValue::Present {
                value,
                ..
            } => println!("  {name} = {value}"),
            OutputValue::Absent {
                reason,
            } => println!("  {name}: {} ({reason})", "absent".yellow()),
        }
    }
}
