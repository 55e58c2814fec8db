//! `stackplan outputs`: root outputs as recorded by the last apply.

use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::common::{DeployArgs, load_config, open_backends};
use crate::executor::{ApplyReport, nodes_needing_keys};
use crate::outputs::{NodeOutputs, OutputTable, aggregate};
use crate::provider::list_keys_with_retry;
use crate::state::StateStore;

/// Print root outputs without applying anything.
#[derive(Args, Debug)]
pub struct OutputsCommand {
    #[command(flatten)]
    pub deploy: DeployArgs,

    /// Show secure outputs in plaintext
    #[arg(long)]
    pub show_secrets: bool,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

impl OutputsCommand {
    pub async fn execute(self, config_path: Option<&Path>) -> Result<()> {
        let config = load_config(config_path).await?;
        let plan = self.deploy.load_plan()?;
        let (state, provider) = open_backends(&config)?;
        let policy = config.executor_config(None).retry;
        let cancel = CancellationToken::new();

        let applied = state
            .load_all(&plan.scope_id)
            .await
            .with_context(|| format!("Failed to load applied state for scope '{}'", plan.scope_id))?;
        let needs_keys = nodes_needing_keys(&plan);

        let mut table = OutputTable::new();
        for id in &plan.order {
            let Some(record) = applied.get(id) else {
                continue;
            };
            let keys = if needs_keys.contains(id) {
                list_keys_with_retry(&*provider, &record.provider_id, &policy, &cancel)
                    .await
                    .map_err(|e| e.into_stack_error(id))?
            } else {
                Default::default()
            };
            table.insert(id.clone(), NodeOutputs::from_state(record, keys));
        }

        let report = ApplyReport::recorded(&plan, table);
        let outputs = aggregate(&plan, &report.table, &report);
        if self.json {
            println!("{}", serde_json::to_string_pretty(&outputs.render(self.show_secrets))?);
        } else if self.show_secrets {
            println!("{}", serde_json::to_string_pretty(&outputs.values(true))?);
        } else {
            print!("{outputs}");
        }
        Ok(())
    }
}
