//! `stackplan plan`: show the apply order and what would change.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::Path;

use super::common::{DeployArgs, load_config, open_backends};
use crate::diff::{Change, Preview, PreviewChange, preview};
use crate::planner::Plan;
use crate::state::StateStore;

/// Plan a blueprint and compare it with applied state, without applying anything.
#[derive(Args, Debug)]
pub struct PlanCommand {
    #[command(flatten)]
    pub deploy: DeployArgs,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,

    /// Exit with code 2 when applying would change something
    #[arg(long)]
    pub detailed_exitcode: bool,
}

impl PlanCommand {
    pub async fn execute(self, config_path: Option<&Path>) -> Result<()> {
        let config = load_config(config_path).await?;
        let plan = self.deploy.load_plan()?;
        let (state, _) = open_backends(&config)?;
        let applied = state
            .load_all(&plan.scope_id)
            .await
            .with_context(|| format!("Failed to load applied state for scope '{}'", plan.scope_id))?;
        let preview = preview(&plan, &applied)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&plan_json(&plan, &preview))?);
        } else {
            print_plan(&plan, &preview);
        }

        if self.detailed_exitcode && !preview.is_converged() {
            std::process::exit(2);
        }
        Ok(())
    }
}

fn print_plan(plan: &Plan, preview: &Preview) {
    println!("{} {}", "Scope:".bold(), plan.scope_id);
    for (id, change) in &preview.entries {
        let Some(node) = plan.node(id) else {
            continue;
        };
        let line = format!("{id} ({}) name={}", node.resource_type, node.name);
        match change {
            PreviewChange::Known(Change::Create) => println!("  {} {line}", "+".green()),
            PreviewChange::Known(Change::NoOp) => println!("  {} {line}", "=".dimmed()),
            PreviewChange::Known(Change::Update {
                changes,
            }) => {
                println!("  {} {line}", "~".yellow());
                for change in changes {
                    println!("      {change}");
                }
            }
            PreviewChange::Pending {
                waiting_on,
            } => println!("  {} {line} (known after apply: {})", "?".cyan(), waiting_on.join(", ")),
        }
    }
    for excluded in &plan.excluded {
        println!("  {} {} excluded: {}", "-".dimmed(), excluded.id, excluded.reason);
    }

    if preview.is_converged() {
        println!("\n{} Nothing to apply", "✓".green());
    } else {
        println!("\n{} {} node(s) to apply", "→".cyan(), preview.action_count());
    }
}

fn plan_json(plan: &Plan, preview: &Preview) -> serde_json::Value {
    let nodes: Vec<serde_json::Value> = preview
        .entries
        .iter()
        .map(|(id, change)| {
            let (action, detail) = match change {
                PreviewChange::Known(Change::Create) => ("create", serde_json::Value::Null),
                PreviewChange::Known(Change::NoOp) => ("noop", serde_json::Value::Null),
                PreviewChange::Known(Change::Update {
                    changes,
                }) => ("update", changes.iter().map(|c| c.path.clone()).collect()),
                PreviewChange::Pending {
                    waiting_on,
                } => ("pending", waiting_on.iter().cloned().collect()),
            };
            let node = plan.node(id);
            serde_json::json!({
                "id": id,
                "type": node.map(|n| n.resource_type.as_str()),
                "name": node.map(|n| n.name.as_str()),
                "dependsOn": plan.graph.direct_dependencies(id).into_iter().map(|(dep, _)| dep).collect::<Vec<_>>(),
                "action": action,
                "detail": detail,
            })
        })
        .collect();
    let excluded: Vec<serde_json::Value> = plan
        .excluded
        .iter()
        .map(|e| serde_json::json!({ "id": e.id, "reason": e.reason }))
        .collect();
    serde_json::json!({
        "scope": plan.scope_id,
        "order": plan.order,
        "nodes": nodes,
        "excluded": excluded,
        "converged": preview.is_converged(),
    })
}
