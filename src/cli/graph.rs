//! `stackplan graph`: print the dependency graph of a planned blueprint.

use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;

use super::common::DeployArgs;

/// Show apply order and dependency edges.
#[derive(Args, Debug)]
pub struct GraphCommand {
    #[command(flatten)]
    pub deploy: DeployArgs,

    /// Only render the tree under this node
    #[arg(long, value_name = "NODE")]
    pub root: Option<String>,

    /// Print order and edges as JSON
    #[arg(long)]
    pub json: bool,
}

impl GraphCommand {
    pub async fn execute(self) -> Result<()> {
        let plan = self.deploy.load_plan()?;

        if self.json {
            let edges: Vec<serde_json::Value> = plan
                .order
                .iter()
                .flat_map(|id| {
                    plan.graph.direct_dependencies(id).into_iter().map(move |(dep, kind)| {
                        serde_json::json!({ "from": id, "to": dep, "kind": kind.to_string() })
                    })
                })
                .collect();
            let document = serde_json::json!({
                "order": plan.order,
                "edges": edges,
                "excluded": plan.excluded.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&document)?);
            return Ok(());
        }

        let roots = match &self.root {
            Some(root) if plan.graph.contains(root) => vec![root.clone()],
            Some(root) => bail!("Node '{root}' is not part of the plan"),
            None => plan.graph.roots(),
        };
        println!("{}", "Apply order:".bold());
        for (i, id) in plan.order.iter().enumerate() {
            println!("  {:>2}. {id}", i + 1);
        }
        println!("\n{}", "Dependencies:".bold());
        for root in roots {
            print!("{}", plan.graph.to_tree_string(&root));
        }
        Ok(())
    }
}
