//! Arguments and helpers shared by the deployment commands.

use anyhow::{Context, Result, bail};
use clap::Args;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::blueprint::Blueprint;
use crate::config::DeployConfig;
use crate::core::Value;
use crate::planner::{Plan, PlanInput, plan};
use crate::provider::LocalProvisioner;
use crate::state::FileStateStore;

/// Tag key carrying the owner of a deployment.
pub const OWNER_TAG: &str = "PersonResponsible";

/// Blueprint, scope and parameter flags accepted by every deployment command.
#[derive(Args, Debug, Clone, Default)]
pub struct DeployArgs {
    /// Blueprint file (TOML, or JSON with a `.json` extension)
    #[arg(short, long, value_name = "FILE", default_value = "stackplan.toml")]
    pub blueprint: PathBuf,

    /// Deployment scope, e.g. a resource group id; hashed into computed names
    #[arg(short, long, env = "STACKPLAN_SCOPE")]
    pub scope: String,

    /// Location inherited by every resource that does not set one
    #[arg(short, long)]
    pub location: Option<String>,

    /// Value of the `prefix` parameter
    #[arg(long)]
    pub prefix: Option<String>,

    /// Value of the `environment` parameter; also names the deployment info file
    #[arg(short, long)]
    pub environment: Option<String>,

    /// Owner, recorded as the `PersonResponsible` tag
    #[arg(long)]
    pub owner: Option<String>,

    /// Extra tag inherited by every resource (repeatable)
    #[arg(long = "tag", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub tags: Vec<(String, String)>,

    /// Root parameter value; parsed as JSON when possible (repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    /// Use an existing AI endpoint instead of deploying one
    #[arg(long, requires_all = ["ai_endpoint", "ai_key"])]
    pub use_existing_ai: bool,

    /// Endpoint of the existing AI service
    #[arg(long, requires = "use_existing_ai")]
    pub ai_endpoint: Option<String>,

    /// Key of the existing AI service
    #[arg(long, env = "STACKPLAN_AI_KEY", hide_env_values = true)]
    pub ai_key: Option<String>,
}

impl DeployArgs {
    /// Planning input built from the flags.
    pub fn plan_input(&self) -> Result<PlanInput> {
        let mut input = PlanInput::new(&self.scope);

        if let Some(prefix) = &self.prefix {
            input = input.with_param("prefix", prefix.as_str());
        }
        if let Some(environment) = &self.environment {
            input = input.with_param("environment", environment.as_str());
        }
        if self.use_existing_ai {
            let (Some(endpoint), Some(key)) = (&self.ai_endpoint, &self.ai_key) else {
                bail!("--use-existing-ai requires both --ai-endpoint and --ai-key");
            };
            if endpoint.trim().is_empty() || key.trim().is_empty() {
                bail!("--ai-endpoint and --ai-key must not be empty");
            }
            input = input
                .with_param("deployOpenAI", false)
                .with_param("existingOpenAIEndpoint", endpoint.as_str())
                .with_param("existingOpenAIKey", key.as_str());
        }
        for (name, raw) in &self.params {
            input = input.with_param(name.as_str(), parse_cli_value(raw)?);
        }

        if let Some(location) = &self.location {
            input = input.with_context("location", location.as_str());
        }
        let mut tags: BTreeMap<String, Value> =
            self.tags.iter().map(|(k, v)| (k.clone(), Value::string(v))).collect();
        if let Some(owner) = &self.owner {
            tags.insert(OWNER_TAG.to_string(), Value::string(owner));
        }
        if !tags.is_empty() {
            input = input.with_context("tags", Value::Map(tags));
        }
        Ok(input)
    }

    /// Load the blueprint and plan it.
    pub fn load_plan(&self) -> Result<Plan> {
        let blueprint = Blueprint::load(&self.blueprint)?;
        let input = self.plan_input()?;
        let plan = plan(&blueprint, &input)
            .with_context(|| format!("Failed to plan {}", self.blueprint.display()))?;
        tracing::info!(scope = %plan.scope_id, nodes = plan.order.len(), excluded = plan.excluded.len(), "Planned");
        Ok(plan)
    }

    /// Default deployment info file: `deployment.json` or `deployment-<env>.json`.
    #[must_use]
    pub fn deployment_file_name(&self) -> PathBuf {
        match self.environment.as_deref().filter(|e| !e.is_empty()) {
            Some(environment) => PathBuf::from(format!("deployment-{environment}.json")),
            None => PathBuf::from("deployment.json"),
        }
    }
}

/// Applied state and provisioner configured by `config`.
pub fn open_backends(config: &DeployConfig) -> Result<(Arc<FileStateStore>, Arc<LocalProvisioner>)> {
    let state = Arc::new(FileStateStore::new(config.state_dir()?));
    let provider = Arc::new(LocalProvisioner::new(config.provider_dir()?));
    Ok((state, provider))
}

/// Load the user config, from `path` when given.
pub async fn load_config(path: Option<&Path>) -> Result<DeployConfig> {
    DeployConfig::load_with_optional(path.map(Path::to_path_buf)).await
}

/// Parse `KEY=VALUE`.
pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Interpret a `--set` value: JSON literals (`true`, `3`, `{"a":1}`) keep their
/// type, anything else is a string.
pub fn parse_cli_value(raw: &str) -> Result<Value> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Ok(Value::from_json(json)?),
        Err(_) => Ok(Value::string(raw)),
    }
}
