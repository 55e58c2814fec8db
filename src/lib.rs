//! stackplan - declarative multi-resource deployment planner
//!
//! stackplan takes a *blueprint* of parameterized resources and reusable
//! modules, binds it against root parameters, and produces a deterministic,
//! dependency-ordered plan. The plan is then applied through a pluggable
//! provisioning client, concurrently where the graph allows, and re-applying
//! an unchanged blueprint makes no provider calls.
//!
//! # Architecture Overview
//!
//! ```text
//! root parameters ──► params::bind ──► condition (prune) ──► planner ──► graph (order)
//!                                                                          │
//!          outputs::aggregate ◄── executor (apply, thread outputs) ◄───────┘
//!                                     │          │
//!                                  diff      provider + state
//! ```
//!
//! # Core Modules
//!
//! - [`core`] - `StackError`, user-facing error rendering, the [`core::Value`] tree
//! - [`blueprint`] - serde model of blueprint files (TOML or JSON)
//! - [`params`] - parameter declarations and binding
//! - [`condition`] - inclusion predicates
//! - [`naming`] - computed, length-limited resource names
//! - [`planner`] - module expansion, pruning, substitution, reference scanning
//! - [`graph`] - dependency graph, cycle detection, deterministic order
//! - [`diff`] - convergence check against applied state and plan preview
//! - [`executor`] - concurrent apply with retries and cancellation
//! - [`outputs`] - node output table and the terminal output map
//! - [`provider`] - provisioning client trait, retry policy, local provisioner
//! - [`state`] - applied-state stores
//!
//! ## Supporting Modules
//!
//! - [`cli`] - `plan`, `apply`, `graph` and `outputs` commands
//! - [`config`] - `~/.stackplan/config.toml`
//! - [`constants`] - retry and concurrency defaults
//! - [`utils`] - atomic file writes, file locks, progress, suggestions
//!
//! # Blueprint Format
//!
//! ```toml
//! [parameters.prefix]
//! type = "string"
//! default = "ewa"
//!
//! [parameters.deployOpenAI]
//! type = "bool"
//! default = true
//!
//! [[resources]]
//! id = "storage"
//! type = "Microsoft.Storage/storageAccounts@2023-01-01"
//! name = { prefix = "${params.prefix}stg", max_length = 24, hyphens = false }
//!
//! [[resources]]
//! id = "topic"
//! type = "Microsoft.EventGrid/systemTopics@2022-06-15"
//! properties = { source = "${nodes.storage.id}" }
//!
//! [[instances]]
//! id = "openai"
//! module = "openai"
//! condition = "deployOpenAI"
//!
//! [[modules.openai.resources]]
//! id = "account"
//! type = "Microsoft.CognitiveServices/accounts@2023-05-01"
//!
//! [modules.openai.outputs]
//! endpoint = "account.endpoint"
//!
//! [outputs]
//! openaiEndpoint = "openai.endpoint"
//! storageKey = { source = "storage.keys.primary", secure = true }
//! ```
//!
//! `topic` waits for `storage` because its properties read `storage`'s id; no
//! `depends_on` is needed. When `deployOpenAI` is false, the module instance and
//! its resources are excluded and `openaiEndpoint` is reported absent.
//!
//! # Library Use
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stackplan::blueprint::Blueprint;
//! use stackplan::executor::Executor;
//! use stackplan::outputs::aggregate;
//! use stackplan::planner::{PlanInput, plan};
//! use stackplan::provider::LocalProvisioner;
//! use stackplan::state::MemoryStateStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let blueprint = Blueprint::load(std::path::Path::new("demos/ewa-stack.toml"))?;
//! let plan = plan(&blueprint, &PlanInput::new("/rg/ewa").with_context("location", "westeurope"))?;
//!
//! let executor = Executor::new(
//!     Arc::new(LocalProvisioner::new("/tmp/stackplan")),
//!     Arc::new(MemoryStateStore::new()),
//! );
//! let report = executor.execute(&plan).await?;
//! println!("{}", aggregate(&plan, &report.table, &report));
//! report.into_result()?;
//! # Ok(())
//! # }
//! ```

pub mod blueprint;
pub mod cli;
pub mod condition;
pub mod config;
pub mod constants;
pub mod core;
pub mod diff;
pub mod executor;
pub mod graph;
pub mod naming;
pub mod outputs;
pub mod params;
pub mod planner;
pub mod provider;
pub mod state;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
