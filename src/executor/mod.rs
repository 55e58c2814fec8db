//! Concurrent, dependency-ordered apply of a [`Plan`].
//!
//! # Scheduling
//!
//! A single coordinator owns the [`OutputTable`] and every node's status.
//! Workers run in a [`JoinSet`]; a [`Semaphore`] bounds how many of them talk to
//! the provisioning client at once. A node is spawned only when every node it
//! depends on has applied. Just before spawning, the coordinator resolves the
//! node's `${nodes...}` placeholders from the table, so a dependent never sees
//! an output that was not confirmed by its producer.
//!
//! # Worker
//!
//! Each worker runs the convergence check against applied state. A no-op skips
//! the provider. A create or update goes through [`apply_with_retry`] and, on
//! success, is recorded in the [`StateStore`]. Access keys are fetched for
//! nodes whose `keys.*` outputs are referenced anywhere in the plan.
//!
//! # Failure and cancellation
//!
//! A failed node marks all of its transitive dependents skipped; independent
//! subtrees keep going. Cancelling the token stops new nodes from starting.
//! Nodes already talking to the provider settle, and every node that never
//! started is reported as skipped with reason `cancelled`. Nothing is rolled
//! back.

use anyhow::{Context, Result};
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::constants::default_max_concurrency;
use crate::core::{Placeholder, StackError, Value};
use crate::diff::{Change, ResolvedNode, diff};
use crate::outputs::{NodeOutputs, OutputTable};
use crate::planner::{Plan, PlannedOutput};
use crate::provider::{
    ApplyMode, ApplyRequest, ProvisioningClient, RetryPolicy, apply_with_retry, list_keys_with_retry,
};
use crate::state::{AppliedState, StateStore};
use crate::utils::ProgressBar;

/// What happened to an applied node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    /// Created by the provider
    Created,
    /// Updated in place
    Updated,
    /// Already converged; the provider was not called
    Unchanged,
}

impl fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Final status of one node.
#[derive(Debug, Clone)]
pub enum NodeStatus {
    /// Applied successfully
    Applied {
        /// Create, update or no-op
        action: ApplyAction,
    },
    /// Apply failed
    Failed {
        /// Node-scoped error
        error: StackError,
    },
    /// Never started
    Skipped {
        /// Failed dependency or `cancelled`
        reason: String,
    },
    /// Excluded while planning
    Excluded {
        /// Condition or excluded parent
        reason: String,
    },
}

impl NodeStatus {
    /// Short label: `applied`, `failed`, `skipped` or `excluded`.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Applied {
                ..
            } => "applied",
            Self::Failed {
                ..
            } => "failed",
            Self::Skipped {
                ..
            } => "skipped",
            Self::Excluded {
                ..
            } => "excluded",
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Applied {
                action,
            } => serde_json::json!({ "status": self.label(), "action": action.to_string() }),
            Self::Failed {
                error,
            } => serde_json::json!({ "status": self.label(), "error": error.to_string() }),
            Self::Skipped {
                reason,
            }
            | Self::Excluded {
                reason,
            } => serde_json::json!({ "status": self.label(), "reason": reason }),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied {
                action,
            } => write!(f, "applied ({action})"),
            Self::Failed {
                error,
            } => write!(f, "failed: {error}"),
            Self::Skipped {
                reason,
            } => write!(f, "skipped: {reason}"),
            Self::Excluded {
                reason,
            } => write!(f, "excluded: {reason}"),
        }
    }
}

/// Per-node result of an apply run.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// Identifies the run in logs
    pub run_id: Uuid,
    /// Deployment scope
    pub scope_id: String,
    /// Status of every planned and excluded node
    pub statuses: BTreeMap<String, NodeStatus>,
    /// Nodes in the order they settled (applied or failed)
    pub settled: Vec<String>,
    /// Outputs of applied nodes
    pub table: OutputTable,
}

impl ApplyReport {
    /// Status of one node.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<&NodeStatus> {
        self.statuses.get(id)
    }

    fn ids_where(&self, predicate: impl Fn(&NodeStatus) -> bool) -> Vec<&str> {
        self.statuses.iter().filter(|(_, s)| predicate(s)).map(|(id, _)| id.as_str()).collect()
    }

    /// Nodes applied with `action`.
    #[must_use]
    pub fn with_action(&self, action: ApplyAction) -> Vec<&str> {
        self.ids_where(|s| matches!(s, NodeStatus::Applied { action: a } if *a == action))
    }

    /// Failed nodes.
    #[must_use]
    pub fn failed(&self) -> Vec<&str> {
        self.ids_where(|s| matches!(s, NodeStatus::Failed { .. }))
    }

    /// Skipped nodes.
    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.ids_where(|s| matches!(s, NodeStatus::Skipped { .. }))
    }

    /// Number of provider create or update calls that succeeded.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.with_action(ApplyAction::Created).len() + self.with_action(ApplyAction::Updated).len()
    }

    /// Whether every planned node applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed().is_empty() && self.skipped().is_empty()
    }

    /// Report of what applied state already records, without applying anything.
    ///
    /// Nodes present in `table` count as unchanged; every other planned node is
    /// skipped with reason `not applied`.
    #[must_use]
    pub fn recorded(plan: &Plan, table: OutputTable) -> Self {
        let mut statuses: BTreeMap<String, NodeStatus> = plan
            .excluded
            .iter()
            .map(|e| {
                (e.id.clone(), NodeStatus::Excluded {
                    reason: e.reason.clone(),
                })
            })
            .collect();
        for id in &plan.order {
            let status = if table.contains(id) {
                NodeStatus::Applied {
                    action: ApplyAction::Unchanged,
                }
            } else {
                NodeStatus::Skipped {
                    reason: "not applied".to_string(),
                }
            };
            statuses.insert(id.clone(), status);
        }
        Self {
            run_id: Uuid::new_v4(),
            scope_id: plan.scope_id.clone(),
            statuses,
            settled: Vec::new(),
            table,
        }
    }

    /// One line per node.
    #[must_use]
    pub fn summary(&self) -> String {
        self.statuses.iter().map(|(id, status)| format!("{id}: {status}")).collect::<Vec<_>>().join("\n")
    }

    /// `Ok(self)` when every planned node applied, [`StackError::PartialApply`] otherwise.
    pub fn into_result(self) -> Result<Self, StackError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(StackError::PartialApply {
            failed: self.failed().len(),
            skipped: self.skipped().len(),
            summary: self.summary(),
        })
    }

    /// JSON form of the per-node statuses.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "runId": self.run_id.to_string(),
            "scope": self.scope_id,
            "nodes": self
                .statuses
                .iter()
                .map(|(id, status)| (id.clone(), status.to_json()))
                .collect::<serde_json::Map<_, _>>(),
        })
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, status) in &self.statuses {
            let marker = match status {
                NodeStatus::Applied {
                    ..
                } => "✓",
                NodeStatus::Failed {
                    ..
                } => "✗",
                NodeStatus::Skipped {
                    ..
                } => "-",
                NodeStatus::Excluded {
                    ..
                } => "·",
            };
            writeln!(f, "{marker} {id} {status}")?;
        }
        Ok(())
    }
}

/// Executor limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Workers allowed to call the provider at once
    pub max_concurrency: usize,
    /// Retry policy for every provider call
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Applies plans against a provisioning client.
pub struct Executor {
    client: Arc<dyn ProvisioningClient>,
    state: Arc<dyn StateStore>,
    config: ExecutorConfig,
    cancel: CancellationToken,
    progress: ProgressBar,
}

#[derive(Debug)]
enum NodeOutcome {
    Applied {
        action: ApplyAction,
        outputs: NodeOutputs,
    },
    Cancelled,
}

impl Executor {
    /// Executor with default limits.
    pub fn new(client: Arc<dyn ProvisioningClient>, state: Arc<dyn StateStore>) -> Self {
        Self {
            client,
            state,
            config: ExecutorConfig::default(),
            cancel: CancellationToken::new(),
            progress: ProgressBar::hidden(),
        }
    }

    /// Builder: set limits.
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Builder: use an external cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Builder: report progress on `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Token that cancels this executor's runs.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Apply `plan`.
    ///
    /// Node failures are reported in the [`ApplyReport`]; only failing to read
    /// applied state aborts the run, before any provider call.
    pub async fn execute(&self, plan: &Plan) -> Result<ApplyReport> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("apply", %run_id, scope = %plan.scope_id);
        self.execute_run(plan, run_id).instrument(span).await
    }

    async fn execute_run(&self, plan: &Plan, run_id: Uuid) -> Result<ApplyReport> {
        let applied = self
            .state
            .load_all(&plan.scope_id)
            .await
            .with_context(|| format!("Failed to load applied state for scope '{}'", plan.scope_id))?;
        let needs_keys = nodes_needing_keys(plan);

        let mut statuses: BTreeMap<String, NodeStatus> = plan
            .excluded
            .iter()
            .map(|e| {
                (e.id.clone(), NodeStatus::Excluded {
                    reason: e.reason.clone(),
                })
            })
            .collect();
        let mut waiting: BTreeMap<&str, usize> = plan
            .order
            .iter()
            .map(|id| {
                let deps: BTreeSet<String> =
                    plan.graph.direct_dependencies(id).into_iter().map(|(dep, _)| dep).collect();
                (id.as_str(), deps.len())
            })
            .collect();
        let mut ready: BTreeSet<String> =
            waiting.iter().filter(|(_, count)| **count == 0).map(|(id, _)| (*id).to_string()).collect();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks: JoinSet<JoinedNode> = JoinSet::new();
        let mut in_flight: BTreeSet<String> = BTreeSet::new();
        let mut task_ids: HashMap<TaskId, String> = HashMap::new();
        let mut table = OutputTable::new();
        let mut settled = Vec::new();
        let mut cancel_seen = false;

        tracing::info!(nodes = plan.order.len(), max_concurrency = self.config.max_concurrency, "Starting apply");

        loop {
            if !self.cancel.is_cancelled() {
                for id in std::mem::take(&mut ready) {
                    let Some(node) = plan.node(&id) else {
                        continue;
                    };
                    let resolver = |placeholder: &Placeholder| -> Result<Option<Value>, StackError> {
                        Ok(match placeholder {
                            Placeholder::Output(reference) => table.resolve_ref(plan, reference),
                            Placeholder::Param(_) => None,
                        })
                    };
                    match ResolvedNode::resolve(node, &resolver) {
                        Ok(resolved) => {
                            let task = NodeTask {
                                client: Arc::clone(&self.client),
                                state: Arc::clone(&self.state),
                                policy: self.config.retry.clone(),
                                cancel: self.cancel.clone(),
                                semaphore: Arc::clone(&semaphore),
                                scope: plan.scope_id.clone(),
                                prior: applied.get(&id).cloned(),
                                fetch_keys: needs_keys.contains(&id),
                                node: resolved,
                            };
                            tracing::debug!(node = %id, "Spawning node");
                            let task_id = id.clone();
                            let handle = tasks.spawn(async move {
                                let result = AssertUnwindSafe(task.run()).catch_unwind().await.unwrap_or_else(|_| {
                                    Err(StackError::Other {
                                        message: format!("Applying '{task_id}' panicked"),
                                    })
                                });
                                (task_id, result)
                            });
                            task_ids.insert(handle.id(), id.clone());
                            in_flight.insert(id);
                        }
                        Err(error) => {
                            self.record_failure(plan, &id, error, &mut statuses, &mut settled);
                        }
                    }
                }
                self.progress.set_message(in_flight.iter().cloned().collect::<Vec<_>>().join(", "));
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                () = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    tracing::warn!(in_flight = in_flight.len(), "Cancellation requested; waiting for in-flight nodes");
                    continue;
                }
                joined = tasks.join_next_with_id() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let Some((id, result)) = settle_joined(&mut task_ids, joined) else {
                continue;
            };
            in_flight.remove(&id);
            self.progress.inc(1);

            match result {
                Ok(NodeOutcome::Applied {
                    action,
                    outputs,
                }) => {
                    tracing::info!(node = %id, %action, "Node applied");
                    self.progress.println(format!("✓ {id} {action}"));
                    table.insert(id.clone(), outputs);
                    statuses.insert(id.clone(), NodeStatus::Applied {
                        action,
                    });
                    for dependent in plan.graph.direct_dependents(&id) {
                        if let Some(count) = waiting.get_mut(dependent.as_str()) {
                            *count = count.saturating_sub(1);
                            if *count == 0 && !statuses.contains_key(&dependent) {
                                ready.insert(dependent);
                            }
                        }
                    }
                    settled.push(id);
                }
                Ok(NodeOutcome::Cancelled) => {
                    statuses.insert(id, NodeStatus::Skipped {
                        reason: "cancelled".to_string(),
                    });
                }
                Err(error) => self.record_failure(plan, &id, error, &mut statuses, &mut settled),
            }
        }

        let cancelled = self.cancel.is_cancelled();
        for id in &plan.order {
            statuses.entry(id.clone()).or_insert_with(|| NodeStatus::Skipped {
                reason: if cancelled { "cancelled".to_string() } else { "not started".to_string() },
            });
        }
        self.progress.finish_and_clear();

        let report = ApplyReport {
            run_id,
            scope_id: plan.scope_id.clone(),
            statuses,
            settled,
            table,
        };
        tracing::info!(
            changed = report.change_count(),
            failed = report.failed().len(),
            skipped = report.skipped().len(),
            "Apply finished"
        );
        Ok(report)
    }

    fn record_failure(
        &self,
        plan: &Plan,
        id: &str,
        error: StackError,
        statuses: &mut BTreeMap<String, NodeStatus>,
        settled: &mut Vec<String>,
    ) {
        tracing::error!(node = %id, "Node failed: {error}");
        self.progress.println(format!("✗ {id} failed"));
        statuses.insert(id.to_string(), NodeStatus::Failed {
            error,
        });
        settled.push(id.to_string());
        for dependent in plan.graph.transitive_dependents(id) {
            statuses.entry(dependent).or_insert_with(|| NodeStatus::Skipped {
                reason: format!("dependency '{id}' failed"),
            });
        }
    }
}

type JoinedNode = (String, Result<NodeOutcome, StackError>);

/// Maps a finished worker back to its node. A worker that was aborted or
/// otherwise ended without returning becomes a failure of the node it ran.
fn settle_joined(
    task_ids: &mut HashMap<TaskId, String>,
    joined: Result<(TaskId, JoinedNode), JoinError>,
) -> Option<JoinedNode> {
    match joined {
        Ok((task_id, joined)) => {
            task_ids.remove(&task_id);
            Some(joined)
        }
        Err(join_error) => {
            let Some(id) = task_ids.remove(&join_error.id()) else {
                tracing::error!("Unknown node task ended abnormally: {join_error}");
                return None;
            };
            let error = StackError::Other {
                message: format!("Applying '{id}' ended abnormally: {join_error}"),
            };
            Some((id, Err(error)))
        }
    }
}

/// Everything a worker needs; moved into the task.
struct NodeTask {
    client: Arc<dyn ProvisioningClient>,
    state: Arc<dyn StateStore>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    scope: String,
    node: ResolvedNode,
    prior: Option<AppliedState>,
    fetch_keys: bool,
}

impl NodeTask {
    async fn run(self) -> Result<NodeOutcome, StackError> {
        let _permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(NodeOutcome::Cancelled),
            permit = self.semaphore.acquire() => permit.map_err(|_| StackError::Other {
                message: "executor semaphore closed".to_string(),
            })?,
        };
        let id = self.node.id.clone();

        let change = diff(&self.node, self.prior.as_ref())?;
        tracing::debug!(node = %id, %change, "Convergence check");

        let (action, provider_id, provider_outputs) = match (&change, &self.prior) {
            (Change::NoOp, Some(prior)) => (ApplyAction::Unchanged, prior.provider_id.clone(), prior.outputs.clone()),
            _ => {
                let request = ApplyRequest {
                    scope: self.scope.clone(),
                    logical_id: id.clone(),
                    resource_type: self.node.resource_type.clone(),
                    name: self.node.name.clone(),
                    location: self.node.location.clone(),
                    tags: self.node.tags.clone(),
                    properties: self.node.properties.clone(),
                    mode: if self.prior.is_some() { ApplyMode::Update } else { ApplyMode::Create },
                    provider_id: self.prior.as_ref().map(|p| p.provider_id.clone()),
                };
                let outcome = apply_with_retry(self.client.as_ref(), request, &self.policy, &self.cancel)
                    .await
                    .map_err(|e| e.into_stack_error(&id))?;
                let action = match outcome.mode {
                    ApplyMode::Create => ApplyAction::Created,
                    ApplyMode::Update => ApplyAction::Updated,
                };
                let response = outcome.response;
                let record = self.node.to_applied_state(&response.provider_id, response.outputs.clone());
                self.state.save(&self.scope, record).await.map_err(|e| StackError::Other {
                    message: format!("Failed to record applied state for '{id}': {e:#}"),
                })?;
                (action, response.provider_id, response.outputs)
            }
        };

        let keys = if self.fetch_keys {
            list_keys_with_retry(self.client.as_ref(), &provider_id, &self.policy, &self.cancel)
                .await
                .map_err(|e| e.into_stack_error(&id))?
        } else {
            BTreeMap::new()
        };

        let outputs = NodeOutputs {
            provider_id,
            name: self.node.name.clone(),
            outputs: Value::literal(&serde_json::Value::Object(provider_outputs.into_iter().collect())),
            properties: self.node.properties,
            keys,
        };
        Ok(NodeOutcome::Applied {
            action,
            outputs,
        })
    }
}

/// Nodes whose access keys are referenced by another node or a root output.
pub(crate) fn nodes_needing_keys(plan: &Plan) -> BTreeSet<String> {
    let output_refs = plan.outputs.values().flat_map(|output| match output {
        PlannedOutput::Bound {
            value,
            ..
        } => value.output_refs(),
        PlannedOutput::Excluded {
            ..
        } => BTreeSet::new(),
    });
    plan.nodes
        .values()
        .flat_map(|node| node.references())
        .chain(output_refs)
        .filter(|reference| {
            plan.node(&reference.node).is_some_and(|node| {
                let path = node.output_path(&reference.key);
                path == "keys" || path.starts_with("keys.")
            })
        })
        .map(|reference| reference.node)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlannedNode;
    use crate::state::MemoryStateStore;
    use crate::test_utils::{FakeProvisioner, init_test_logging};
    use std::time::Duration;

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            max_concurrency: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..RetryPolicy::default()
            },
        }
    }

    fn node(id: &str, deps: &[&str]) -> PlannedNode {
        let mut node = PlannedNode::new(id, "Test/things@1");
        node.depends_on = deps.iter().map(ToString::to_string).collect();
        node
    }

    fn executor(client: &Arc<FakeProvisioner>, state: &Arc<MemoryStateStore>) -> Executor {
        Executor::new(client.clone(), state.clone()).with_config(fast_config())
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        init_test_logging(None);
        let plan = Plan::from_nodes(
            "rg",
            vec![node("c", &[]), node("d", &["c"]), node("e", &["d"]), node("f", &[])],
            BTreeMap::new(),
        )
        .unwrap();
        let client = Arc::new(FakeProvisioner::new());
        client.reject("c", "invalid sku");
        let state = Arc::new(MemoryStateStore::new());

        let report = executor(&client, &state).execute(&plan).await.unwrap();
        assert_eq!(report.status("c").unwrap().label(), "failed");
        assert_eq!(report.status("d").unwrap().label(), "skipped");
        assert_eq!(report.status("e").unwrap().label(), "skipped");
        assert!(matches!(
            report.status("f"),
            Some(NodeStatus::Applied {
                action: ApplyAction::Created
            })
        ));
        assert!(matches!(report.status("e"), Some(NodeStatus::Skipped { reason }) if reason.contains("'c'")));
        assert_eq!(client.calls_for("d"), 0);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, StackError::PartialApply { failed: 1, skipped: 2, .. }));
    }

    #[tokio::test]
    async fn test_aborted_worker_fails_its_node() {
        let plan = Plan::from_nodes("rg", vec![node("a", &[]), node("b", &["a"])], BTreeMap::new()).unwrap();
        let client = Arc::new(FakeProvisioner::new());
        let state = Arc::new(MemoryStateStore::new());
        let executor = executor(&client, &state);

        let mut tasks: JoinSet<JoinedNode> = JoinSet::new();
        let handle = tasks.spawn(async {
            std::future::pending::<()>().await;
            ("a".to_string(), Ok(NodeOutcome::Cancelled))
        });
        let mut task_ids = HashMap::from([(handle.id(), "a".to_string())]);
        handle.abort();

        let joined = tasks.join_next_with_id().await.unwrap();
        assert!(joined.is_err());
        let (id, result) = settle_joined(&mut task_ids, joined).unwrap();
        assert_eq!(id, "a");
        assert!(task_ids.is_empty());

        let mut statuses = BTreeMap::new();
        let mut settled = Vec::new();
        executor.record_failure(&plan, &id, result.unwrap_err(), &mut statuses, &mut settled);
        assert!(matches!(statuses.get("a"), Some(NodeStatus::Failed { error }) if error.to_string().contains("'a'")));
        assert!(matches!(statuses.get("b"), Some(NodeStatus::Skipped { reason }) if reason.contains("'a'")));
        assert_eq!(settled, vec!["a"]);
    }

    #[tokio::test]
    async fn test_outputs_thread_into_dependents() {
        let storage = node("storage", &[]);
        let mut sub = node("sub", &[]);
        sub.properties = Value::from_json(serde_json::json!({
            "source": "${nodes.storage.id}",
            "key": "${nodes.storage.keys.primary}",
        }))
        .unwrap();
        let plan = Plan::from_nodes("rg", vec![sub, storage], BTreeMap::new()).unwrap();
        let client = Arc::new(FakeProvisioner::new());
        let state = Arc::new(MemoryStateStore::new());

        let report = executor(&client, &state).execute(&plan).await.unwrap();
        assert!(report.is_success(), "{report}");
        assert_eq!(report.settled, vec!["storage", "sub"]);

        let request = client.last_request("sub").unwrap();
        assert_eq!(request.properties.get_path("source").as_deref(), Some(&Value::string(FakeProvisioner::id_for("storage"))));
        assert!(matches!(request.properties.get_path("key").as_deref(), Some(Value::Secret(_))));
    }

    #[tokio::test]
    async fn test_second_run_is_a_noop() {
        let plan = Plan::from_nodes("rg", vec![node("a", &[]), node("b", &["a"])], BTreeMap::new()).unwrap();
        let client = Arc::new(FakeProvisioner::new());
        let state = Arc::new(MemoryStateStore::new());

        let first = executor(&client, &state).execute(&plan).await.unwrap();
        assert_eq!(first.change_count(), 2);
        let second = executor(&client, &state).execute(&plan).await.unwrap();
        assert_eq!(second.change_count(), 0);
        assert_eq!(second.with_action(ApplyAction::Unchanged).len(), 2);
        assert_eq!(client.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_throttling_is_retried() {
        let plan = Plan::from_nodes("rg", vec![node("a", &[])], BTreeMap::new()).unwrap();
        let client = Arc::new(FakeProvisioner::new());
        client.throttle("a", 2);
        let state = Arc::new(MemoryStateStore::new());

        let report = executor(&client, &state).execute(&plan).await.unwrap();
        assert!(report.is_success());
        assert_eq!(client.calls_for("a"), 3);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_unstarted_nodes() {
        let plan = Plan::from_nodes("rg", vec![node("a", &[]), node("b", &["a"])], BTreeMap::new()).unwrap();
        let client = Arc::new(FakeProvisioner::new());
        let state = Arc::new(MemoryStateStore::new());
        let executor = executor(&client, &state);
        executor.cancellation_token().cancel();

        let report = executor.execute(&plan).await.unwrap();
        assert!(matches!(report.status("a"), Some(NodeStatus::Skipped { reason }) if reason == "cancelled"));
        assert!(matches!(report.status("b"), Some(NodeStatus::Skipped { reason }) if reason == "cancelled"));
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let nodes: Vec<PlannedNode> = (0..8).map(|i| node(&format!("n{i}"), &[])).collect();
        let plan = Plan::from_nodes("rg", nodes, BTreeMap::new()).unwrap();
        let client = Arc::new(FakeProvisioner::new().with_latency(Duration::from_millis(20)));
        let state = Arc::new(MemoryStateStore::new());
        let config = ExecutorConfig {
            max_concurrency: 2,
            ..fast_config()
        };

        let report = Executor::new(client.clone(), state.clone()).with_config(config).execute(&plan).await.unwrap();
        assert!(report.is_success());
        assert!(client.max_in_flight() <= 2);
    }

    #[test]
    fn test_nodes_needing_keys() {
        let storage = node("storage", &[]);
        let mut app = node("app", &[]);
        app.properties = Value::from_json(serde_json::json!({ "conn": "${nodes.storage.keys.connectionString}" })).unwrap();
        let plan = Plan::from_nodes("rg", vec![storage, app], BTreeMap::new()).unwrap();
        assert_eq!(nodes_needing_keys(&plan), BTreeSet::from(["storage".to_string()]));
    }
}
