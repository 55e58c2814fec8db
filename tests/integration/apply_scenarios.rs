use std::sync::Arc;
use std::time::Duration;

use stackplan::blueprint::Blueprint;
use stackplan::core::{StackError, Value};
use stackplan::executor::{ApplyAction, Executor, ExecutorConfig, NodeStatus};
use stackplan::outputs::{AbsentReason, OutputValue, aggregate};
use stackplan::planner::{PlanInput, plan};
use stackplan::provider::{ConflictPolicy, RetryPolicy};
use stackplan::state::{MemoryStateStore, StateStore};
use stackplan::test_utils::{BlueprintFixture, FakeProvisioner, init_test_logging};

fn fast(conflict: ConflictPolicy) -> ExecutorConfig {
    ExecutorConfig {
        max_concurrency: 4,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            conflict,
        },
    }
}

fn executor(client: &Arc<FakeProvisioner>, state: &Arc<MemoryStateStore>) -> Executor {
    Executor::new(client.clone(), state.clone()).with_config(fast(ConflictPolicy::Retry))
}

#[tokio::test]
async fn test_reference_orders_storage_before_subscription() {
    init_test_logging(None);
    let blueprint = BlueprintFixture::storage_with_subscription().parse();
    let plan = plan(&blueprint, &PlanInput::new("rg")).unwrap();
    assert_eq!(plan.order, vec!["storage", "subscription"]);

    let client = Arc::new(FakeProvisioner::new());
    let state = Arc::new(MemoryStateStore::new());
    let report = executor(&client, &state).execute(&plan).await.unwrap();

    assert!(report.is_success(), "{report}");
    assert_eq!(client.call_order(), vec!["storage", "subscription"]);
    let request = client.last_request("subscription").unwrap();
    assert_eq!(request.properties.get_path("source").as_deref(), Some(&Value::string("/fake/storage")));

    let outputs = aggregate(&plan, &report.table, &report);
    assert!(matches!(
        outputs.get("storageId"),
        Some(OutputValue::Present { value, secure: false }) if value == &Value::string("/fake/storage")
    ));
}

#[tokio::test]
async fn test_failed_node_skips_dependents_and_spares_independent() {
    let blueprint = BlueprintFixture::chain_with_independent().parse();
    let plan = plan(&blueprint, &PlanInput::new("rg")).unwrap();
    let client = Arc::new(FakeProvisioner::new());
    client.reject("c", "SKU not available in region");
    let state = Arc::new(MemoryStateStore::new());

    let report = executor(&client, &state).execute(&plan).await.unwrap();

    assert!(matches!(report.status("c"), Some(NodeStatus::Failed { error: StackError::ProvisioningRejected { .. } })));
    assert_eq!(report.status("d").unwrap().label(), "skipped");
    assert_eq!(report.status("e").unwrap().label(), "skipped");
    assert!(matches!(report.status("f"), Some(NodeStatus::Applied { action: ApplyAction::Created })));
    assert_eq!(client.calls_for("c"), 1, "rejected calls are not retried");
    assert_eq!(client.calls_for("d") + client.calls_for("e"), 0);
    assert_eq!(state.len("rg").await, 1);

    let err = report.into_result().unwrap_err();
    assert!(err.to_string().contains("1 failed and 2 skipped"), "{err}");
}

#[tokio::test]
async fn test_cycle_rejected_before_any_apply() {
    let blueprint = BlueprintFixture::cycle().parse();
    match plan(&blueprint, &PlanInput::new("rg")) {
        Err(StackError::CyclicDependency {
            cycle,
        }) => assert!(cycle == "a → b → a" || cycle == "b → a → b", "{cycle}"),
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reapply_converges_without_provider_calls() {
    let blueprint = BlueprintFixture::ewa().parse();
    let input = PlanInput::new("/rg/ewa")
        .with_param("environment", "prod")
        .with_context("location", "westeurope");
    let plan = plan(&blueprint, &input).unwrap();
    let client = Arc::new(FakeProvisioner::new());
    let state = Arc::new(MemoryStateStore::new());

    let first = executor(&client, &state).execute(&plan).await.unwrap();
    assert!(first.is_success(), "{first}");
    let calls = client.total_calls();
    assert_eq!(calls, plan.order.len());

    let second = executor(&client, &state).execute(&plan).await.unwrap();
    assert!(second.is_success(), "{second}");
    assert_eq!(second.change_count(), 0);
    assert_eq!(client.total_calls(), calls);
}

#[tokio::test]
async fn test_property_change_updates_in_place() {
    let v1 = Blueprint::from_toml_str("[[resources]]\nid = \"a\"\ntype = \"T/x@1\"\nproperties = { sku = \"basic\" }").unwrap();
    let v2 = Blueprint::from_toml_str("[[resources]]\nid = \"a\"\ntype = \"T/x@1\"\nproperties = { sku = \"standard\" }").unwrap();
    let client = Arc::new(FakeProvisioner::new());
    let state = Arc::new(MemoryStateStore::new());

    executor(&client, &state).execute(&plan(&v1, &PlanInput::new("rg")).unwrap()).await.unwrap();
    let report = executor(&client, &state).execute(&plan(&v2, &PlanInput::new("rg")).unwrap()).await.unwrap();
    assert!(matches!(report.status("a"), Some(NodeStatus::Applied { action: ApplyAction::Updated })));
    assert_eq!(state.load("rg", "a").await.unwrap().unwrap().properties["sku"], "standard");
}

#[tokio::test]
async fn test_update_of_deleted_resource_becomes_create() {
    let v1 = Blueprint::from_toml_str("[[resources]]\nid = \"a\"\ntype = \"T/x@1\"\nproperties = { n = 1 }").unwrap();
    let v2 = Blueprint::from_toml_str("[[resources]]\nid = \"a\"\ntype = \"T/x@1\"\nproperties = { n = 2 }").unwrap();
    let client = Arc::new(FakeProvisioner::new());
    let state = Arc::new(MemoryStateStore::new());

    executor(&client, &state).execute(&plan(&v1, &PlanInput::new("rg")).unwrap()).await.unwrap();
    client.forget("a");
    let report = executor(&client, &state).execute(&plan(&v2, &PlanInput::new("rg")).unwrap()).await.unwrap();
    assert!(matches!(report.status("a"), Some(NodeStatus::Applied { action: ApplyAction::Created })));
}

#[tokio::test]
async fn test_location_change_requires_replacement() {
    let blueprint = Blueprint::from_toml_str(
        "[parameters.location]\ntype = \"string\"\n\n[[resources]]\nid = \"a\"\ntype = \"T/x@1\"",
    )
    .unwrap();
    let client = Arc::new(FakeProvisioner::new());
    let state = Arc::new(MemoryStateStore::new());

    let west = PlanInput::new("rg").with_context("location", "westeurope");
    executor(&client, &state).execute(&plan(&blueprint, &west).unwrap()).await.unwrap();

    let east = PlanInput::new("rg").with_context("location", "eastus");
    let report = executor(&client, &state).execute(&plan(&blueprint, &east).unwrap()).await.unwrap();
    assert!(matches!(
        report.status("a"),
        Some(NodeStatus::Failed { error: StackError::ReplacementRequired { field, .. } }) if field == "location"
    ));
    assert_eq!(client.calls_for("a"), 1);
}

#[tokio::test]
async fn test_conflict_policy() {
    let blueprint = Blueprint::from_toml_str("[[resources]]\nid = \"a\"\ntype = \"T/x@1\"").unwrap();
    let plan = plan(&blueprint, &PlanInput::new("rg")).unwrap();

    let client = Arc::new(FakeProvisioner::new());
    client.conflict("a", 1);
    let state = Arc::new(MemoryStateStore::new());
    let report = executor(&client, &state).execute(&plan).await.unwrap();
    assert!(report.is_success());
    assert_eq!(client.calls_for("a"), 2);

    let client = Arc::new(FakeProvisioner::new());
    client.conflict("a", 1);
    let state = Arc::new(MemoryStateStore::new());
    let report = Executor::new(client.clone(), state)
        .with_config(fast(ConflictPolicy::FailFast))
        .execute(&plan)
        .await
        .unwrap();
    assert!(matches!(
        report.status("a"),
        Some(NodeStatus::Failed { error: StackError::ProvisioningConflict { .. } })
    ));
    assert_eq!(client.calls_for("a"), 1);
}

#[tokio::test]
async fn test_throttling_exhausts_retries() {
    let blueprint = Blueprint::from_toml_str("[[resources]]\nid = \"a\"\ntype = \"T/x@1\"").unwrap();
    let plan = plan(&blueprint, &PlanInput::new("rg")).unwrap();
    let client = Arc::new(FakeProvisioner::new());
    client.throttle("a", 10);
    let state = Arc::new(MemoryStateStore::new());

    let report = executor(&client, &state).execute(&plan).await.unwrap();
    assert!(matches!(
        report.status("a"),
        Some(NodeStatus::Failed { error: StackError::ProvisioningThrottled { .. } })
    ));
    assert_eq!(client.calls_for("a"), 3);
}

#[tokio::test]
async fn test_cancel_mid_run_skips_remaining_nodes() {
    let blueprint = BlueprintFixture::chain_with_independent().parse();
    let plan = plan(&blueprint, &PlanInput::new("rg")).unwrap();
    let client = Arc::new(FakeProvisioner::new().with_latency(Duration::from_millis(100)));
    let state = Arc::new(MemoryStateStore::new());
    let executor = executor(&client, &state);
    let cancel = executor.cancellation_token();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });
    let report = executor.execute(&plan).await.unwrap();
    canceller.await.unwrap();

    // c and f were in flight and settle; d and e never start
    assert_eq!(report.status("c").unwrap().label(), "applied");
    assert_eq!(report.status("f").unwrap().label(), "applied");
    for id in ["d", "e"] {
        assert!(matches!(report.status(id), Some(NodeStatus::Skipped { reason }) if reason == "cancelled"));
    }
    assert_eq!(client.total_calls(), 2);
}

#[tokio::test]
async fn test_secure_output_is_redacted() {
    let blueprint = Blueprint::from_toml_str(
        r#"
[[resources]]
id = "search"
type = "Microsoft.Search/searchServices@2023-11-01"

[outputs]
searchKey = { source = "search.keys.primary", secure = true }
searchId = "search.id"
"#,
    )
    .unwrap();
    let plan = plan(&blueprint, &PlanInput::new("rg")).unwrap();
    let client = Arc::new(FakeProvisioner::new());
    let state = Arc::new(MemoryStateStore::new());
    let report = executor(&client, &state).execute(&plan).await.unwrap();
    let outputs = aggregate(&plan, &report.table, &report);

    let rendered = outputs.render(false).to_string();
    assert!(!rendered.contains("key-search"), "{rendered}");
    assert!(!format!("{outputs:?}").contains("key-search"));
    assert!(!outputs.to_string().contains("key-search"));
    assert_eq!(outputs.values(true)["searchKey"], "key-search");

    let recorded = state.load("rg", "search").await.unwrap().unwrap();
    assert!(!serde_json::to_string(&recorded).unwrap().contains("key-search"));
}

#[tokio::test]
async fn test_field_of_secure_object_stays_secret() {
    let blueprint = Blueprint::from_toml_str(
        r#"
[parameters.creds]
type = "object"
secure = true

[[resources]]
id = "vault"
type = "Microsoft.KeyVault/vaults@2023-07-01"
properties = { creds = "${params.creds}" }

[[resources]]
id = "app"
type = "Microsoft.Web/sites@2023-01-01"
properties = { password = "${nodes.vault.creds.password}" }

[outputs]
pw = "vault.creds.password"
"#,
    )
    .unwrap();
    let creds = Value::Map([("password".to_string(), Value::string("hunter2"))].into_iter().collect());
    let plan = plan(&blueprint, &PlanInput::new("rg").with_param("creds", creds)).unwrap();
    let client = Arc::new(FakeProvisioner::new());
    let state = Arc::new(MemoryStateStore::new());
    let report = executor(&client, &state).execute(&plan).await.unwrap();
    assert!(report.is_success(), "{report}");

    let request = client.last_request("app").unwrap();
    assert!(matches!(request.properties.get_path("password").as_deref(), Some(Value::Secret(_))));
    assert!(!format!("{request:?}").contains("hunter2"));

    let outputs = aggregate(&plan, &report.table, &report);
    assert!(matches!(outputs.get("pw"), Some(OutputValue::Present { secure: true, .. })));
    let rendered = outputs.render(false).to_string();
    assert!(!rendered.contains("hunter2"), "{rendered}");
    assert_eq!(outputs.values(true)["pw"], "hunter2");
}

#[tokio::test]
async fn test_default_derived_from_secure_parameter_is_redacted() {
    let blueprint = Blueprint::from_toml_str(
        r#"
[parameters.apiKey]
type = "string"
secure = true

[parameters.connection]
type = "string"
default = "key=${params.apiKey}"

[[resources]]
id = "svc"
type = "Microsoft.Web/sites@2023-01-01"
properties = { connection = "${params.connection}" }

[outputs]
connection = "svc.connection"
"#,
    )
    .unwrap();
    let plan = plan(&blueprint, &PlanInput::new("rg").with_param("apiKey", "hunter2")).unwrap();
    let client = Arc::new(FakeProvisioner::new());
    let state = Arc::new(MemoryStateStore::new());
    let report = executor(&client, &state).execute(&plan).await.unwrap();
    assert!(report.is_success(), "{report}");

    let request = client.last_request("svc").unwrap();
    let connection = request.properties.get_path("connection").unwrap();
    assert!(connection.contains_secret());
    assert_eq!(connection.expose(), serde_json::json!("key=hunter2"));

    let outputs = aggregate(&plan, &report.table, &report);
    assert!(!outputs.render(false).to_string().contains("hunter2"));
    let recorded = state.load("rg", "svc").await.unwrap().unwrap();
    assert!(!serde_json::to_string(&recorded).unwrap().contains("hunter2"));
}

#[tokio::test]
async fn test_outputs_over_failed_nodes_are_absent() {
    let blueprint = Blueprint::from_toml_str(
        r#"
[[resources]]
id = "a"
type = "T/x@1"

[[resources]]
id = "b"
type = "T/x@1"
properties = { upstream = "${nodes.a.id}" }

[outputs]
aId = "a.id"
bId = "b.id"
"#,
    )
    .unwrap();
    let plan = plan(&blueprint, &PlanInput::new("rg")).unwrap();
    let client = Arc::new(FakeProvisioner::new());
    client.reject("a", "quota exceeded");
    let state = Arc::new(MemoryStateStore::new());
    let report = executor(&client, &state).execute(&plan).await.unwrap();
    let outputs = aggregate(&plan, &report.table, &report);

    assert!(matches!(
        outputs.get("aId"),
        Some(OutputValue::Absent { reason: AbsentReason::Failed(node) }) if node == "a"
    ));
    assert!(matches!(
        outputs.get("bId"),
        Some(OutputValue::Absent { reason: AbsentReason::Skipped(node) }) if node == "b"
    ));
    assert_eq!(outputs.values(false), serde_json::Value::Object(serde_json::Map::new()));
}
