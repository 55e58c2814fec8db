use std::sync::Arc;
use std::time::Duration;

use stackplan::core::{StackError, Value};
use stackplan::executor::{Executor, ExecutorConfig};
use stackplan::naming::scope_hash;
use stackplan::outputs::{AbsentReason, OutputValue, aggregate};
use stackplan::planner::{PlanInput, plan};
use stackplan::provider::RetryPolicy;
use stackplan::state::MemoryStateStore;
use stackplan::test_utils::{BlueprintFixture, FakeProvisioner};

const SCOPE: &str = "/subscriptions/0000/resourceGroups/ewa-rg";

fn input() -> PlanInput {
    let tags = Value::Map([("PersonResponsible".to_string(), Value::string("alice"))].into_iter().collect());
    PlanInput::new(SCOPE)
        .with_param("prefix", "ewa")
        .with_param("environment", "prod")
        .with_context("location", "westeurope")
        .with_context("tags", tags)
}

fn executor(client: &Arc<FakeProvisioner>) -> Executor {
    Executor::new(client.clone(), Arc::new(MemoryStateStore::new())).with_config(ExecutorConfig {
        max_concurrency: 8,
        retry: RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        },
    })
}

#[test]
fn test_feature_x_disabled_excludes_its_nodes() {
    let blueprint = BlueprintFixture::ewa().parse();
    let plan = plan(&blueprint, &input().with_param("deployFeatureX", false)).unwrap();

    for id in ["featureX", "featureX/registry", "featureX/environment", "featureX/app"] {
        assert!(plan.is_excluded(id), "{id} should be excluded");
        assert!(!plan.order.iter().any(|n| n == id));
    }
    assert!(plan.node("openai/account").is_some());
}

#[test]
fn test_computed_names_carry_environment_and_scope_hash() {
    let blueprint = BlueprintFixture::ewa().parse();
    let plan = plan(&blueprint, &input()).unwrap();
    let hash = scope_hash(SCOPE, 8);

    assert_eq!(plan.node("storage").unwrap().name, format!("ewastgprod{hash}"));
    assert_eq!(plan.node("search").unwrap().name, format!("ewa-search-prod-{hash}"));
    assert!(plan.node("storage").unwrap().name.len() <= 24);
}

#[test]
fn test_location_and_tags_reach_module_resources() {
    let blueprint = BlueprintFixture::ewa().parse();
    let plan = plan(&blueprint, &input()).unwrap();
    let account = plan.node("openai/account").unwrap();

    assert_eq!(account.location, Some(Value::string("westeurope")));
    let tags = account.tags.as_map().unwrap();
    assert_eq!(tags.get("PersonResponsible"), Some(&Value::string("alice")));
    assert_eq!(tags.get("project"), Some(&Value::string("ewa")));
}

#[test]
fn test_implicit_dependencies_order_the_stack() {
    let blueprint = BlueprintFixture::ewa().parse();
    let plan = plan(&blueprint, &input().with_param("deployFeatureX", true)).unwrap();
    let position = |id: &str| plan.order.iter().position(|n| n == id).unwrap();

    assert!(position("storage") < position("events"));
    assert!(position("storage") < position("processor"));
    assert!(position("documents") < position("processor"));
    assert!(position("processor") < position("blobCreated"));
    assert!(position("events") < position("blobCreated"));
    assert!(position("search") < position("featureX/app"));
    assert!(position("featureX/environment") < position("featureX/app"));
    assert!(position("openai/account") < position("openai/embeddings"));
}

#[tokio::test]
async fn test_feature_x_outputs_absent_not_empty() {
    let blueprint = BlueprintFixture::ewa().parse();
    let plan = plan(&blueprint, &input().with_param("deployFeatureX", false)).unwrap();
    let client = Arc::new(FakeProvisioner::new());
    let report = executor(&client).execute(&plan).await.unwrap();
    assert!(report.is_success(), "{report}");

    let outputs = aggregate(&plan, &report.table, &report);
    assert!(matches!(
        outputs.get("mcpUrl"),
        Some(OutputValue::Absent {
            reason: AbsentReason::Excluded(_)
        })
    ));
    assert!(outputs.values(false).get("mcpUrl").is_none());
    assert!(outputs.get("searchEndpoint").is_some_and(OutputValue::is_present));
    assert!(matches!(outputs.get("openaiKey"), Some(OutputValue::Present { secure: true, .. })));
}

#[tokio::test]
async fn test_keys_thread_into_dependents_as_secrets() {
    let blueprint = BlueprintFixture::ewa().parse();
    let plan = plan(&blueprint, &input().with_param("deployFeatureX", true)).unwrap();
    let client = Arc::new(FakeProvisioner::new());
    let report = executor(&client).execute(&plan).await.unwrap();
    assert!(report.is_success(), "{report}");

    let processor = client.last_request("processor").unwrap();
    let storage_conn = processor.properties.get_path("appSettings.AzureWebJobsStorage").unwrap();
    assert!(matches!(*storage_conn, Value::Secret(_)));
    assert!(!format!("{processor:?}").contains("AccountKey=key-storage"));
    assert_eq!(
        storage_conn.expose(),
        serde_json::json!("Endpoint=https://storage.fake;AccountKey=key-storage")
    );

    let app = client.last_request("featureX/app").unwrap();
    let search_name = &plan.node("search").unwrap().name;
    assert_eq!(
        app.properties.get_path("env.SEARCH_ENDPOINT").as_deref(),
        Some(&Value::string(format!("https://{search_name}.fake")))
    );
    assert!(matches!(app.properties.get_path("env.SEARCH_KEY").as_deref(), Some(Value::Secret(_))));
}

#[test]
fn test_existing_ai_endpoint_replaces_module() {
    let blueprint = BlueprintFixture::ewa().parse();
    let plan = plan(
        &blueprint,
        &input()
            .with_param("deployOpenAI", false)
            .with_param("existingOpenAIEndpoint", "https://shared-ai.example")
            .with_param("existingOpenAIKey", "k3y"),
    )
    .unwrap();

    assert!(plan.is_excluded("openai/account"));
    let processor = plan.node("processor").unwrap();
    assert_eq!(
        processor.properties.get_path("appSettings.OPENAI_ENDPOINT").as_deref(),
        Some(&Value::string("https://shared-ai.example"))
    );
    assert!(matches!(processor.properties.get_path("appSettings.OPENAI_KEY").as_deref(), Some(Value::Secret(_))));
}

#[test]
fn test_missing_location_is_reported_before_apply() {
    let blueprint = BlueprintFixture::ewa().parse();
    let err = plan(&blueprint, &PlanInput::new(SCOPE)).unwrap_err();
    assert!(matches!(err, StackError::MissingRequiredParameter { ref name, .. } if name == "location"), "{err}");
}
