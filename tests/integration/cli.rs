use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use stackplan::test_utils::BlueprintFixture;

use crate::common::TestProject;

const SCOPE: &str = "/rg/ewa-cli";

fn ewa_project() -> Result<TestProject> {
    let project = TestProject::new()?;
    project.write_blueprint("stackplan.toml", &BlueprintFixture::ewa().content)?;
    Ok(project)
}

fn deploy_args<'a>(command: &'a str, extra: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec![command, "--scope", SCOPE, "--location", "westeurope", "--owner", "alice"];
    args.extend_from_slice(extra);
    args
}

#[test]
fn test_plan_lists_creates_and_exclusions() -> Result<()> {
    let project = ewa_project()?;
    let output = project.run_stackplan(&deploy_args("plan", &[]))?;

    output
        .assert_success()
        .assert_stdout_contains("+ storage")
        .assert_stdout_contains("featureX excluded")
        .assert_stdout_contains("node(s) to apply");
    Ok(())
}

#[test]
fn test_plan_json_reports_order_and_pending_nodes() -> Result<()> {
    let project = ewa_project()?;
    let output = project.run_stackplan(&deploy_args("plan", &["--json"]))?;
    output.assert_success();

    let json = output.json();
    assert_eq!(json["scope"], SCOPE);
    assert_eq!(json["converged"], false);
    let order: Vec<&str> = json["order"].as_array().unwrap().iter().filter_map(|v| v.as_str()).collect();
    let storage = order.iter().position(|id| *id == "storage").unwrap();
    let events = order.iter().position(|id| *id == "events").unwrap();
    assert!(storage < events);

    let events_node = json["nodes"].as_array().unwrap().iter().find(|n| n["id"] == "events").unwrap();
    assert_eq!(events_node["action"], "pending");
    assert_eq!(events_node["dependsOn"][0], "storage");
    Ok(())
}

#[test]
fn test_apply_twice_converges() -> Result<()> {
    let project = ewa_project()?;

    project
        .run_stackplan(&deploy_args("apply", &[]))?
        .assert_success()
        .assert_stdout_contains("✓ storage created")
        .assert_stdout_contains("searchKey = <redacted> (secure)")
        .assert_stdout_contains("mcpUrl: absent");

    project
        .run_stackplan(&deploy_args("apply", &[]))?
        .assert_success()
        .assert_stdout_contains("Applied 0 change(s)");

    project
        .run_stackplan(&deploy_args("plan", &["--detailed-exitcode"]))?
        .assert_success()
        .assert_stdout_contains("Nothing to apply");
    Ok(())
}

#[test]
fn test_detailed_exitcode_signals_pending_changes() -> Result<()> {
    let project = ewa_project()?;
    let output = project.run_stackplan(&deploy_args("plan", &["--detailed-exitcode"]))?;
    assert_eq!(output.code, Some(2));
    Ok(())
}

#[test]
fn test_outputs_reads_recorded_state() -> Result<()> {
    let project = ewa_project()?;
    project.run_stackplan(&deploy_args("apply", &[]))?.assert_success();

    let output = project.run_stackplan(&deploy_args("outputs", &["--json"]))?;
    output.assert_success();
    let json = output.json();
    assert!(json["storageAccountName"]["value"].as_str().unwrap().starts_with("ewastg"));
    assert_eq!(json["searchKey"]["secure"], true);
    assert_ne!(json["searchKey"]["value"], serde_json::Value::Null);
    assert!(json["mcpUrl"]["absent"].as_str().unwrap().starts_with("excluded"));

    let revealed = project.run_stackplan(&deploy_args("outputs", &["--show-secrets"]))?;
    revealed.assert_success();
    assert!(revealed.json()["searchKey"].as_str().is_some());
    Ok(())
}

#[test]
fn test_outputs_before_apply_are_absent() -> Result<()> {
    let project = ewa_project()?;
    let output = project.run_stackplan(&deploy_args("outputs", &["--json"]))?;
    output.assert_success();
    assert!(output.json()["searchEndpoint"]["absent"].is_string());
    Ok(())
}

#[test]
fn test_graph_prints_order_and_tree() -> Result<()> {
    let project = ewa_project()?;
    project
        .run_stackplan(&deploy_args("graph", &[]))?
        .assert_success()
        .assert_stdout_contains("Apply order:")
        .assert_stdout_contains("blobCreated");

    let json = project.run_stackplan(&deploy_args("graph", &["--json"]))?.json();
    let edges = json["edges"].as_array().unwrap();
    assert!(edges.iter().any(|e| e["from"] == "blobCreated" && e["to"] == "events"));
    assert!(json["excluded"].as_array().unwrap().iter().any(|id| id == "featureX"));

    project
        .run_stackplan(&deploy_args("graph", &["--root", "nope"]))?
        .assert_failure()
        .assert_stderr_contains("not part of the plan");
    Ok(())
}

#[test]
fn test_cycle_fails_before_any_provider_call() -> Result<()> {
    let project = TestProject::new()?;
    let fixture = BlueprintFixture::cycle();
    project.write_blueprint("cycle.toml", &fixture.content)?;

    project
        .run_stackplan(&["apply", "--blueprint", "cycle.toml", "--scope", SCOPE])?
        .assert_failure()
        .assert_stderr_contains("Circular dependency detected");

    let created = std::fs::read_dir(project.provider_path()).map(|dir| dir.count()).unwrap_or(0);
    assert_eq!(created, 0);
    Ok(())
}

#[test]
fn test_output_file_omits_secrets() -> Result<()> {
    let project = ewa_project()?;
    project
        .run_stackplan(&deploy_args("apply", &["--environment", "prod", "--output-file"]))?
        .assert_success()
        .assert_stdout_contains("deployment-prod.json");

    let path = project.project_path().join("deployment-prod.json");
    let info: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    assert_eq!(info["scope"], SCOPE);
    assert_eq!(info["environment"], "prod");
    assert_eq!(info["outputs"]["searchKey"], "<redacted>");
    assert!(info["outputs"]["storageAccountName"].as_str().unwrap().contains("prod"));
    assert!(info["outputs"].get("mcpUrl").is_none());
    Ok(())
}

#[test]
fn test_existing_ai_requires_key() -> Result<()> {
    let project = ewa_project()?;
    project
        .run_stackplan(&deploy_args("plan", &["--use-existing-ai", "--ai-endpoint", "https://ai.example"]))?
        .assert_failure();
    Ok(())
}

#[test]
fn test_existing_ai_excludes_module() -> Result<()> {
    let project = ewa_project()?;
    let output = project.run_stackplan(&deploy_args(
        "plan",
        &["--use-existing-ai", "--ai-endpoint", "https://ai.example", "--ai-key", "secret"],
    ))?;
    output.assert_success().assert_stdout_contains("openai excluded");
    assert!(!output.stdout.contains("secret"));
    Ok(())
}

#[test]
fn test_unknown_parameter_is_reported() -> Result<()> {
    let project = ewa_project()?;
    project
        .run_stackplan(&deploy_args("plan", &["--set", "bogus=1"]))?
        .assert_failure()
        .assert_stderr_contains("Unknown parameter 'bogus'");
    Ok(())
}

#[test]
fn test_help_lists_commands() {
    let mut cmd = Command::cargo_bin("stackplan").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("apply"))
        .stdout(predicate::str::contains("outputs"));
}

#[test]
fn test_missing_blueprint_fails() {
    let temp = tempfile::TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("stackplan").unwrap();
    cmd.current_dir(temp.path())
        .env("NO_COLOR", "1")
        .args(["plan", "--scope", SCOPE])
        .assert()
        .failure()
        .stderr(predicate::str::contains("stackplan.toml"));
}
