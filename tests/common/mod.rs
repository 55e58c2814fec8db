//! Common test utilities for stackplan integration tests
//!
//! [`TestProject`] owns a temporary directory with its own config, state and
//! provider directories, so CLI runs never touch `~/.stackplan`.

// Not every helper is used by every test module
#![allow(dead_code)]

use anyhow::{Context, Result};
use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Isolated project directory for CLI tests.
pub struct TestProject {
    _temp_dir: TempDir,
    project_dir: PathBuf,
    config_path: PathBuf,
    state_dir: PathBuf,
    provider_dir: PathBuf,
}

impl TestProject {
    /// Create the project and write a config pointing into it.
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let project_dir = temp_dir.path().join("project");
        let state_dir = temp_dir.path().join("state");
        let provider_dir = temp_dir.path().join("provider");
        fs::create_dir_all(&project_dir)?;

        let config_path = temp_dir.path().join("config.toml");
        let config = format!(
            "state_dir = {:?}\nprovider_dir = {:?}\nmax_concurrency = 4\n\n[retry]\nmax_attempts = 2\ninitial_delay_ms = 1\nmax_delay_ms = 5\n",
            state_dir.display().to_string(),
            provider_dir.display().to_string(),
        );
        fs::write(&config_path, config).context("Failed to write test config")?;

        Ok(Self {
            _temp_dir: temp_dir,
            project_dir,
            config_path,
            state_dir,
            provider_dir,
        })
    }

    pub fn project_path(&self) -> &Path {
        &self.project_dir
    }

    pub fn state_path(&self) -> &Path {
        &self.state_dir
    }

    pub fn provider_path(&self) -> &Path {
        &self.provider_dir
    }

    /// Write `content` as `name` in the project directory.
    pub fn write_blueprint(&self, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.project_dir.join(name);
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Run the binary in the project directory with the project's config.
    pub fn run_stackplan(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::cargo_bin("stackplan")?
            .args(args)
            .arg("--config")
            .arg(&self.config_path)
            .current_dir(&self.project_dir)
            .env("NO_COLOR", "1")
            .env("STACKPLAN_NO_PROGRESS", "1")
            .env_remove("RUST_LOG")
            .env_remove("STACKPLAN_SCOPE")
            .env_remove("STACKPLAN_AI_KEY")
            .output()
            .context("Failed to run stackplan")?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Command output helper
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Assert the command succeeded
    pub fn assert_success(&self) -> &Self {
        assert!(
            self.success,
            "Command failed with code {:?}\nStdout: {}\nStderr: {}",
            self.code, self.stdout, self.stderr
        );
        self
    }

    /// Assert the command failed
    pub fn assert_failure(&self) -> &Self {
        assert!(!self.success, "Command unexpectedly succeeded\nStdout: {}", self.stdout);
        self
    }

    /// Assert stdout contains the given text
    pub fn assert_stdout_contains(&self, text: &str) -> &Self {
        assert!(
            self.stdout.contains(text),
            "Expected stdout to contain '{}'\nActual stdout: {}",
            text,
            self.stdout
        );
        self
    }

    /// Assert stderr contains the given text
    pub fn assert_stderr_contains(&self, text: &str) -> &Self {
        assert!(
            self.stderr.contains(text),
            "Expected stderr to contain '{}'\nActual stderr: {}",
            text,
            self.stderr
        );
        self
    }

    /// Parse stdout as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.stdout)
            .unwrap_or_else(|e| panic!("stdout is not JSON: {e}\n{}", self.stdout))
    }
}
