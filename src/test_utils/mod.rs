//! Test utilities for stackplan
//!
//! Helpers shared by unit tests and the integration suite:
//! - [`init_test_logging`] for opt-in tracing output
//! - [`FakeProvisioner`], a scriptable in-memory [`ProvisioningClient`]
//! - [`fixtures`] with sample blueprints
//!
//! Enabled for `cfg(test)` and for the `test-utils` feature, which the
//! integration suite turns on through its dev-dependency on this crate.

pub mod fixtures;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, Once};
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::provider::{ApplyMode, ApplyRequest, ApplyResponse, ProvisionError, ProvisioningClient};

pub use fixtures::BlueprintFixture;

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Only the first call installs a subscriber. With `None` the `RUST_LOG`
/// environment variable decides; if it is unset, tests stay silent.
///
/// ```bash
/// RUST_LOG=stackplan=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .try_init();
    });
}

#[derive(Debug, Default)]
struct FakeState {
    requests: Vec<ApplyRequest>,
    existing: BTreeSet<String>,
    rejections: BTreeMap<String, String>,
    throttles: BTreeMap<String, usize>,
    conflicts: BTreeMap<String, usize>,
    in_flight: usize,
    max_in_flight: usize,
}

/// In-memory provisioning client with scripted failures.
///
/// Failures are keyed by logical id. Provider ids are `/fake/{logical id}`.
/// Every call to `apply`, including failed ones, is recorded.
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    state: Mutex<FakeState>,
    latency: Duration,
}

impl FakeProvisioner {
    /// Client that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: sleep `latency` inside every `apply`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Provider id assigned to `logical_id`.
    #[must_use]
    pub fn id_for(logical_id: &str) -> String {
        format!("/fake/{logical_id}")
    }

    /// Reject every apply of `logical_id`.
    pub fn reject(&self, logical_id: &str, message: &str) {
        self.state.lock().unwrap().rejections.insert(logical_id.to_string(), message.to_string());
    }

    /// Throttle the next `times` applies of `logical_id`.
    pub fn throttle(&self, logical_id: &str, times: usize) {
        self.state.lock().unwrap().throttles.insert(logical_id.to_string(), times);
    }

    /// Answer the next `times` applies of `logical_id` with a conflict.
    pub fn conflict(&self, logical_id: &str, times: usize) {
        self.state.lock().unwrap().conflicts.insert(logical_id.to_string(), times);
    }

    /// Forget that `logical_id` exists, as if it was deleted out of band.
    pub fn forget(&self, logical_id: &str) {
        self.state.lock().unwrap().existing.remove(&Self::id_for(logical_id));
    }

    /// Apply calls made for `logical_id`.
    #[must_use]
    pub fn calls_for(&self, logical_id: &str) -> usize {
        self.state.lock().unwrap().requests.iter().filter(|r| r.logical_id == logical_id).count()
    }

    /// All apply calls.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    /// Most recent request for `logical_id`.
    #[must_use]
    pub fn last_request(&self, logical_id: &str) -> Option<ApplyRequest> {
        self.state.lock().unwrap().requests.iter().rev().find(|r| r.logical_id == logical_id).cloned()
    }

    /// Logical ids in the order their first apply call arrived.
    #[must_use]
    pub fn call_order(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut seen = BTreeSet::new();
        state.requests.iter().filter(|r| seen.insert(r.logical_id.clone())).map(|r| r.logical_id.clone()).collect()
    }

    /// Highest number of concurrent `apply` calls observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    fn take_scripted(counts: &mut BTreeMap<String, usize>, logical_id: &str) -> bool {
        match counts.get_mut(logical_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ProvisioningClient for FakeProvisioner {
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResponse, ProvisionError> {
        {
            let mut state = self.state.lock().unwrap();
            state.requests.push(request.clone());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        let id = &request.logical_id;
        if let Some(message) = state.rejections.get(id) {
            return Err(ProvisionError::Rejected(message.clone()));
        }
        if Self::take_scripted(&mut state.throttles, id) {
            return Err(ProvisionError::Throttled {
                message: "too many requests".to_string(),
                retry_after: None,
            });
        }
        if Self::take_scripted(&mut state.conflicts, id) {
            return Err(ProvisionError::Conflict("another operation is in progress".to_string()));
        }

        let provider_id = Self::id_for(id);
        if request.mode == ApplyMode::Update && !state.existing.contains(&provider_id) {
            return Err(ProvisionError::NotFound(provider_id));
        }
        state.existing.insert(provider_id.clone());
        Ok(ApplyResponse {
            provider_id,
            outputs: BTreeMap::from([(
                "endpoint".to_string(),
                serde_json::Value::String(format!("https://{}.fake", request.name)),
            )]),
        })
    }

    async fn list_keys(&self, provider_id: &str) -> Result<BTreeMap<String, String>, ProvisionError> {
        if !self.state.lock().unwrap().existing.contains(provider_id) {
            return Err(ProvisionError::NotFound(provider_id.to_string()));
        }
        let logical = provider_id.trim_start_matches("/fake/");
        Ok(BTreeMap::from([
            ("primary".to_string(), format!("key-{logical}")),
            ("connectionString".to_string(), format!("Endpoint=https://{logical}.fake;AccountKey=key-{logical}")),
        ]))
    }
}
