//! Bounded retries of provisioning calls.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tokio_util::sync::CancellationToken;

use super::{ApplyMode, ApplyRequest, ApplyResponse, ProvisionError, ProvisioningClient};
use crate::constants::{DEFAULT_MAX_ATTEMPTS, MAX_BACKOFF_DELAY_MS, STARTING_BACKOFF_DELAY_MS};

/// What to do when the provider reports a conflicting operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Back off and try again
    #[default]
    Retry,
    /// Fail the node immediately
    FailFast,
}

/// Retry limits for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first; at least 1
    pub max_attempts: usize,
    /// First backoff delay; later delays double
    pub initial_delay: Duration,
    /// Upper bound of a single delay
    pub max_delay: Duration,
    /// Conflict handling
    pub conflict: ConflictPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(STARTING_BACKOFF_DELAY_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_DELAY_MS),
            conflict: ConflictPolicy::Retry,
        }
    }
}

impl RetryPolicy {
    /// Policy with no retries at all.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Jittered delays between attempts: `max_attempts - 1` of them.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        // ExponentialBackoff yields base^n * factor, so base 2 doubles from `initial_delay`
        let factor = std::cmp::max(1, self.initial_delay.as_millis() as u64 / 2);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }

    fn is_retryable(&self, error: &ProvisionError) -> bool {
        match error {
            ProvisionError::Throttled {
                ..
            }
            | ProvisionError::Transient(_) => true,
            ProvisionError::Conflict(_) => self.conflict == ConflictPolicy::Retry,
            ProvisionError::NotFound(_) | ProvisionError::Rejected(_) => false,
        }
    }
}

/// Successful outcome of [`apply_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    /// Provider response
    pub response: ApplyResponse,
    /// Mode of the successful call; an update may have become a create
    pub mode: ApplyMode,
    /// Calls made, including the successful one
    pub attempts: usize,
}

/// Apply `request`, retrying retryable failures per `policy`.
///
/// An update answered with `NotFound` is retried as a create once (the resource
/// was deleted out of band). Cancellation interrupts a pending backoff sleep and
/// returns the last error; it never interrupts a call in flight.
pub async fn apply_with_retry(
    client: &dyn ProvisioningClient,
    mut request: ApplyRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<RetryOutcome, ProvisionError> {
    let mut delays = policy.delays();
    let mut attempts = 0;
    let mut recreated = false;

    loop {
        attempts += 1;
        let error = match client.apply(&request).await {
            Ok(response) => {
                return Ok(RetryOutcome {
                    response,
                    mode: request.mode,
                    attempts,
                });
            }
            Err(error) => error,
        };

        if let ProvisionError::NotFound(message) = &error
            && request.mode == ApplyMode::Update
            && !recreated
        {
            tracing::warn!(
                node = %request.logical_id,
                message = %message,
                "Resource vanished since the last apply; creating it again"
            );
            request.mode = ApplyMode::Create;
            request.provider_id = None;
            recreated = true;
            continue;
        }

        if !policy.is_retryable(&error) {
            return Err(error);
        }
        let Some(mut delay) = delays.next() else {
            tracing::warn!(node = %request.logical_id, attempts, "Retries exhausted: {error}");
            return Err(error);
        };
        if let ProvisionError::Throttled {
            retry_after: Some(retry_after),
            ..
        } = &error
        {
            delay = std::cmp::max(delay, *retry_after).min(policy.max_delay);
        }

        tracing::info!(
            node = %request.logical_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "Retrying after {error}"
        );
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(node = %request.logical_id, "Cancelled during backoff");
                return Err(error);
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Fetch access keys, retrying retryable failures per `policy`.
pub async fn list_keys_with_retry(
    client: &dyn ProvisioningClient,
    provider_id: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, String>, ProvisionError> {
    let mut delays = policy.delays();
    loop {
        let error = match client.list_keys(provider_id).await {
            Ok(keys) => return Ok(keys),
            Err(error) => error,
        };
        if !policy.is_retryable(&error) {
            return Err(error);
        }
        let Some(delay) = delays.next() else {
            return Err(error);
        };
        tracing::info!(provider_id, delay_ms = delay.as_millis() as u64, "Retrying key listing after {error}");
        tokio::select! {
            () = cancel.cancelled() => return Err(error),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        responses: Mutex<VecDeque<Result<ApplyResponse, ProvisionError>>>,
        modes: Mutex<Vec<ApplyMode>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<ApplyResponse, ProvisionError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                modes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProvisioningClient for Scripted {
        async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResponse, ProvisionError> {
            self.modes.lock().unwrap().push(request.mode);
            self.responses.lock().unwrap().pop_front().unwrap_or_else(|| Ok(ApplyResponse::default()))
        }

        async fn list_keys(&self, _: &str) -> Result<BTreeMap<String, String>, ProvisionError> {
            Ok(BTreeMap::new())
        }
    }

    fn request(mode: ApplyMode) -> ApplyRequest {
        ApplyRequest {
            scope: "rg".into(),
            logical_id: "storage".into(),
            resource_type: "T@1".into(),
            name: "storage".into(),
            location: None,
            tags: Value::Map(BTreeMap::new()),
            properties: Value::Map(BTreeMap::new()),
            mode,
            provider_id: Some("/old".into()),
        }
    }

    fn fast(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            conflict: ConflictPolicy::Retry,
        }
    }

    fn throttled() -> ProvisionError {
        ProvisionError::Throttled {
            message: "429".into(),
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn test_throttled_then_success() {
        let client = Scripted::new(vec![Err(throttled()), Err(throttled()), Ok(ApplyResponse::default())]);
        let outcome =
            apply_with_retry(&client, request(ApplyMode::Create), &fast(5), &CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let client = Scripted::new(vec![Err(throttled()), Err(throttled()), Err(throttled())]);
        let err =
            apply_with_retry(&client, request(ApplyMode::Create), &fast(2), &CancellationToken::new())
                .await
                .unwrap_err();
        assert!(matches!(err, ProvisionError::Throttled { .. }));
        assert_eq!(client.modes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let client = Scripted::new(vec![Err(ProvisionError::Rejected("bad sku".into()))]);
        let err =
            apply_with_retry(&client, request(ApplyMode::Create), &fast(5), &CancellationToken::new())
                .await
                .unwrap_err();
        assert_eq!(err, ProvisionError::Rejected("bad sku".into()));
        assert_eq!(client.modes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_fail_fast() {
        let client = Scripted::new(vec![Err(ProvisionError::Conflict("busy".into()))]);
        let policy = RetryPolicy {
            conflict: ConflictPolicy::FailFast,
            ..fast(5)
        };
        let err = apply_with_retry(&client, request(ApplyMode::Create), &policy, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Conflict(_)));
        assert_eq!(client.modes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_not_found_on_update_becomes_create() {
        let client = Scripted::new(vec![
            Err(ProvisionError::NotFound("gone".into())),
            Ok(ApplyResponse::default()),
        ]);
        let outcome =
            apply_with_retry(&client, request(ApplyMode::Update), &fast(1), &CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(outcome.mode, ApplyMode::Create);
        assert_eq!(*client.modes.lock().unwrap(), vec![ApplyMode::Update, ApplyMode::Create]);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_retrying() {
        let client = Scripted::new(vec![Err(throttled()), Ok(ApplyResponse::default())]);
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            ..fast(5)
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = apply_with_retry(&client, request(ApplyMode::Create), &policy, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Throttled { .. }));
        assert_eq!(client.modes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_delays_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(1000),
            conflict: ConflictPolicy::Retry,
        };
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(delays.len(), 9);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(1000)));
        assert_eq!(RetryPolicy::no_retry().delays().count(), 0);
    }
}
