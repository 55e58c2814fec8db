//! The provisioning collaborator.
//!
//! The executor never talks to a cloud directly. It drives a
//! [`ProvisioningClient`], which creates or updates one resource per call and can
//! list the access keys of an applied resource. Errors are classified so the
//! retry layer ([`retry`]) knows what to do with them:
//!
//! | Error | Handling |
//! |---|---|
//! | [`ProvisionError::Throttled`] | retry with backoff, honoring `retry_after` |
//! | [`ProvisionError::Transient`] | retry with backoff |
//! | [`ProvisionError::Conflict`] | retry or fail fast per [`ConflictPolicy`] |
//! | [`ProvisionError::NotFound`] | on update, retry once as a create |
//! | [`ProvisionError::Rejected`] | surfaced verbatim, never retried |
//!
//! [`local::LocalProvisioner`] is a file-backed stand-in for a real control plane.

pub mod local;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{StackError, Value};

pub use local::LocalProvisioner;
pub use retry::{ConflictPolicy, RetryOutcome, RetryPolicy, apply_with_retry, list_keys_with_retry};

/// Whether a resource is expected to exist already.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// First apply
    Create,
    /// Resource exists according to applied state
    Update,
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// One create-or-update call.
///
/// Properties and tags keep their [`Value::Secret`] wrappers; clients call
/// [`Value::expose`] only when building the wire request, so `Debug` output of a
/// request never contains a secret.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRequest {
    /// Deployment scope
    pub scope: String,
    /// Qualified logical id
    pub logical_id: String,
    /// Provider type and version
    pub resource_type: String,
    /// Resource name
    pub name: String,
    /// Location
    pub location: Option<String>,
    /// Tags
    pub tags: Value,
    /// Fully resolved property bag
    pub properties: Value,
    /// Create or update
    pub mode: ApplyMode,
    /// Provider id from applied state, for updates
    pub provider_id: Option<String>,
}

/// Result of a successful apply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplyResponse {
    /// Provider-assigned id
    pub provider_id: String,
    /// Provider-returned outputs (endpoints, ids, ...)
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

/// Classified provisioning failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    /// Rate limited
    #[error("throttled: {message}")]
    Throttled {
        /// Provider message
        message: String,
        /// Suggested wait
        retry_after: Option<Duration>,
    },
    /// Another operation holds the resource
    #[error("conflict: {0}")]
    Conflict(String),
    /// The resource does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// The request is invalid; retrying will not help
    #[error("rejected: {0}")]
    Rejected(String),
    /// Network or server hiccup
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ProvisionError {
    /// Convert to the node-scoped error reported to the user.
    #[must_use]
    pub fn into_stack_error(self, node: &str) -> StackError {
        let node = node.to_string();
        match self {
            Self::Throttled {
                message,
                ..
            } => StackError::ProvisioningThrottled {
                node,
                message,
            },
            Self::Conflict(message) => StackError::ProvisioningConflict {
                node,
                message,
            },
            Self::Rejected(message) | Self::NotFound(message) => StackError::ProvisioningRejected {
                node,
                message,
            },
            Self::Transient(message) => StackError::Other {
                message: format!("Provisioning '{node}' failed after retries: {message}"),
            },
        }
    }
}

/// Client of a cloud control plane.
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    /// Create or update a resource.
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResponse, ProvisionError>;

    /// Access keys of an applied resource (`primary`, `connectionString`, ...).
    async fn list_keys(&self, provider_id: &str) -> Result<BTreeMap<String, String>, ProvisionError>;
}

#[async_trait]
impl<T: ProvisioningClient + ?Sized> ProvisioningClient for Arc<T> {
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResponse, ProvisionError> {
        (**self).apply(request).await
    }

    async fn list_keys(&self, provider_id: &str) -> Result<BTreeMap<String, String>, ProvisionError> {
        (**self).list_keys(provider_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ProvisionError::Conflict("busy".into()).into_stack_error("storage");
        assert!(err.is_retryable());
        let err = ProvisionError::Rejected("bad sku".into()).into_stack_error("search");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Provisioning rejected for 'search': bad sku");
    }

    #[test]
    fn test_request_debug_redacts_secrets() {
        let request = ApplyRequest {
            scope: "rg".into(),
            logical_id: "app".into(),
            resource_type: "T@1".into(),
            name: "app".into(),
            location: None,
            tags: Value::Map(BTreeMap::new()),
            properties: Value::Map(BTreeMap::from([(
                "apiKey".to_string(),
                Value::secret(Value::string("hunter2")),
            )])),
            mode: ApplyMode::Create,
            provider_id: None,
        };
        let debug = format!("{request:?}");
        assert!(!debug.contains("hunter2"), "{debug}");
    }
}
