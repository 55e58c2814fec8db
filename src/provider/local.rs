//! File-backed stand-in for a cloud control plane.
//!
//! [`LocalProvisioner`] keeps one JSON document per scope under its directory and
//! behaves like a resource manager with PUT semantics: a create overwrites, an
//! update of a missing resource is `NotFound`. It lets the CLI and the demo
//! blueprint run end to end without a cloud account.
//!
//! Stored property bags are redacted; secrets never reach the disk.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{ApplyMode, ApplyRequest, ApplyResponse, ProvisionError, ProvisioningClient};
use crate::core::Value;
use crate::naming::scope_hash;
use crate::utils::{FileLock, ensure_dir, write_json_file};

/// A resource as recorded by the local control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalResource {
    resource_type: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    tags: serde_json::Value,
    properties: serde_json::Value,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LocalScope {
    scope: String,
    #[serde(default)]
    resources: BTreeMap<String, LocalResource>,
}

/// Local, file-backed provisioning client.
#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    dir: PathBuf,
}

impl LocalProvisioner {
    /// Control plane rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
        }
    }

    /// Provider id of a resource: `/scopes/{scope}/providers/{type}/{name}`.
    #[must_use]
    pub fn provider_id(scope: &str, resource_type: &str, name: &str) -> String {
        let base_type = resource_type.split('@').next().unwrap_or(resource_type);
        format!("/scopes/{scope}/providers/{base_type}/{name}")
    }

    fn path_for(&self, scope: &str) -> PathBuf {
        self.dir.join(format!("{}.json", scope_hash(scope, 16)))
    }

    /// Number of resources recorded for `scope`.
    pub async fn resource_count(&self, scope: &str) -> Result<usize> {
        let path = self.path_for(scope);
        let scope = scope.to_string();
        let document = tokio::task::spawn_blocking(move || read_scope(&path, &scope))
            .await
            .context("Failed to spawn blocking task for control plane read")??;
        Ok(document.resources.len())
    }

    fn apply_blocking(
        dir: &Path,
        path: &Path,
        request: &ApplyRequest,
    ) -> Result<Result<ApplyResponse, ProvisionError>> {
        ensure_dir(dir)?;
        let _lock = FileLock::acquire(&path.with_extension("lock"))?;
        let mut document = read_scope(path, &request.scope)?;

        let provider_id = match (request.mode, &request.provider_id) {
            (ApplyMode::Update, Some(id)) => id.clone(),
            _ => Self::provider_id(&request.scope, &request.resource_type, &request.name),
        };
        if request.mode == ApplyMode::Update && !document.resources.contains_key(&provider_id) {
            return Ok(Err(ProvisionError::NotFound(format!("resource '{provider_id}' does not exist"))));
        }

        document.resources.insert(provider_id.clone(), LocalResource {
            resource_type: request.resource_type.clone(),
            name: request.name.clone(),
            location: request.location.clone(),
            tags: request.tags.redacted(),
            properties: request.properties.redacted(),
            updated_at: Utc::now(),
        });
        write_json_file(path, &document)?;

        let mut outputs = BTreeMap::new();
        outputs.insert("id".to_string(), serde_json::Value::String(provider_id.clone()));
        outputs.insert("name".to_string(), serde_json::Value::String(request.name.clone()));
        outputs.insert("endpoint".to_string(), serde_json::Value::String(endpoint(&request.name)));
        if let Some(location) = &request.location {
            outputs.insert("location".to_string(), serde_json::Value::String(location.clone()));
        }
        outputs.insert("properties".to_string(), public_json(&request.properties));

        Ok(Ok(ApplyResponse {
            provider_id,
            outputs,
        }))
    }
}

fn read_scope(path: &Path, scope: &str) -> Result<LocalScope> {
    if !path.exists() {
        return Ok(LocalScope {
            scope: scope.to_string(),
            resources: BTreeMap::new(),
        });
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read control plane file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse control plane file: {}", path.display()))
}

fn endpoint(name: &str) -> String {
    format!("https://{name}.local")
}

/// JSON form of `value` with secure leaves left out.
fn public_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Secret(_) => serde_json::Value::Null,
        Value::List(items) => serde_json::Value::Array(
            items.iter().filter(|v| !matches!(v, Value::Secret(_))).map(public_json).collect(),
        ),
        Value::Map(map) => serde_json::Value::Object(
            map.iter()
                .filter(|(_, v)| !matches!(v, Value::Secret(_)))
                .map(|(k, v)| (k.clone(), public_json(v)))
                .collect(),
        ),
        other => other.redacted(),
    }
}

fn derive_key(provider_id: &str, slot: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider_id.as_bytes());
    hasher.update(b"#");
    hasher.update(slot.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split `/scopes/{scope}/providers/{type}/{name}` into scope and name.
fn parse_provider_id(provider_id: &str) -> Option<(&str, &str)> {
    let rest = provider_id.strip_prefix("/scopes/")?;
    let (scope, resource) = rest.rsplit_once("/providers/")?;
    let (_, name) = resource.rsplit_once('/')?;
    Some((scope, name))
}

fn internal(error: &anyhow::Error) -> ProvisionError {
    ProvisionError::Transient(format!("{error:#}"))
}

#[async_trait]
impl ProvisioningClient for LocalProvisioner {
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResponse, ProvisionError> {
        if request.name.is_empty() {
            return Err(ProvisionError::Rejected(format!("'{}' has an empty name", request.logical_id)));
        }
        if !request.resource_type.contains('@') {
            return Err(ProvisionError::Rejected(format!(
                "resource type '{}' has no API version",
                request.resource_type
            )));
        }

        tracing::debug!(
            node = %request.logical_id,
            mode = %request.mode,
            resource_type = %request.resource_type,
            "Local control plane apply"
        );
        let dir = self.dir.clone();
        let path = self.path_for(&request.scope);
        let request = request.clone();
        tokio::task::spawn_blocking(move || Self::apply_blocking(&dir, &path, &request))
            .await
            .map_err(|e| ProvisionError::Transient(format!("apply task failed: {e}")))?
            .map_err(|e| internal(&e))?
    }

    async fn list_keys(&self, provider_id: &str) -> Result<BTreeMap<String, String>, ProvisionError> {
        let (scope, name) = parse_provider_id(provider_id)
            .ok_or_else(|| ProvisionError::Rejected(format!("malformed provider id '{provider_id}'")))?;
        let path = self.path_for(scope);
        let owned_scope = scope.to_string();
        let document = tokio::task::spawn_blocking(move || read_scope(&path, &owned_scope))
            .await
            .map_err(|e| ProvisionError::Transient(format!("list keys task failed: {e}")))?
            .map_err(|e| internal(&e))?;
        if !document.resources.contains_key(provider_id) {
            return Err(ProvisionError::NotFound(format!("resource '{provider_id}' does not exist")));
        }

        let primary = derive_key(provider_id, "primary");
        let secondary = derive_key(provider_id, "secondary");
        let connection_string = format!("Endpoint={};AccountKey={primary}", endpoint(name));
        Ok(BTreeMap::from([
            ("primary".to_string(), primary),
            ("secondary".to_string(), secondary),
            ("connectionString".to_string(), connection_string),
        ]))
    }
}
