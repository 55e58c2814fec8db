//! Applied state: what was last successfully applied for each node.
//!
//! State is the only thing that persists across invocations. It lets the
//! convergence checker decide between create, update and no-op, and lets a
//! re-run reuse outputs of unchanged nodes without calling the provider.
//!
//! Property bags are stored in fingerprinted form: secure values are replaced by
//! `sha256:` fingerprints, so a changed secret is detected without the secret
//! ever touching disk.
//!
//! Two stores are provided:
//! - [`FileStateStore`]: one JSON document per scope under a state directory,
//!   written atomically while holding an exclusive file lock
//! - [`MemoryStateStore`]: in-process map for tests and dry runs

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::StackError;
use crate::naming::scope_hash;
use crate::utils::{FileLock, ensure_dir, write_json_file};

/// Current state file format version.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Last-applied record of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedState {
    /// Qualified logical id
    pub logical_id: String,
    /// Provider type and version
    pub resource_type: String,
    /// Resource name
    pub name: String,
    /// Location as applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Fingerprinted tags
    #[serde(default)]
    pub tags: serde_json::Value,
    /// Fingerprinted property bag
    pub properties: serde_json::Value,
    /// Hash of `properties` and `tags`
    pub properties_hash: String,
    /// Provider-assigned id
    pub provider_id: String,
    /// Non-secret outputs returned by the provider
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// When the node was last applied
    pub applied_at: DateTime<Utc>,
}

/// `sha256:` hash of fingerprinted properties and tags.
#[must_use]
pub fn desired_hash(properties: &serde_json::Value, tags: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(properties.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(tags.to_string().as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Persistence of [`AppliedState`] keyed by `(scope, logical id)`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the record of one node.
    async fn load(&self, scope: &str, logical_id: &str) -> Result<Option<AppliedState>>;

    /// Load every record of a scope.
    async fn load_all(&self, scope: &str) -> Result<BTreeMap<String, AppliedState>>;

    /// Insert or replace the record of `state.logical_id`.
    async fn save(&self, scope: &str, state: AppliedState) -> Result<()>;
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    scopes: Arc<Mutex<BTreeMap<String, BTreeMap<String, AppliedState>>>>,
}

impl MemoryStateStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in `scope`.
    pub async fn len(&self, scope: &str) -> usize {
        self.scopes.lock().await.get(scope).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, scope: &str, logical_id: &str) -> Result<Option<AppliedState>> {
        Ok(self.scopes.lock().await.get(scope).and_then(|s| s.get(logical_id)).cloned())
    }

    async fn load_all(&self, scope: &str) -> Result<BTreeMap<String, AppliedState>> {
        Ok(self.scopes.lock().await.get(scope).cloned().unwrap_or_default())
    }

    async fn save(&self, scope: &str, state: AppliedState) -> Result<()> {
        self.scopes
            .lock()
            .await
            .entry(scope.to_string())
            .or_default()
            .insert(state.logical_id.clone(), state);
        Ok(())
    }
}

/// On-disk document of one scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    scope: String,
    #[serde(default)]
    resources: BTreeMap<String, AppliedState>,
}

/// JSON file per scope under a state directory.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    write_guard: Mutex<()>,
}

impl FileStateStore {
    /// Store rooted at `dir`; the directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_guard: Mutex::new(()),
        }
    }

    /// Path of the state file for `scope`.
    #[must_use]
    pub fn path_for(&self, scope: &str) -> PathBuf {
        self.dir.join(format!("{}.json", scope_hash(scope, 16)))
    }

    fn read_file(path: &Path, scope: &str) -> Result<StateFile> {
        if !path.exists() {
            return Ok(StateFile {
                version: STATE_FORMAT_VERSION,
                scope: scope.to_string(),
                resources: BTreeMap::new(),
            });
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        let file: StateFile =
            serde_json::from_str(&content).map_err(|e| StackError::StateParseError {
                file: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if file.version > STATE_FORMAT_VERSION {
            return Err(StackError::StateParseError {
                file: path.display().to_string(),
                reason: format!(
                    "state format version {} is newer than supported version {STATE_FORMAT_VERSION}",
                    file.version
                ),
            }
            .into());
        }
        if file.scope != scope {
            return Err(StackError::StateParseError {
                file: path.display().to_string(),
                reason: format!("file belongs to scope '{}', not '{scope}'", file.scope),
            }
            .into());
        }
        Ok(file)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, scope: &str, logical_id: &str) -> Result<Option<AppliedState>> {
        Ok(self.load_all(scope).await?.remove(logical_id))
    }

    async fn load_all(&self, scope: &str) -> Result<BTreeMap<String, AppliedState>> {
        let path = self.path_for(scope);
        let scope = scope.to_string();
        let file = tokio::task::spawn_blocking(move || Self::read_file(&path, &scope))
            .await
            .context("Failed to spawn blocking task for state read")??;
        Ok(file.resources)
    }

    async fn save(&self, scope: &str, state: AppliedState) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let dir = self.dir.clone();
        let path = self.path_for(scope);
        let scope = scope.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            ensure_dir(&dir)?;
            let lock = FileLock::acquire(&path.with_extension("lock"))?;
            let mut file = Self::read_file(&path, &scope)?;
            tracing::trace!(node = %state.logical_id, path = %path.display(), "Saving applied state");
            file.resources.insert(state.logical_id.clone(), state);
            write_json_file(&path, &file)?;
            drop(lock);
            Ok(())
        })
        .await
        .context("Failed to spawn blocking task for state write")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(id: &str) -> AppliedState {
        let properties = json!({ "sku": "basic" });
        let tags = json!({});
        AppliedState {
            logical_id: id.to_string(),
            resource_type: "Microsoft.Search/searchServices@2023-11-01".to_string(),
            name: format!("{id}-name"),
            location: Some("westeurope".to_string()),
            properties_hash: desired_hash(&properties, &tags),
            tags,
            properties,
            provider_id: format!("/scopes/rg/{id}"),
            outputs: BTreeMap::from([("endpoint".to_string(), json!("https://x"))]),
            applied_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        store.save("rg", record("search")).await.unwrap();
        assert_eq!(store.len("rg").await, 1);
        assert_eq!(store.load("rg", "search").await.unwrap().unwrap().name, "search-name");
        assert!(store.load("other", "search").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        FileStateStore::new(dir.path()).save("rg", record("search")).await.unwrap();
        FileStateStore::new(dir.path()).save("rg", record("storage")).await.unwrap();

        let store = FileStateStore::new(dir.path());
        let all = store.load_all("rg").await.unwrap();
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec!["search", "storage"]);
        assert!(store.load_all("other").await.unwrap().is_empty());
        assert!(!store.path_for("rg").with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_concurrent_saves() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStateStore::new(dir.path()));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            tasks.spawn(async move { store.save("rg", record(&format!("n{i}"))).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
        assert_eq!(store.load_all("rg").await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_corrupt_state_file_reported() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        std::fs::write(store.path_for("rg"), "not json").unwrap();
        let err = store.load_all("rg").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StackError>(), Some(StackError::StateParseError { .. })));
    }

    #[test]
    fn test_desired_hash_changes_with_tags() {
        let props = json!({ "a": 1 });
        assert_ne!(desired_hash(&props, &json!({})), desired_hash(&props, &json!({ "owner": "x" })));
    }
}
