//! Sample blueprints for tests.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::blueprint::Blueprint;

/// The demo stack shipped in `demos/ewa-stack.toml`.
pub const EWA_STACK: &str = include_str!("../../demos/ewa-stack.toml");

/// A named blueprint document.
#[derive(Clone, Debug)]
pub struct BlueprintFixture {
    pub name: String,
    pub content: String,
}

impl BlueprintFixture {
    /// The demo document-processing stack.
    pub fn ewa() -> Self {
        Self {
            name: "ewa-stack".to_string(),
            content: EWA_STACK.to_string(),
        }
    }

    /// `storage` and an event subscription that reads the storage id.
    pub fn storage_with_subscription() -> Self {
        Self {
            name: "storage-subscription".to_string(),
            content: r#"
[[resources]]
id = "subscription"
type = "Microsoft.EventGrid/systemTopics/eventSubscriptions@2022-06-15"
properties = { source = "${nodes.storage.id}" }

[[resources]]
id = "storage"
type = "Microsoft.Storage/storageAccounts@2023-01-01"
properties = { sku = { name = "Standard_LRS" } }

[outputs]
storageId = "storage.id"
"#
            .trim()
            .to_string(),
        }
    }

    /// `c -> d -> e` chain plus an independent `f`.
    pub fn chain_with_independent() -> Self {
        Self {
            name: "chain".to_string(),
            content: r#"
[[resources]]
id = "c"
type = "Test/things@1"

[[resources]]
id = "d"
type = "Test/things@1"
properties = { upstream = "${nodes.c.id}" }

[[resources]]
id = "e"
type = "Test/things@1"
depends_on = ["d"]

[[resources]]
id = "f"
type = "Test/things@1"
"#
            .trim()
            .to_string(),
        }
    }

    /// `a` and `b` reference each other.
    pub fn cycle() -> Self {
        Self {
            name: "cycle".to_string(),
            content: r#"
[[resources]]
id = "a"
type = "Test/things@1"
properties = { peer = "${nodes.b.id}" }

[[resources]]
id = "b"
type = "Test/things@1"
properties = { peer = "${nodes.a.id}" }
"#
            .trim()
            .to_string(),
        }
    }

    /// Parse the document.
    pub fn parse(&self) -> Blueprint {
        Blueprint::from_toml_str(&self.content)
            .unwrap_or_else(|e| panic!("fixture '{}' does not parse: {e}", self.name))
    }

    /// Write the document as `<name>.toml` under `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("{}.toml", self.name));
        std::fs::write(&path, &self.content)
            .with_context(|| format!("Failed to write fixture: {}", path.display()))?;
        Ok(path)
    }
}
