//! Blueprint file model.
//!
//! A blueprint declares root parameters, resources, module instances, reusable
//! module definitions and root outputs. It is written in TOML (or JSON, chosen by
//! file extension):
//!
//! ```toml
//! [parameters.prefix]
//! type = "string"
//! default = "ewa"
//!
//! [parameters.deployOpenAI]
//! type = "bool"
//! default = true
//!
//! [[resources]]
//! id = "storage"
//! type = "Microsoft.Storage/storageAccounts@2023-01-01"
//! name = { prefix = "${params.prefix}stg", max_length = 24, hyphens = false }
//! properties = { sku = "Standard_LRS" }
//!
//! [[instances]]
//! id = "openai"
//! module = "openai"
//! condition = "deployOpenAI"
//! inputs = { prefix = "${params.prefix}" }
//!
//! [modules.openai.parameters.prefix]
//! type = "string"
//!
//! [[modules.openai.resources]]
//! id = "account"
//! type = "Microsoft.CognitiveServices/accounts@2023-05-01"
//!
//! [modules.openai.outputs]
//! endpoint = "account.endpoint"
//!
//! [outputs]
//! openaiEndpoint = "openai.endpoint"
//! storageConnectionString = { source = "storage.keys.connectionString", secure = true }
//! ```
//!
//! Placeholders are parsed into typed [`Value::Template`] fragments while the file
//! is deserialized, so every later pass works on structure rather than text.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::condition::Condition;
use crate::constants::{ROOT_SCOPE, SCOPE_SEPARATOR};
use crate::core::{OutputRef, Placeholder, StackError, Value};
use crate::naming::NameRule;
use crate::params::ParameterDeclaration;

/// A complete blueprint: the root module plus reusable module definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Blueprint {
    /// Root parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterDeclaration>,
    /// Root resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceDefinition>,
    /// Root module instances
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<ModuleInstance>,
    /// Reusable module definitions by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub modules: BTreeMap<String, ModuleDefinition>,
    /// Root outputs returned to the caller
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputBinding>,
}

/// A reusable set of resources with its own parameter scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDefinition {
    /// Declared parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterDeclaration>,
    /// Resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceDefinition>,
    /// Nested module instances
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<ModuleInstance>,
    /// Outputs exposed to the caller's scope as `${nodes.INSTANCE.NAME}`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputBinding>,
}

/// A named, typed cloud resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDefinition {
    /// Logical id, unique within the enclosing scope
    pub id: String,
    /// Provider type and API version, `Type@version`
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Computed name; without it the logical id is the name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<NameSpec>,
    /// Location; defaults to the scope's `location` parameter when bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    /// Tags; default to the scope's `tags` parameter when bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Value>,
    /// Property bag
    #[serde(default = "empty_map")]
    pub properties: Value,
    /// Owning resource in the same scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Inclusion predicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Explicit dependencies on nodes of the same scope
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Output aliases mapped to property-bag or provider-output paths
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

impl ResourceDefinition {
    /// Minimal resource of `resource_type`.
    #[must_use]
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            name: None,
            location: None,
            tags: None,
            properties: empty_map(),
            parent: None,
            condition: None,
            depends_on: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }
}

/// Instantiation of a module definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleInstance {
    /// Logical id, unique within the enclosing scope
    pub id: String,
    /// Name of the module definition
    pub module: String,
    /// Caller values mapped to module parameter names
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
    /// Inclusion predicate, evaluated in the caller's scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Explicit dependencies on nodes of the caller's scope
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Computed-name specification, see [`crate::naming`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NameSpec {
    /// Leading part, usually `${params.prefix}` plus a service tag
    pub prefix: Value,
    /// Further parts; empty ones are skipped
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suffix: Vec<Value>,
    /// Provider length limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Hex characters of the scope hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_length: Option<usize>,
    /// Part separator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    /// Whether `-` is allowed; `false` also clears the separator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyphens: Option<bool>,
    /// Whether to lowercase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lowercase: Option<bool>,
}

impl NameSpec {
    /// Naming rule derived from this spec and the defaults.
    #[must_use]
    pub fn rule(&self) -> NameRule {
        let defaults = NameRule::default();
        let allow_hyphens = self.hyphens.unwrap_or(defaults.allow_hyphens);
        let separator = match &self.separator {
            Some(separator) => separator.clone(),
            None if allow_hyphens => defaults.separator.clone(),
            None => String::new(),
        };
        NameRule {
            max_length: self.max_length.unwrap_or(defaults.max_length),
            hash_length: self.hash_length.unwrap_or(defaults.hash_length),
            separator,
            allow_hyphens,
            lowercase: self.lowercase.unwrap_or(defaults.lowercase),
        }
    }
}

/// A declared output: a value expression over nodes and parameters of a scope.
///
/// Written either as a `"node.key"` shorthand or as a table with `source` or
/// `value` and an optional `secure` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOutputBinding", into = "RawOutputBinding")]
pub struct OutputBinding {
    /// Expression producing the output
    pub value: Value,
    /// Never shown in plaintext
    pub secure: bool,
}

impl OutputBinding {
    /// Output taken from `node`'s output `key`.
    #[must_use]
    pub fn from_source(source: OutputRef, secure: bool) -> Self {
        Self {
            value: Value::Template(vec![crate::core::Fragment::Placeholder(Placeholder::Output(
                source,
            ))]),
            secure,
        }
    }

    /// The single node output this binding forwards, if it is a plain forward.
    #[must_use]
    pub fn source(&self) -> Option<OutputRef> {
        match &self.value {
            Value::Template(fragments) => match fragments.as_slice() {
                [crate::core::Fragment::Placeholder(Placeholder::Output(output))] => {
                    Some(output.clone())
                }
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawOutputBinding {
    Source(String),
    Table {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default)]
        secure: bool,
    },
}

impl TryFrom<RawOutputBinding> for OutputBinding {
    type Error = String;

    fn try_from(raw: RawOutputBinding) -> Result<Self, Self::Error> {
        let (source, value, secure) = match raw {
            RawOutputBinding::Source(source) => (Some(source), None, false),
            RawOutputBinding::Table {
                source,
                value,
                secure,
            } => (source, value, secure),
        };
        match (source, value) {
            (Some(source), None) => {
                let output = parse_output_source(&source)?;
                Ok(Self::from_source(output, secure))
            }
            (None, Some(value)) => Ok(Self {
                value,
                secure,
            }),
            (Some(_), Some(_)) => Err("an output takes either 'source' or 'value', not both".into()),
            (None, None) => Err("an output needs 'source' or 'value'".into()),
        }
    }
}

impl From<OutputBinding> for RawOutputBinding {
    fn from(binding: OutputBinding) -> Self {
        match binding.source() {
            Some(source) => Self::Table {
                source: Some(source.to_string()),
                value: None,
                secure: binding.secure,
            },
            None => Self::Table {
                source: None,
                value: Some(binding.value),
                secure: binding.secure,
            },
        }
    }
}

/// Parse a `node.key` output source.
pub fn parse_output_source(source: &str) -> Result<OutputRef, String> {
    match source.split_once('.') {
        Some((node, key)) if !node.is_empty() && !key.is_empty() => Ok(OutputRef {
            node: node.to_string(),
            key: key.to_string(),
        }),
        _ => Err(format!("output source '{source}' must have the form 'node.key'")),
    }
}

fn empty_map() -> Value {
    Value::Map(BTreeMap::new())
}

impl Blueprint {
    /// Load a blueprint, choosing JSON for `.json` files and TOML otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read blueprint file: {}", path.display()))?;

        let is_json = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        };

        let blueprint = parsed
            .map_err(|e| match e {
                StackError::BlueprintParseError {
                    reason,
                    ..
                } => StackError::BlueprintParseError {
                    file: path.display().to_string(),
                    reason,
                },
                other => other,
            })
            .with_context(|| format!("Invalid blueprint: {}", path.display()))?;

        tracing::debug!(
            path = %path.display(),
            resources = blueprint.resources.len(),
            instances = blueprint.instances.len(),
            modules = blueprint.modules.len(),
            "Loaded blueprint"
        );
        Ok(blueprint)
    }

    /// Parse and validate a TOML blueprint.
    pub fn from_toml_str(content: &str) -> Result<Self, StackError> {
        let blueprint: Self = toml::from_str(content).map_err(|e| StackError::BlueprintParseError {
            file: "<toml>".to_string(),
            reason: e.to_string(),
        })?;
        blueprint.validate()?;
        Ok(blueprint)
    }

    /// Parse and validate a JSON blueprint.
    pub fn from_json_str(content: &str) -> Result<Self, StackError> {
        let blueprint: Self =
            serde_json::from_str(content).map_err(|e| StackError::BlueprintParseError {
                file: "<json>".to_string(),
                reason: e.to_string(),
            })?;
        blueprint.validate()?;
        Ok(blueprint)
    }

    /// The root scope as a module definition.
    #[must_use]
    pub fn root_module(&self) -> ModuleDefinition {
        ModuleDefinition {
            parameters: self.parameters.clone(),
            resources: self.resources.clone(),
            instances: self.instances.clone(),
            outputs: self.outputs.clone(),
        }
    }

    /// Structural checks that need no parameter values.
    ///
    /// - node ids are well-formed and unique per scope
    /// - instances name existing modules
    /// - modules do not instantiate themselves, directly or transitively
    pub fn validate(&self) -> Result<(), StackError> {
        validate_scope(ROOT_SCOPE, &self.resources, &self.instances, &self.modules)?;
        for (name, module) in &self.modules {
            validate_scope(name, &module.resources, &module.instances, &self.modules)?;
        }
        self.check_module_recursion()
    }

    fn check_module_recursion(&self) -> Result<(), StackError> {
        fn visit(
            name: &str,
            modules: &BTreeMap<String, ModuleDefinition>,
            path: &mut Vec<String>,
            done: &mut BTreeSet<String>,
        ) -> Result<(), StackError> {
            if let Some(pos) = path.iter().position(|p| p == name) {
                let mut cycle = path[pos..].to_vec();
                cycle.push(name.to_string());
                return Err(StackError::CyclicDependency {
                    cycle: cycle.join(" → "),
                });
            }
            if done.contains(name) {
                return Ok(());
            }
            path.push(name.to_string());
            if let Some(module) = modules.get(name) {
                for instance in &module.instances {
                    visit(&instance.module, modules, path, done)?;
                }
            }
            path.pop();
            done.insert(name.to_string());
            Ok(())
        }

        let mut done = BTreeSet::new();
        for name in self.modules.keys() {
            visit(name, &self.modules, &mut Vec::new(), &mut done)?;
        }
        Ok(())
    }
}

fn validate_scope(
    scope: &str,
    resources: &[ResourceDefinition],
    instances: &[ModuleInstance],
    modules: &BTreeMap<String, ModuleDefinition>,
) -> Result<(), StackError> {
    let mut seen = BTreeSet::new();
    let ids = resources.iter().map(|r| &r.id).chain(instances.iter().map(|i| &i.id));
    for id in ids {
        validate_id(id)?;
        if !seen.insert(id.as_str()) {
            return Err(StackError::DuplicateNodeId {
                scope: scope.to_string(),
                id: id.clone(),
            });
        }
    }

    for resource in resources {
        if !resource.resource_type.contains('@') {
            return Err(StackError::BlueprintParseError {
                file: scope.to_string(),
                reason: format!(
                    "resource '{}' has type '{}'; expected 'Type@version'",
                    resource.id, resource.resource_type
                ),
            });
        }
        if !matches!(resource.properties, Value::Map(_)) {
            return Err(StackError::BlueprintParseError {
                file: scope.to_string(),
                reason: format!("properties of resource '{}' must be a table", resource.id),
            });
        }
    }

    for instance in instances {
        if !modules.contains_key(&instance.module) {
            return Err(StackError::UnknownModule {
                instance: instance.id.clone(),
                module: instance.module.clone(),
            });
        }
    }
    Ok(())
}

/// Node ids are `[A-Za-z0-9_-]+`; the scope separator is reserved.
pub fn validate_id(id: &str) -> Result<(), StackError> {
    let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StackError::BlueprintParseError {
            file: "<blueprint>".to_string(),
            reason: format!(
                "invalid node id '{id}': use letters, digits, '-' and '_' ('{SCOPE_SEPARATOR}' is reserved)"
            ),
        })
    }
}
