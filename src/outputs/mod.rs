//! Node outputs during an apply, and the terminal output map after it.
//!
//! [`OutputTable`] is owned by the executor's coordinator. It is written only
//! when a node's apply is confirmed, and read when a dependent's `${nodes...}`
//! placeholders are resolved. [`aggregate`] turns the root outputs declared by
//! the blueprint into an [`OutputMap`], where every output is either present or
//! absent with a reason. An absent output is never an empty string.

use serde_json::json;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use crate::core::{OutputRef, Placeholder, REDACTED, StackError, Value};
use crate::executor::{ApplyReport, NodeStatus};
use crate::planner::{Plan, PlannedOutput};
use crate::state::AppliedState;

/// What an applied node exposes to its dependents.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutputs {
    /// Provider-assigned id, exposed as `id`
    pub provider_id: String,
    /// Resource name, exposed as `name`
    pub name: String,
    /// Provider-returned outputs
    pub outputs: Value,
    /// Resolved desired properties, looked up after provider outputs
    pub properties: Value,
    /// Access keys, exposed as secure `keys.*`
    pub keys: BTreeMap<String, String>,
}

impl NodeOutputs {
    /// Outputs as recorded in applied state. Secret properties are only
    /// available as fingerprints there, so only `keys` carries secrets.
    #[must_use]
    pub fn from_state(state: &AppliedState, keys: BTreeMap<String, String>) -> Self {
        Self {
            provider_id: state.provider_id.clone(),
            name: state.name.clone(),
            outputs: Value::literal(&serde_json::Value::Object(
                state.outputs.clone().into_iter().collect(),
            )),
            properties: Value::literal(&state.properties),
            keys,
        }
    }

    /// Look up an output path.
    ///
    /// `id` and `name` are always available. `keys.X` reads a fetched access
    /// key and is always secure. Anything else is looked up in the provider's
    /// outputs first and then in the resolved property bag.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<Value> {
        match path {
            "id" => return Some(Value::string(&self.provider_id)),
            "name" => return Some(Value::string(&self.name)),
            "keys" => {
                if self.keys.is_empty() {
                    return None;
                }
                let keys = self.keys.iter().map(|(k, v)| (k.clone(), Value::string(v))).collect();
                return Some(Value::secret(Value::Map(keys)));
            }
            _ => {}
        }
        if let Some(slot) = path.strip_prefix("keys.") {
            return self.keys.get(slot).map(|key| Value::secret(Value::string(key)));
        }
        self.outputs.get_path(path).or_else(|| self.properties.get_path(path)).map(Cow::into_owned)
    }
}

/// Outputs of every applied node, keyed by qualified id.
#[derive(Debug, Clone, Default)]
pub struct OutputTable {
    nodes: BTreeMap<String, NodeOutputs>,
}

impl OutputTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the outputs of an applied node.
    pub fn insert(&mut self, id: impl Into<String>, outputs: NodeOutputs) {
        self.nodes.insert(id.into(), outputs);
    }

    /// Outputs of `id`, if applied.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&NodeOutputs> {
        self.nodes.get(id)
    }

    /// Whether `id` has published outputs.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes with outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node has published outputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Value of a qualified reference, following the node's output aliases.
    #[must_use]
    pub fn resolve_ref(&self, plan: &Plan, reference: &OutputRef) -> Option<Value> {
        let path = plan
            .node(&reference.node)
            .map_or(reference.key.as_str(), |node| node.output_path(&reference.key));
        self.nodes.get(&reference.node)?.lookup(path)
    }
}

/// Why a declared output has no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbsentReason {
    /// A referenced node was excluded by a condition
    Excluded(String),
    /// A referenced node failed to apply
    Failed(String),
    /// A referenced node was skipped
    Skipped(String),
    /// The referenced node applied but did not produce the value
    NotProduced(String),
}

impl fmt::Display for AbsentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excluded(reason) => write!(f, "excluded: {reason}"),
            Self::Failed(node) => write!(f, "node '{node}' failed"),
            Self::Skipped(node) => write!(f, "node '{node}' was skipped"),
            Self::NotProduced(reference) => write!(f, "'{reference}' was not produced"),
        }
    }
}

/// A root output after apply.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    /// Produced
    Present {
        /// Value; secure outputs are wrapped in [`Value::Secret`]
        value: Value,
        /// Redacted unless revealed
        secure: bool,
    },
    /// Not produced
    Absent {
        /// Why
        reason: AbsentReason,
    },
}

impl OutputValue {
    /// Whether a value was produced.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        matches!(self, Self::Present { .. })
    }

    fn render(&self, reveal: bool) -> serde_json::Value {
        match self {
            Self::Present {
                value,
                secure,
            } => {
                let rendered = if reveal {
                    value.expose()
                } else if *secure {
                    serde_json::Value::String(REDACTED.to_string())
                } else {
                    value.redacted()
                };
                json!({ "value": rendered, "secure": secure })
            }
            Self::Absent {
                reason,
            } => json!({ "absent": reason.to_string() }),
        }
    }
}

/// Declared root outputs after an apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputMap {
    outputs: BTreeMap<String, OutputValue>,
}

impl OutputMap {
    /// Look up an output.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OutputValue> {
        self.outputs.get(name)
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &OutputValue)> {
        self.outputs.iter()
    }

    /// Number of declared outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Whether no outputs are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// JSON form. Secure values are redacted unless `reveal`.
    #[must_use]
    pub fn render(&self, reveal: bool) -> serde_json::Value {
        serde_json::Value::Object(self.outputs.iter().map(|(k, v)| (k.clone(), v.render(reveal))).collect())
    }

    /// Present values only, as a flat object. Secure values are redacted unless
    /// `reveal`. This is the shape written to deployment info files.
    #[must_use]
    pub fn values(&self, reveal: bool) -> serde_json::Value {
        serde_json::Value::Object(
            self.outputs
                .iter()
                .filter_map(|(name, output)| match output {
                    OutputValue::Present {
                        value,
                        secure,
                    } => {
                        let rendered = if reveal {
                            value.expose()
                        } else if *secure {
                            serde_json::Value::String(REDACTED.to_string())
                        } else {
                            value.redacted()
                        };
                        Some((name.clone(), rendered))
                    }
                    OutputValue::Absent {
                        ..
                    } => None,
                })
                .collect(),
        )
    }
}

impl fmt::Display for OutputMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, output) in &self.outputs {
            match output {
                OutputValue::Present {
                    secure: true,
                    ..
                } => writeln!(f, "{name} = {REDACTED} (secure)")?,
                OutputValue::Present {
                    value,
                    ..
                } => writeln!(f, "{name} = {value}")?,
                OutputValue::Absent {
                    reason,
                } => writeln!(f, "{name}: absent ({reason})")?,
            }
        }
        Ok(())
    }
}

/// Build the output map from the plan's root outputs and what was applied.
#[must_use]
pub fn aggregate(plan: &Plan, table: &OutputTable, report: &ApplyReport) -> OutputMap {
    let mut outputs = BTreeMap::new();
    for (name, planned) in &plan.outputs {
        let output = match planned {
            PlannedOutput::Excluded {
                reason,
            } => OutputValue::Absent {
                reason: AbsentReason::Excluded(reason.clone()),
            },
            PlannedOutput::Bound {
                value,
                secure,
            } => aggregate_bound(plan, table, report, value, *secure),
        };
        outputs.insert(name.clone(), output);
    }
    OutputMap {
        outputs,
    }
}

fn aggregate_bound(
    plan: &Plan,
    table: &OutputTable,
    report: &ApplyReport,
    value: &Value,
    secure: bool,
) -> OutputValue {
    let references = value.output_refs();
    for reference in &references {
        let reason = match report.status(&reference.node) {
            Some(NodeStatus::Failed {
                ..
            }) => AbsentReason::Failed(reference.node.clone()),
            Some(NodeStatus::Skipped {
                ..
            }) => AbsentReason::Skipped(reference.node.clone()),
            Some(NodeStatus::Excluded {
                reason,
            }) => AbsentReason::Excluded(reason.clone()),
            _ => continue,
        };
        return OutputValue::Absent {
            reason,
        };
    }

    let resolved = value.resolve(&|placeholder: &Placeholder| -> Result<Option<Value>, StackError> {
        Ok(match placeholder {
            Placeholder::Output(reference) => table.resolve_ref(plan, reference),
            Placeholder::Param(_) => None,
        })
    });
    let missing = || {
        references
            .iter()
            .find(|r| table.resolve_ref(plan, r).is_none())
            .map_or_else(|| value.to_string(), ToString::to_string)
    };
    match resolved {
        Ok(resolved) if !resolved.is_deferred() => {
            let secure = secure || resolved.contains_secret();
            OutputValue::Present {
                value: if secure { Value::secret(resolved) } else { resolved },
                secure,
            }
        }
        Ok(_) => OutputValue::Absent {
            reason: AbsentReason::NotProduced(missing()),
        },
        Err(error) => {
            tracing::warn!("Output could not be assembled: {error}");
            OutputValue::Absent {
                reason: AbsentReason::NotProduced(missing()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(name: &str) -> NodeOutputs {
        NodeOutputs {
            provider_id: format!("/scopes/rg/{name}"),
            name: name.to_string(),
            outputs: Value::literal(&json!({ "endpoint": format!("https://{name}.local") })),
            properties: Value::Map(BTreeMap::from([
                ("sku".to_string(), Value::string("basic")),
                ("adminKey".to_string(), Value::secret(Value::string("hunter2"))),
            ])),
            keys: BTreeMap::from([("primary".to_string(), "k1".to_string())]),
        }
    }

    #[test]
    fn test_lookup_order_and_keys() {
        let node = outputs("search");
        assert_eq!(node.lookup("id"), Some(Value::string("/scopes/rg/search")));
        assert_eq!(node.lookup("endpoint"), Some(Value::string("https://search.local")));
        assert_eq!(node.lookup("sku"), Some(Value::string("basic")));
        assert!(matches!(node.lookup("adminKey"), Some(Value::Secret(_))));
        assert!(matches!(node.lookup("keys.primary"), Some(Value::Secret(_))));
        assert_eq!(node.lookup("keys.missing"), None);
        assert_eq!(node.lookup("nothing"), None);
    }

    #[test]
    fn test_render_redacts_unless_revealed() {
        let map = OutputMap {
            outputs: BTreeMap::from([
                ("endpoint".to_string(), OutputValue::Present {
                    value: Value::string("https://x"),
                    secure: false,
                }),
                ("key".to_string(), OutputValue::Present {
                    value: Value::secret(Value::string("hunter2")),
                    secure: true,
                }),
                ("openai".to_string(), OutputValue::Absent {
                    reason: AbsentReason::Excluded("condition 'useOpenAi' is false".into()),
                }),
            ]),
        };
        let hidden = map.render(false);
        assert_eq!(hidden["key"]["value"], REDACTED);
        assert_eq!(hidden["endpoint"]["value"], "https://x");
        assert!(hidden["openai"]["absent"].as_str().unwrap().starts_with("excluded"));
        assert_eq!(map.render(true)["key"]["value"], "hunter2");

        assert!(!map.to_string().contains("hunter2"));
        assert!(map.values(false).get("openai").is_none());
    }
}
