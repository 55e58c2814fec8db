//! Convergence checking: compare a desired node with its applied state.
//!
//! [`diff`] decides between create, update and no-op for one node whose
//! references are fully resolved. Comparison runs over the fingerprinted form of
//! properties and tags (secrets become `sha256:` fingerprints), so a rotated
//! secret is an update while the secret itself never reaches applied state.
//!
//! Type, location and computed name cannot change in place. A difference in any
//! of them is a [`StackError::ReplacementRequired`] error: replacement is
//! destructive and is never performed implicitly. A change of API version alone
//! is an ordinary update.
//!
//! [`preview`] runs the same check over a whole plan without side effects,
//! resolving references from outputs recorded in applied state.

use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::ROOT_SCOPE;
use crate::core::{OutputRef, Placeholder, PlaceholderResolver, StackError, Value};
use crate::outputs::NodeOutputs;
use crate::planner::{Plan, PlannedNode};
use crate::state::{AppliedState, desired_hash};

/// A planned node with every `${nodes...}` placeholder resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedNode {
    /// Qualified id
    pub id: String,
    /// Provider type and version
    pub resource_type: String,
    /// Resource name
    pub name: String,
    /// Location
    pub location: Option<String>,
    /// Tags
    pub tags: Value,
    /// Property bag
    pub properties: Value,
}

impl ResolvedNode {
    /// Resolve a planned node's references with `resolver`.
    ///
    /// Fails with [`StackError::DanglingReference`] when a reference remains
    /// unresolved, and with [`StackError::InvalidParameterValue`] when the
    /// location is not a string.
    pub fn resolve(node: &PlannedNode, resolver: &dyn PlaceholderResolver) -> Result<Self, StackError> {
        let resolved = Self::resolve_partial(node, resolver)?;
        let pending =
            resolved.properties.output_refs().into_iter().chain(resolved.tags.output_refs()).next();
        if let Some(reference) = pending {
            return Err(StackError::DanglingReference {
                from: node.id.clone(),
                target: reference.to_string(),
                reason: "whose output was not produced".to_string(),
            });
        }
        Ok(resolved)
    }

    /// Like [`ResolvedNode::resolve`], but properties and tags may keep
    /// unresolved placeholders. The location must still resolve.
    fn resolve_partial(node: &PlannedNode, resolver: &dyn PlaceholderResolver) -> Result<Self, StackError> {
        let properties = node.properties.resolve(resolver)?;
        let tags = node.tags.resolve(resolver)?;
        let location = node.location.as_ref().map(|l| l.resolve(resolver)).transpose()?;
        if let Some(reference) = location.iter().flat_map(Value::output_refs).next() {
            return Err(StackError::DanglingReference {
                from: node.id.clone(),
                target: reference.to_string(),
                reason: "whose output was not produced".to_string(),
            });
        }

        let location = match location {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_str().map(ToString::to_string).ok_or_else(|| {
                StackError::InvalidParameterValue {
                    scope: node.module.clone().unwrap_or_else(|| ROOT_SCOPE.to_string()),
                    name: format!("{}.location", node.id),
                    reason: format!("location must be a string, got {}", value.type_name()),
                }
            })?),
        };

        Ok(Self {
            id: node.id.clone(),
            resource_type: node.resource_type.clone(),
            name: node.name.clone(),
            location,
            tags,
            properties,
        })
    }

    /// Hash of the desired properties and tags, as stored in applied state.
    #[must_use]
    pub fn desired_hash(&self) -> String {
        desired_hash(&self.properties.fingerprinted(), &self.tags.fingerprinted())
    }

    /// Record of this node after a successful apply.
    #[must_use]
    pub fn to_applied_state(
        &self,
        provider_id: impl Into<String>,
        outputs: BTreeMap<String, serde_json::Value>,
    ) -> AppliedState {
        AppliedState {
            logical_id: self.id.clone(),
            resource_type: self.resource_type.clone(),
            name: self.name.clone(),
            location: self.location.clone(),
            tags: self.tags.fingerprinted(),
            properties: self.properties.fingerprinted(),
            properties_hash: self.desired_hash(),
            provider_id: provider_id.into(),
            outputs,
            applied_at: Utc::now(),
        }
    }
}

/// One field that differs between applied and desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    /// Flattened path, e.g. `properties.sku.name`
    pub path: String,
    /// Applied value, `None` when added
    pub old: Option<serde_json::Value>,
    /// Desired value, `None` when removed
    pub new: Option<serde_json::Value>,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.old, &self.new) {
            (None, Some(new)) => write!(f, "+ {}: {new}", self.path),
            (Some(old), None) => write!(f, "- {}: {old}", self.path),
            (Some(old), Some(new)) => write!(f, "~ {}: {old} → {new}", self.path),
            (None, None) => write!(f, "  {}", self.path),
        }
    }
}

/// What applying a node will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// No applied state: create
    Create,
    /// Applied state differs: update in place
    Update {
        /// Differing fields in path order
        changes: Vec<FieldChange>,
    },
    /// Applied state matches: nothing to do
    NoOp,
}

impl Change {
    /// Whether the provider must be called.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update {
                changes,
            } => write!(f, "update ({} field(s))", changes.len()),
            Self::NoOp => write!(f, "no change"),
        }
    }
}

fn base_type(resource_type: &str) -> &str {
    resource_type.split('@').next().unwrap_or(resource_type)
}

/// Compare a desired node against its last applied state.
pub fn diff(desired: &ResolvedNode, applied: Option<&AppliedState>) -> Result<Change, StackError> {
    let Some(applied) = applied else {
        return Ok(Change::Create);
    };

    let replacement = |field: &str, old: &str, new: &str| StackError::ReplacementRequired {
        node: desired.id.clone(),
        field: field.to_string(),
        old: old.to_string(),
        new: new.to_string(),
    };
    if base_type(&desired.resource_type) != base_type(&applied.resource_type) {
        return Err(replacement("type", &applied.resource_type, &desired.resource_type));
    }
    if desired.name != applied.name {
        return Err(replacement("name", &applied.name, &desired.name));
    }
    if desired.location != applied.location {
        return Err(replacement(
            "location",
            applied.location.as_deref().unwrap_or("<none>"),
            desired.location.as_deref().unwrap_or("<none>"),
        ));
    }

    let mut changes = Vec::new();
    if desired.resource_type != applied.resource_type {
        changes.push(FieldChange {
            path: "type".to_string(),
            old: Some(serde_json::Value::String(applied.resource_type.clone())),
            new: Some(serde_json::Value::String(desired.resource_type.clone())),
        });
    }

    let properties = desired.properties.fingerprinted();
    let tags = desired.tags.fingerprinted();
    if changes.is_empty() && desired_hash(&properties, &tags) == applied.properties_hash {
        return Ok(Change::NoOp);
    }

    changes.extend(compare("properties", &applied.properties, &properties));
    changes.extend(compare("tags", &applied.tags, &tags));
    if changes.is_empty() {
        return Ok(Change::NoOp);
    }
    Ok(Change::Update {
        changes,
    })
}

fn compare(root: &str, old: &serde_json::Value, new: &serde_json::Value) -> Vec<FieldChange> {
    let mut old_leaves = BTreeMap::new();
    let mut new_leaves = BTreeMap::new();
    flatten(root, old, &mut old_leaves);
    flatten(root, new, &mut new_leaves);

    let mut paths: Vec<&String> = old_leaves.keys().chain(new_leaves.keys()).collect();
    paths.sort();
    paths.dedup();
    paths
        .into_iter()
        .filter_map(|path| {
            let old = old_leaves.get(path);
            let new = new_leaves.get(path);
            (old != new).then(|| FieldChange {
                path: path.clone(),
                old: old.cloned(),
                new: new.cloned(),
            })
        })
        .collect()
}

fn flatten(path: &str, value: &serde_json::Value, out: &mut BTreeMap<String, serde_json::Value>) {
    match value {
        serde_json::Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten(&format!("{path}.{key}"), child, out);
            }
        }
        serde_json::Value::Array(items) if !items.is_empty() => {
            for (index, child) in items.iter().enumerate() {
                flatten(&format!("{path}.{index}"), child, out);
            }
        }
        // A missing document and an empty one are the same
        serde_json::Value::Null if path.split('.').count() == 1 => {}
        serde_json::Value::Object(_) if path.split('.').count() == 1 => {}
        leaf => {
            out.insert(path.to_string(), leaf.clone());
        }
    }
}

/// Predicted effect on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewChange {
    /// Outcome known from applied state
    Known(Change),
    /// Depends on outputs only known after an upstream node applies
    Pending {
        /// Unresolvable references, as `node.key`
        waiting_on: Vec<String>,
    },
}

/// Result of [`preview`], in apply order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preview {
    /// `(node id, predicted change)`
    pub entries: Vec<(String, PreviewChange)>,
}

impl Preview {
    /// Nodes that would be created or updated (pending nodes included).
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, change)| !matches!(change, PreviewChange::Known(Change::NoOp)))
            .count()
    }

    /// Whether nothing would change.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.action_count() == 0
    }
}

impl fmt::Display for Preview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, change) in &self.entries {
            match change {
                PreviewChange::Known(Change::Create) => writeln!(f, "+ {id}")?,
                PreviewChange::Known(Change::NoOp) => writeln!(f, "= {id}")?,
                PreviewChange::Known(Change::Update {
                    changes,
                }) => {
                    writeln!(f, "~ {id}")?;
                    for change in changes {
                        writeln!(f, "    {change}")?;
                    }
                }
                PreviewChange::Pending {
                    waiting_on,
                } => writeln!(f, "? {id} (known after apply: {})", waiting_on.join(", "))?,
            }
        }
        Ok(())
    }
}

/// Recorded outputs of a previously applied node.
fn recorded_outputs(node: &PlannedNode, state: &AppliedState) -> NodeOutputs {
    let outputs = serde_json::Value::Object(state.outputs.clone().into_iter().collect());
    // Only statically known properties are trusted; fingerprints are not values.
    let properties = if node.properties.is_deferred() { Value::Null } else { node.properties.clone() };
    NodeOutputs {
        provider_id: state.provider_id.clone(),
        name: state.name.clone(),
        outputs: Value::literal(&outputs),
        properties,
        keys: BTreeMap::new(),
    }
}

/// [`diff`] ignoring fields that still hold one of `unresolved`.
fn diff_settled(
    desired: &ResolvedNode,
    applied: &AppliedState,
    unresolved: &[OutputRef],
) -> Result<Change, StackError> {
    let markers: Vec<String> =
        unresolved.iter().map(|r| Placeholder::Output(r.clone()).to_string()).collect();
    let is_unresolved = |value: &serde_json::Value| {
        value.as_str().is_some_and(|text| markers.iter().any(|m| text.contains(m.as_str())))
    };
    Ok(match diff(desired, Some(applied))? {
        Change::Update {
            changes,
        } => {
            let changes: Vec<FieldChange> =
                changes.into_iter().filter(|c| !c.new.as_ref().is_some_and(is_unresolved)).collect();
            if changes.is_empty() {
                Change::NoOp
            } else {
                Change::Update {
                    changes,
                }
            }
        }
        other => other,
    })
}

/// Predict the change for every node of `plan` without side effects.
///
/// References resolve from outputs recorded in `state`. A node whose inputs
/// depend on an upstream create or update is reported as pending unless it has
/// no state at all. Access keys are never recorded; fields reading keys of an
/// unchanged node are assumed unchanged.
pub fn preview(plan: &Plan, state: &BTreeMap<String, AppliedState>) -> Result<Preview, StackError> {
    let mut known: BTreeMap<&str, NodeOutputs> = BTreeMap::new();
    let mut entries = Vec::with_capacity(plan.order.len());

    for id in &plan.order {
        let Some(node) = plan.node(id) else {
            continue;
        };
        let applied = state.get(id);

        let lookup = |placeholder: &Placeholder| -> Result<Option<Value>, StackError> {
            let Placeholder::Output(reference) = placeholder else {
                return Ok(None);
            };
            let path = plan
                .node(&reference.node)
                .map_or(reference.key.as_str(), |n| n.output_path(&reference.key));
            Ok(known.get(reference.node.as_str()).and_then(|outputs| outputs.lookup(path)))
        };
        let unresolved: Vec<OutputRef> = node
            .references()
            .into_iter()
            .filter(|reference| matches!(lookup(&Placeholder::Output(reference.clone())), Ok(None)))
            .collect();
        // Unresolved refs into unchanged nodes are access keys, which stay stable.
        let waiting_on: Vec<String> = unresolved
            .iter()
            .filter(|reference| !known.contains_key(reference.node.as_str()))
            .map(ToString::to_string)
            .collect();
        let in_location = node
            .location
            .as_ref()
            .is_some_and(|l| l.output_refs().iter().any(|r| unresolved.contains(r)));

        let change = match applied {
            None => PreviewChange::Known(Change::Create),
            Some(_) if !waiting_on.is_empty() || in_location => PreviewChange::Pending {
                waiting_on: unresolved.iter().map(ToString::to_string).collect(),
            },
            Some(applied) if unresolved.is_empty() => {
                let resolved = ResolvedNode::resolve(node, &lookup)?;
                PreviewChange::Known(diff(&resolved, Some(applied))?)
            }
            Some(applied) => {
                let resolved = ResolvedNode::resolve_partial(node, &lookup)?;
                PreviewChange::Known(diff_settled(&resolved, applied, &unresolved)?)
            }
        };

        if let (PreviewChange::Known(Change::NoOp), Some(applied)) = (&change, applied) {
            known.insert(id.as_str(), recorded_outputs(node, applied));
        }
        entries.push((id.clone(), change));
    }

    Ok(Preview {
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(sku: &str) -> ResolvedNode {
        ResolvedNode {
            id: "search".into(),
            resource_type: "Microsoft.Search/searchServices@2023-11-01".into(),
            name: "ewasearch1a2b3c4d".into(),
            location: Some("westeurope".into()),
            tags: Value::Map(BTreeMap::from([("PersonResponsible".to_string(), Value::string("ops"))])),
            properties: Value::Map(BTreeMap::from([
                ("sku".to_string(), Value::string(sku)),
                ("adminKey".to_string(), Value::secret(Value::string("hunter2"))),
            ])),
        }
    }

    #[test]
    fn test_missing_state_is_create() {
        assert_eq!(diff(&node("basic"), None).unwrap(), Change::Create);
    }

    #[test]
    fn test_same_desired_state_is_noop() {
        let applied = node("basic").to_applied_state("/id", BTreeMap::new());
        assert_eq!(diff(&node("basic"), Some(&applied)).unwrap(), Change::NoOp);
        assert!(!applied.properties.to_string().contains("hunter2"));
    }

    #[test]
    fn test_changed_property_is_update() {
        let applied = node("basic").to_applied_state("/id", BTreeMap::new());
        let Change::Update {
            changes,
        } = diff(&node("standard"), Some(&applied)).unwrap()
        else {
            panic!("expected update");
        };
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "properties.sku");
        assert_eq!(changes[0].new, Some(json!("standard")));
    }

    #[test]
    fn test_rotated_secret_is_update_without_revealing_it() {
        let applied = node("basic").to_applied_state("/id", BTreeMap::new());
        let mut desired = node("basic");
        desired.properties = Value::Map(BTreeMap::from([
            ("sku".to_string(), Value::string("basic")),
            ("adminKey".to_string(), Value::secret(Value::string("correct-horse"))),
        ]));
        let change = diff(&desired, Some(&applied)).unwrap();
        let Change::Update {
            changes,
        } = &change
        else {
            panic!("expected update");
        };
        assert_eq!(changes[0].path, "properties.adminKey");
        assert!(!changes[0].to_string().contains("correct-horse"));
    }

    #[test]
    fn test_location_change_requires_replacement() {
        let applied = node("basic").to_applied_state("/id", BTreeMap::new());
        let mut desired = node("basic");
        desired.location = Some("northeurope".into());
        let err = diff(&desired, Some(&applied)).unwrap_err();
        assert!(matches!(err, StackError::ReplacementRequired { ref field, .. } if field == "location"));
    }

    #[test]
    fn test_api_version_bump_is_update() {
        let applied = node("basic").to_applied_state("/id", BTreeMap::new());
        let mut desired = node("basic");
        desired.resource_type = "Microsoft.Search/searchServices@2024-06-01".into();
        let Change::Update {
            changes,
        } = diff(&desired, Some(&applied)).unwrap()
        else {
            panic!("expected update");
        };
        assert_eq!(changes[0].path, "type");
    }

    fn planned(id: &str, properties: serde_json::Value) -> PlannedNode {
        let mut node = PlannedNode::new(id, "T@1");
        node.properties = Value::from_json(properties).unwrap();
        node
    }

    fn recorded(node: &PlannedNode) -> AppliedState {
        let resolved = ResolvedNode::resolve(node, &|p: &Placeholder| -> Result<Option<Value>, StackError> {
            Ok(match p {
                Placeholder::Output(r) if r.key == "id" => Some(Value::string(format!("/rg/{}", r.node))),
                Placeholder::Output(_) => Some(Value::secret(Value::string("k1"))),
                Placeholder::Param(_) => None,
            })
        })
        .unwrap();
        resolved.to_applied_state(format!("/rg/{}", node.id), BTreeMap::new())
    }

    #[test]
    fn test_preview_converges_against_recorded_state() {
        let storage = planned("storage", json!({ "sku": "basic" }));
        let sub = planned(
            "sub",
            json!({ "source": "${nodes.storage.id}", "key": "${nodes.storage.keys.primary}" }),
        );
        let state = BTreeMap::from([
            ("storage".to_string(), recorded(&storage)),
            ("sub".to_string(), recorded(&sub)),
        ]);

        let plan = Plan::from_nodes("rg", vec![storage, sub.clone()], BTreeMap::new()).unwrap();
        let result = preview(&plan, &state).unwrap();
        assert!(result.is_converged(), "{result}");

        let changed = planned("storage", json!({ "sku": "standard" }));
        let plan = Plan::from_nodes("rg", vec![changed, sub], BTreeMap::new()).unwrap();
        let result = preview(&plan, &state).unwrap();
        assert_eq!(result.action_count(), 2);
        assert!(matches!(result.entries[0].1, PreviewChange::Known(Change::Update { .. })));
        assert!(matches!(result.entries[1].1, PreviewChange::Pending { .. }));
        assert!(result.to_string().contains("? sub (known after apply"));
    }

    #[test]
    fn test_preview_without_state_creates_everything() {
        let storage = planned("storage", json!({}));
        let sub = planned("sub", json!({ "source": "${nodes.storage.id}" }));
        let plan = Plan::from_nodes("rg", vec![storage, sub], BTreeMap::new()).unwrap();
        let result = preview(&plan, &BTreeMap::new()).unwrap();
        assert!(result.entries.iter().all(|(_, c)| *c == PreviewChange::Known(Change::Create)));
    }

    #[test]
    fn test_flatten_nested() {
        let changes = compare(
            "properties",
            &json!({ "a": { "b": 1, "c": [1, 2] } }),
            &json!({ "a": { "b": 2, "c": [1] } }),
        );
        let paths: Vec<_> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["properties.a.b", "properties.a.c.1"]);
        assert_eq!(changes[1].new, None);
    }
}
