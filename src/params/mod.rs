//! Parameter declarations and binding.
//!
//! Each module scope declares its parameters. Binding resolves every declared
//! parameter from, in order of precedence:
//!
//! 1. the value supplied by the caller (CLI root values or module inputs)
//! 2. the declared default
//! 3. a value of the same name in the inherited context (`location`, `tags`)
//!
//! Object-typed parameters merge instead of replacing: the inherited object is
//! the base and the default or supplied object is laid over it key by key, so a
//! module can add a tag without losing the owner tag set by its caller.
//!
//! Secure parameters are wrapped in [`Value::Secret`] so the no-log guarantee
//! follows the value wherever it is substituted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::{Placeholder, StackError, Value};

/// Semantic parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// Text
    #[default]
    String,
    /// Boolean flag
    Bool,
    /// Number
    Number,
    /// Mapping (e.g. tag sets)
    Object,
    /// List
    Array,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::Object => "object",
            Self::Array => "array",
        };
        write!(f, "{name}")
    }
}

impl ParamType {
    /// Whether `value` is acceptable for this type.
    ///
    /// Deferred values (placeholders still waiting for node outputs) are accepted;
    /// their type is only known after apply.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match value {
            Value::Secret(inner) => self.accepts(inner),
            Value::Template(_) => true,
            Value::String(_) => self == Self::String,
            Value::Bool(_) => self == Self::Bool,
            Value::Number(_) => self == Self::Number,
            Value::Map(_) => self == Self::Object,
            Value::List(_) => self == Self::Array,
            Value::Null => false,
        }
    }
}

/// A declared parameter of a module scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParameterDeclaration {
    /// Semantic type
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    /// Default value; may contain `${params.*}` placeholders of the same scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Never log or echo in plaintext
    #[serde(default)]
    pub secure: bool,
    /// Allowed values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    /// Whether binding fails when no value can be found; defaults to true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// Free text shown by `stackplan plan`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterDeclaration {
    /// Declare a parameter of `param_type` with no default.
    #[must_use]
    pub fn new(param_type: ParamType) -> Self {
        Self {
            param_type,
            ..Self::default()
        }
    }

    /// Builder: set a default.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Builder: mark secure.
    #[must_use]
    pub const fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Builder: mark optional.
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.required = Some(false);
        self
    }

    /// A parameter is required unless explicitly optional.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(true)
    }
}

/// Values a scope inherits from its caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InheritedContext {
    values: BTreeMap<String, Value>,
}

impl InheritedContext {
    /// Empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Look up an inherited value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Set a value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }
}

/// Bound parameters of one module scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedParams {
    scope: String,
    values: BTreeMap<String, Value>,
    absent: BTreeSet<String>,
}

impl ResolvedParams {
    /// Empty set for `scope`.
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            values: BTreeMap::new(),
            absent: BTreeSet::new(),
        }
    }

    /// Scope these parameters belong to.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Look up a bound value. Absent optional parameters return `None`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Whether `name` is a declared optional parameter that received no value.
    #[must_use]
    pub fn is_absent(&self, name: &str) -> bool {
        self.absent.contains(name)
    }

    /// Whether a parameter is bound.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Iterate bound values in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// Bind declared parameters of `scope`.
///
/// Defaults may reference other parameters of the same scope
/// (`default = "${params.prefix}-search"`); they are resolved after every
/// supplied value is known, in declaration-independent order.
pub fn bind(
    scope: &str,
    declared: &BTreeMap<String, ParameterDeclaration>,
    supplied: &BTreeMap<String, Value>,
    inherited: &InheritedContext,
) -> Result<ResolvedParams, StackError> {
    if let Some(unknown) = supplied.keys().find(|name| !declared.contains_key(*name)) {
        return Err(StackError::UnknownParameter {
            scope: scope.to_string(),
            name: unknown.clone(),
        });
    }

    let mut resolved = ResolvedParams::new(scope);
    let mut pending_defaults: BTreeMap<&String, &Value> = BTreeMap::new();

    for (name, declaration) in declared {
        let base = inherited.get(name);
        if let Some(value) = supplied.get(name) {
            resolved.insert(name.clone(), merge_inherited(declaration, base, value.clone()));
        } else if let Some(default) = &declaration.default {
            if default.placeholders().is_empty() {
                resolved.insert(name.clone(), merge_inherited(declaration, base, default.clone()));
            } else {
                pending_defaults.insert(name, default);
            }
        } else if let Some(value) = base {
            resolved.insert(name.clone(), value.clone());
        } else if declaration.is_required() {
            return Err(StackError::MissingRequiredParameter {
                scope: scope.to_string(),
                name: name.clone(),
            });
        } else {
            resolved.absent.insert(name.clone());
        }
    }

    // Wrap before chained defaults are substituted so derived values stay secret.
    for (name, declaration) in declared {
        if declaration.secure
            && let Some(value) = resolved.values.get_mut(name)
        {
            *value = Value::secret(std::mem::take(value));
        }
    }

    resolve_default_chain(scope, &mut resolved, pending_defaults)?;

    for (name, declaration) in declared {
        let Some(value) = resolved.values.get_mut(name) else {
            continue;
        };
        validate(scope, name, declaration, value)?;
        if declaration.secure {
            *value = Value::secret(std::mem::take(value));
        }
    }

    tracing::trace!(scope, bound = resolved.values.len(), "Bound parameters");
    Ok(resolved)
}

/// Resolve defaults referencing other parameters, repeating until no progress.
fn resolve_default_chain(
    scope: &str,
    resolved: &mut ResolvedParams,
    mut pending: BTreeMap<&String, &Value>,
) -> Result<(), StackError> {
    while !pending.is_empty() {
        let mut progressed = Vec::new();
        for (name, default) in &pending {
            let waits_on_pending = default.placeholders().iter().any(|p| match p {
                Placeholder::Param(dep) => pending.contains_key(dep),
                Placeholder::Output(_) => false,
            });
            if waits_on_pending {
                continue;
            }
            let value = substitute_params(scope, default, resolved)?;
            progressed.push(((*name).clone(), value));
        }

        if progressed.is_empty() {
            let names = pending.keys().map(|n| n.as_str()).collect::<Vec<_>>().join(", ");
            return Err(StackError::InvalidParameterValue {
                scope: scope.to_string(),
                name: names,
                reason: "defaults reference each other in a cycle".to_string(),
            });
        }

        for (name, value) in progressed {
            pending.remove(&name);
            resolved.insert(name, value);
        }
    }

    Ok(())
}

/// Replace `${params.*}` placeholders with bound values of the same scope.
///
/// `${nodes.*}` placeholders are left untouched. Referencing an absent optional
/// parameter yields null; referencing an undeclared one is an error.
pub fn substitute_params(
    scope: &str,
    value: &Value,
    params: &ResolvedParams,
) -> Result<Value, StackError> {
    value.resolve(&|placeholder: &Placeholder| -> Result<Option<Value>, StackError> {
        match placeholder {
            Placeholder::Param(name) => match params.get(name) {
                Some(value) => Ok(Some(value.clone())),
                None if params.is_absent(name) => Ok(Some(Value::Null)),
                None => Err(StackError::UnknownParameter {
                    scope: scope.to_string(),
                    name: name.clone(),
                }),
            },
            Placeholder::Output(_) => Ok(None),
        }
    })
}

fn merge_inherited(declaration: &ParameterDeclaration, base: Option<&Value>, value: Value) -> Value {
    if declaration.param_type != ParamType::Object {
        return value;
    }
    match (base.and_then(Value::as_map), value) {
        (Some(base), Value::Map(overlay)) => {
            let mut merged = base.clone();
            merged.extend(overlay);
            Value::Map(merged)
        }
        (_, value) => value,
    }
}

fn validate(
    scope: &str,
    name: &str,
    declaration: &ParameterDeclaration,
    value: &Value,
) -> Result<(), StackError> {
    if !declaration.param_type.accepts(value) {
        return Err(StackError::InvalidParameterValue {
            scope: scope.to_string(),
            name: name.to_string(),
            reason: format!("expected {}, got {}", declaration.param_type, value.type_name()),
        });
    }

    let plain = match value {
        Value::Secret(inner) => inner.as_ref(),
        other => other,
    };
    if let Some(allowed) = &declaration.allowed
        && !plain.is_deferred()
        && !allowed.iter().any(|candidate| candidate == plain)
    {
        let options = allowed.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        let shown = if declaration.secure {
            crate::core::REDACTED.to_string()
        } else {
            plain.to_string()
        };
        return Err(StackError::InvalidParameterValue {
            scope: scope.to_string(),
            name: name.to_string(),
            reason: format!("'{shown}' is not one of [{options}]"),
        });
    }

    Ok(())
}
