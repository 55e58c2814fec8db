//! Tagged-variant value tree for parameters and property bags.
//!
//! Every document in a blueprint (parameter values, module inputs, property bags,
//! tags) is parsed into a [`Value`]. Strings containing `${...}` placeholders are
//! parsed once, at load time, into [`Value::Template`] so that later passes can
//! find references by pattern matching rather than string scanning.
//!
//! Placeholder grammar:
//! - `${params.NAME}` refers to a parameter of the enclosing scope
//! - `${nodes.ID.KEY}` refers to output `KEY` of node `ID` in the same scope
//! - `$${` escapes a literal `${`
//!
//! Secure values travel as [`Value::Secret`]. Their `Display`, `Debug` and
//! `Serialize` forms are redacted; only [`Value::expose`] reveals them, and that is
//! reserved for the provisioning request.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::StackError;

/// Text shown in place of a secure value.
pub const REDACTED: &str = "<redacted>";

/// A reference to another node's output.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputRef {
    /// Node id; local to the scope until the planner qualifies it
    pub node: String,
    /// Output key, may itself contain dots (`keys.primary`)
    pub key: String,
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.key)
    }
}

/// A single `${...}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Placeholder {
    /// `${params.NAME}`
    Param(String),
    /// `${nodes.ID.KEY}`
    Output(OutputRef),
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Param(name) => write!(f, "${{params.{name}}}"),
            Self::Output(output) => write!(f, "${{nodes.{}.{}}}", output.node, output.key),
        }
    }
}

/// A piece of a template string.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Literal text
    Literal(String),
    /// Unresolved placeholder
    Placeholder(Placeholder),
}

/// A dynamically typed document.
#[derive(Clone, PartialEq, Default)]
pub enum Value {
    /// Absent / null
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Number (kept as JSON number so integers stay integers)
    Number(serde_json::Number),
    /// Plain string
    String(String),
    /// Ordered list
    List(Vec<Value>),
    /// Map with deterministic key order
    Map(BTreeMap<String, Value>),
    /// String with unresolved placeholders
    Template(Vec<Fragment>),
    /// Secure value; redacted everywhere except [`Value::expose`]
    Secret(Box<Value>),
}

/// Resolves placeholders during [`Value::resolve`].
///
/// Returning `Ok(None)` leaves the placeholder in place for a later pass.
pub trait PlaceholderResolver {
    /// Look up the value for a placeholder.
    fn lookup(&self, placeholder: &Placeholder) -> Result<Option<Value>, StackError>;
}

impl<F> PlaceholderResolver for F
where
    F: Fn(&Placeholder) -> Result<Option<Value>, StackError>,
{
    fn lookup(&self, placeholder: &Placeholder) -> Result<Option<Value>, StackError> {
        self(placeholder)
    }
}

impl Value {
    /// Build a string value.
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// Wrap a value as secure. Secrets are never nested.
    #[must_use]
    pub fn secret(value: Self) -> Self {
        match value {
            Self::Secret(_) => value,
            other => Self::Secret(Box::new(other)),
        }
    }

    /// Convert raw JSON into a value, parsing placeholders inside strings.
    pub fn from_json(raw: serde_json::Value) -> Result<Self, StackError> {
        Ok(match raw {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => parse_template(&s)?,
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect::<Result<_, _>>()?)
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| Ok((k, Self::from_json(v)?)))
                    .collect::<Result<_, StackError>>()?,
            ),
        })
    }

    /// Convert provider-returned JSON without placeholder parsing.
    #[must_use]
    pub fn literal(raw: &serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.clone()),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::literal).collect()),
            serde_json::Value::Object(map) => {
                Self::Map(map.iter().map(|(k, v)| (k.clone(), Self::literal(v))).collect())
            }
        }
    }

    /// Convert to JSON with secrets revealed. Only for provisioning requests.
    ///
    /// Unresolved templates render as their placeholder text.
    #[must_use]
    pub fn expose(&self) -> serde_json::Value {
        self.to_json(SecretMode::Reveal)
    }

    /// Convert to JSON with secrets replaced by [`REDACTED`].
    #[must_use]
    pub fn redacted(&self) -> serde_json::Value {
        self.to_json(SecretMode::Redact)
    }

    /// Convert to JSON with secrets replaced by a stable fingerprint.
    ///
    /// This is the form persisted in applied state: changes to a secret are
    /// detected without storing it.
    #[must_use]
    pub fn fingerprinted(&self) -> serde_json::Value {
        self.to_json(SecretMode::Fingerprint)
    }

    fn to_json(&self, mode: SecretMode) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json(mode)).collect())
            }
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json(mode))).collect(),
            ),
            Self::Template(fragments) => serde_json::Value::String(template_text(fragments)),
            Self::Secret(inner) => match mode {
                SecretMode::Reveal => inner.to_json(mode),
                SecretMode::Redact => serde_json::Value::String(REDACTED.to_string()),
                SecretMode::Fingerprint => {
                    serde_json::Value::String(fingerprint(&inner.to_json(SecretMode::Reveal)))
                }
            },
        }
    }

    /// Whether any part of this value is secure.
    #[must_use]
    pub fn contains_secret(&self) -> bool {
        match self {
            Self::Secret(_) => true,
            Self::List(items) => items.iter().any(Self::contains_secret),
            Self::Map(map) => map.values().any(Self::contains_secret),
            _ => false,
        }
    }

    /// Whether any placeholder remains unresolved.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        match self {
            Self::Template(_) => true,
            Self::Secret(inner) => inner.is_deferred(),
            Self::List(items) => items.iter().any(Self::is_deferred),
            Self::Map(map) => map.values().any(Self::is_deferred),
            _ => false,
        }
    }

    /// Collect every placeholder in this value.
    #[must_use]
    pub fn placeholders(&self) -> BTreeSet<Placeholder> {
        let mut found = BTreeSet::new();
        self.collect_placeholders(&mut found);
        found
    }

    /// Collect every output reference in this value.
    #[must_use]
    pub fn output_refs(&self) -> BTreeSet<OutputRef> {
        self.placeholders()
            .into_iter()
            .filter_map(|p| match p {
                Placeholder::Output(output) => Some(output),
                Placeholder::Param(_) => None,
            })
            .collect()
    }

    fn collect_placeholders(&self, found: &mut BTreeSet<Placeholder>) {
        match self {
            Self::Template(fragments) => {
                for fragment in fragments {
                    if let Fragment::Placeholder(p) = fragment {
                        found.insert(p.clone());
                    }
                }
            }
            Self::Secret(inner) => inner.collect_placeholders(found),
            Self::List(items) => items.iter().for_each(|v| v.collect_placeholders(found)),
            Self::Map(map) => map.values().for_each(|v| v.collect_placeholders(found)),
            _ => {}
        }
    }

    /// Substitute placeholders using `resolver`.
    ///
    /// A template that is exactly one placeholder takes the resolved value with its
    /// type intact. Mixed templates interpolate the textual form; interpolating a
    /// secret makes the whole string secret.
    pub fn resolve(&self, resolver: &dyn PlaceholderResolver) -> Result<Self, StackError> {
        match self {
            Self::Template(fragments) => resolve_template(fragments, resolver),
            Self::Secret(inner) => Ok(Self::secret(inner.resolve(resolver)?)),
            Self::List(items) => Ok(Self::List(
                items.iter().map(|v| v.resolve(resolver)).collect::<Result<_, _>>()?,
            )),
            Self::Map(map) => Ok(Self::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.resolve(resolver)?)))
                    .collect::<Result<_, StackError>>()?,
            )),
            other => Ok(other.clone()),
        }
    }

    /// Truthiness used by conditions: false, 0, "", null, and empty collections are false.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Self::String(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Map(map) => !map.is_empty(),
            Self::Template(_) => true,
            Self::Secret(inner) => inner.is_truthy(),
        }
    }

    /// Emptiness used by `empty(...)` conditions.
    #[must_use]
    pub fn is_empty_value(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.is_empty(),
            Self::List(items) => items.is_empty(),
            Self::Map(map) => map.is_empty(),
            Self::Secret(inner) => inner.is_empty_value(),
            _ => false,
        }
    }

    /// Look up a dotted path (`properties.endpoints.0.url`).
    ///
    /// Anything reached through a secret is returned wrapped as a secret, so a
    /// field of a secure object stays secure.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<Cow<'_, Self>> {
        let path = path.trim_start_matches('.');
        if path.is_empty() {
            return Some(Cow::Borrowed(self));
        }
        let (segment, rest) = path.split_once('.').unwrap_or((path, ""));
        let next = match self {
            Self::Map(map) => map.get(segment)?,
            Self::List(items) => items.get(segment.parse::<usize>().ok()?)?,
            Self::Secret(inner) => {
                let found = inner.get_path(path)?;
                return Some(Cow::Owned(Self::secret(found.into_owned())));
            }
            _ => return None,
        };
        next.get_path(rest)
    }

    /// Plain string contents, looking through secrets.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Secret(inner) => inner.as_str(),
            _ => None,
        }
    }

    /// Map contents, looking through secrets.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Map(map) => Some(map),
            Self::Secret(inner) => inner.as_map(),
            _ => None,
        }
    }

    /// Short type name for error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "array",
            Self::Map(_) => "object",
            Self::Template(_) => "template",
            Self::Secret(_) => "secret",
        }
    }

    /// Text used when interpolating into a string. `None` for collections.
    fn interpolation_text(&self) -> Option<String> {
        match self {
            Self::Null => Some(String::new()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Number(n) => Some(n.to_string()),
            Self::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SecretMode {
    Reveal,
    Redact,
    Fingerprint,
}

/// `sha256:<hex>` fingerprint of a JSON document.
#[must_use]
pub fn fingerprint(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn template_text(fragments: &[Fragment]) -> String {
    fragments
        .iter()
        .map(|f| match f {
            Fragment::Literal(text) => text.replace("${", "$${"),
            Fragment::Placeholder(p) => p.to_string(),
        })
        .collect()
}

fn resolve_template(
    fragments: &[Fragment],
    resolver: &dyn PlaceholderResolver,
) -> Result<Value, StackError> {
    if let [Fragment::Placeholder(p)] = fragments {
        return Ok(resolver.lookup(p)?.unwrap_or_else(|| Value::Template(fragments.to_vec())));
    }

    let mut out: Vec<Fragment> = Vec::new();
    let mut secret = false;
    for fragment in fragments {
        match fragment {
            Fragment::Literal(text) => push_literal(&mut out, text),
            Fragment::Placeholder(p) => match resolver.lookup(p)? {
                None => out.push(fragment.clone()),
                Some(value) => {
                    let value = match value {
                        Value::Secret(inner) => {
                            secret = true;
                            *inner
                        }
                        other => other,
                    };
                    match value {
                        Value::Template(inner) => {
                            for piece in inner {
                                match piece {
                                    Fragment::Literal(text) => push_literal(&mut out, &text),
                                    other => out.push(other),
                                }
                            }
                        }
                        scalar => {
                            let text = scalar.interpolation_text().ok_or_else(|| {
                                StackError::Other {
                                    message: format!(
                                        "Cannot interpolate a {} into a string at {p}",
                                        scalar.type_name()
                                    ),
                                }
                            })?;
                            push_literal(&mut out, &text);
                        }
                    }
                }
            },
        }
    }

    let value = match out.as_slice() {
        [] => Value::String(String::new()),
        [Fragment::Literal(text)] => Value::String(text.clone()),
        _ => Value::Template(out),
    };
    Ok(if secret { Value::secret(value) } else { value })
}

fn push_literal(out: &mut Vec<Fragment>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Fragment::Literal(last)) = out.last_mut() {
        last.push_str(text);
    } else {
        out.push(Fragment::Literal(text.to_string()));
    }
}

/// Parse a string into a plain string or a template.
pub fn parse_template(input: &str) -> Result<Value, StackError> {
    if !input.contains("${") {
        return Ok(Value::String(input.to_string()));
    }

    let mut fragments = Vec::new();
    let mut literal = String::new();
    let mut rest = input;

    while let Some(pos) = rest.find("${") {
        if pos > 0 && rest[..pos].ends_with('$') {
            literal.push_str(&rest[..pos - 1]);
            literal.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }
        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let end = after.find('}').ok_or_else(|| StackError::BlueprintParseError {
            file: "<value>".to_string(),
            reason: format!("unterminated placeholder in '{input}'"),
        })?;
        let placeholder = parse_placeholder(after[..end].trim(), input)?;
        if !literal.is_empty() {
            fragments.push(Fragment::Literal(std::mem::take(&mut literal)));
        }
        fragments.push(Fragment::Placeholder(placeholder));
        rest = &after[end + 1..];
    }
    literal.push_str(rest);

    if fragments.is_empty() {
        return Ok(Value::String(literal));
    }
    if !literal.is_empty() {
        fragments.push(Fragment::Literal(literal));
    }
    Ok(Value::Template(fragments))
}

fn parse_placeholder(body: &str, input: &str) -> Result<Placeholder, StackError> {
    let invalid = |reason: &str| StackError::BlueprintParseError {
        file: "<value>".to_string(),
        reason: format!("invalid placeholder '${{{body}}}' in '{input}': {reason}"),
    };

    if let Some(name) = body.strip_prefix("params.") {
        if name.is_empty() || name.contains('.') {
            return Err(invalid("expected ${params.NAME}"));
        }
        return Ok(Placeholder::Param(name.to_string()));
    }

    if let Some(rest) = body.strip_prefix("nodes.") {
        let (node, key) = rest.split_once('.').ok_or_else(|| invalid("expected ${nodes.ID.KEY}"))?;
        if node.is_empty() || key.is_empty() {
            return Err(invalid("expected ${nodes.ID.KEY}"));
        }
        return Ok(Placeholder::Output(OutputRef {
            node: node.to_string(),
            key: key.to_string(),
        }));
    }

    Err(invalid("placeholders start with 'params.' or 'nodes.'"))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Template(fragments) => write!(f, "{}", template_text(fragments)),
            Self::Secret(_) => write!(f, "{REDACTED}"),
            other => write!(f, "{}", other.redacted()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Self::String(s) => f.debug_tuple("String").field(s).finish(),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Self::Template(fragments) => f.debug_tuple("Template").field(fragments).finish(),
            Self::Secret(_) => write!(f, "Secret({REDACTED})"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.redacted().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Self::from_json(raw).map_err(serde::de::Error::custom)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}
