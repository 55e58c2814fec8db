//! Deterministic, collision-resistant resource names.
//!
//! Cloud resource names often live in a global namespace (storage accounts,
//! search services) and carry tight length and character-set limits. A computed
//! name is built from a prefix and optional suffix parts, followed by a short
//! hash of the deployment scope, so two independent deployments of the same
//! blueprint never collide.
//!
//! Truncation always shortens the body and never the hash:
//!
//! ```rust
//! use stackplan::naming::resolve_name;
//!
//! let name = resolve_name("ewa-search", &["prod".to_string()], "/rg/ewa-mcp-rg", 20).unwrap();
//! assert!(name.len() <= 20);
//! assert!(name.starts_with("ewa-search-prod"));
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{DEFAULT_NAME_HASH_LENGTH, DEFAULT_NAME_MAX_LENGTH};
use crate::core::StackError;

/// Naming constraints of a provider resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameRule {
    /// Maximum length of the full name
    pub max_length: usize,
    /// Number of hex characters of the scope hash
    pub hash_length: usize,
    /// Separator placed between parts and before the hash
    pub separator: String,
    /// Whether `-` is allowed (storage accounts, registries forbid it)
    pub allow_hyphens: bool,
    /// Whether names are lowercased
    pub lowercase: bool,
}

impl Default for NameRule {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_NAME_MAX_LENGTH,
            hash_length: DEFAULT_NAME_HASH_LENGTH,
            separator: "-".to_string(),
            allow_hyphens: true,
            lowercase: true,
        }
    }
}

impl NameRule {
    /// Default rule with a different maximum length.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            ..Self::default()
        }
    }

    /// Alphanumeric-only rule, as used by storage accounts and registries.
    #[must_use]
    pub fn alphanumeric(max_length: usize) -> Self {
        Self {
            max_length,
            separator: String::new(),
            allow_hyphens: false,
            ..Self::default()
        }
    }

    fn sanitize(&self, part: &str) -> String {
        part.chars()
            .filter(|c| c.is_ascii_alphanumeric() || (self.allow_hyphens && *c == '-'))
            .map(|c| {
                if self.lowercase {
                    c.to_ascii_lowercase()
                } else {
                    c
                }
            })
            .collect()
    }
}

/// Lowercase hex hash of `scope_id`, `length` characters long.
#[must_use]
pub fn scope_hash(scope_id: &str, length: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..length.min(digest.len())].to_string()
}

/// Compute a name with the default rule and the given maximum length.
pub fn resolve_name(
    prefix: &str,
    suffix_parts: &[String],
    scope_id: &str,
    max_length: usize,
) -> Result<String, StackError> {
    resolve_name_with_rule(prefix, suffix_parts, scope_id, &NameRule::with_max_length(max_length))
}

/// Compute a name under `rule`.
///
/// Empty suffix parts are skipped, so an unset environment does not leave a
/// dangling separator. Fails with [`StackError::InvalidName`] when the rule
/// cannot fit the hash plus at least one character.
pub fn resolve_name_with_rule(
    prefix: &str,
    suffix_parts: &[String],
    scope_id: &str,
    rule: &NameRule,
) -> Result<String, StackError> {
    if rule.hash_length == 0 || rule.hash_length > 64 {
        return Err(StackError::InvalidName {
            node: prefix.to_string(),
            reason: format!("hash_length must be between 1 and 64, got {}", rule.hash_length),
        });
    }
    if rule.max_length < rule.hash_length + 1 {
        return Err(StackError::InvalidName {
            node: prefix.to_string(),
            reason: format!(
                "max_length {} is smaller than the hash length {} plus one character",
                rule.max_length, rule.hash_length
            ),
        });
    }

    let separator = rule.sanitize(&rule.separator);
    let body = std::iter::once(prefix)
        .chain(suffix_parts.iter().map(String::as_str))
        .map(|part| rule.sanitize(part))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(&separator);
    let body = body.trim_start_matches('-');
    let hash = scope_hash(scope_id, rule.hash_length);

    if body.is_empty() {
        return Ok(hash);
    }

    let available = rule.max_length - rule.hash_length;
    let name = if body.len() + separator.len() <= available {
        format!("{body}{separator}{hash}")
    } else if available > separator.len() {
        let kept = body[..available - separator.len()].trim_end_matches('-');
        if kept.is_empty() {
            hash
        } else {
            format!("{kept}{separator}{hash}")
        }
    } else {
        let kept = body[..available].trim_end_matches('-');
        format!("{kept}{hash}")
    };

    Ok(name)
}
