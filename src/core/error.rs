//! Error handling for stackplan
//!
//! This module provides the typed error enum used across the planner and the
//! executor, plus user-friendly error reporting for the CLI. The error system
//! follows two principles:
//! 1. **Strongly-typed errors** so callers can match on the failure kind
//! 2. **User-friendly messages** with actionable suggestions for CLI users
//!
//! # Error Categories
//!
//! - **Binding**: [`StackError::MissingRequiredParameter`], [`StackError::UnknownParameter`],
//!   [`StackError::InvalidParameterValue`]
//! - **Naming**: [`StackError::InvalidName`]
//! - **Conditions**: [`StackError::InvalidCondition`], [`StackError::NonStaticCondition`]
//! - **Graph**: [`StackError::DuplicateNodeId`], [`StackError::DanglingReference`],
//!   [`StackError::CyclicDependency`], [`StackError::UnknownModule`]
//! - **Convergence**: [`StackError::ReplacementRequired`]
//! - **Provisioning**: [`StackError::ProvisioningConflict`], [`StackError::ProvisioningThrottled`],
//!   [`StackError::ProvisioningRejected`], [`StackError::PartialApply`]
//!
//! Binding, naming, condition and graph errors are raised while planning, before any
//! provisioning call is issued. Provisioning errors are scoped to a single node and
//! are collected into the apply report.
//!
//! # Examples
//!
//! ```rust,no_run
//! use stackplan::core::{ErrorContext, StackError, user_friendly_error};
//!
//! let error = StackError::MissingRequiredParameter {
//!     scope: "main".to_string(),
//!     name: "personResponsible".to_string(),
//! };
//! let context = user_friendly_error(anyhow::Error::from(error));
//! context.display();
//! ```

use colored::Colorize;
use std::fmt;
use thiserror::Error;

/// The main error type for stackplan operations.
#[derive(Error, Debug)]
pub enum StackError {
    /// A required parameter was neither supplied, defaulted, nor inherited
    #[error("Missing required parameter '{name}' in scope '{scope}'")]
    MissingRequiredParameter {
        /// Module scope that declares the parameter
        scope: String,
        /// Parameter name
        name: String,
    },

    /// A value was supplied for a parameter the scope does not declare
    #[error("Unknown parameter '{name}' supplied to scope '{scope}'")]
    UnknownParameter {
        /// Module scope receiving the value
        scope: String,
        /// Supplied parameter name
        name: String,
    },

    /// A parameter value has the wrong type or is outside its allowed set
    #[error("Invalid value for parameter '{name}' in scope '{scope}': {reason}")]
    InvalidParameterValue {
        /// Module scope that declares the parameter
        scope: String,
        /// Parameter name
        name: String,
        /// Why the value was rejected
        reason: String,
    },

    /// A computed name cannot satisfy its naming rule
    #[error("Invalid name for '{node}': {reason}")]
    InvalidName {
        /// Node (or prefix) the name was computed for
        node: String,
        /// Why the name could not be produced
        reason: String,
    },

    /// A condition expression could not be parsed or evaluated
    #[error("Invalid condition '{expression}': {reason}")]
    InvalidCondition {
        /// The raw expression
        expression: String,
        /// Parse or evaluation failure
        reason: String,
    },

    /// A condition depends on a value only known after apply
    #[error("Condition on '{node}' depends on parameter '{parameter}', which is only known after apply")]
    NonStaticCondition {
        /// Node or module instance carrying the condition
        node: String,
        /// Parameter holding a deferred value
        parameter: String,
    },

    /// Two nodes share a logical id inside the same scope
    #[error("Duplicate node id '{id}' in scope '{scope}'")]
    DuplicateNodeId {
        /// Module scope
        scope: String,
        /// Duplicated logical id
        id: String,
    },

    /// A module instance references a module the blueprint does not define
    #[error("Module '{module}' referenced by '{instance}' is not defined")]
    UnknownModule {
        /// Instance id
        instance: String,
        /// Missing module name
        module: String,
    },

    /// A reference targets a node that does not exist or is excluded
    #[error("Node '{from}' references '{target}', {reason}")]
    DanglingReference {
        /// Referencing node
        from: String,
        /// Unresolved target (node id or `node.output`)
        target: String,
        /// Why the target cannot be resolved
        reason: String,
    },

    /// The dependency graph contains a cycle
    #[error("Circular dependency detected: {cycle}")]
    CyclicDependency {
        /// Full cycle path, e.g. `a → b → a`
        cycle: String,
    },

    /// An immutable field changed and the resource would have to be recreated
    #[error("Resource '{node}' requires replacement: {field} changed from {old} to {new}")]
    ReplacementRequired {
        /// Node id
        node: String,
        /// Immutable field that differs
        field: String,
        /// Last applied value
        old: String,
        /// Desired value
        new: String,
    },

    /// Another apply is in progress for the same logical id
    #[error("Provisioning conflict for '{node}': {message}")]
    ProvisioningConflict {
        /// Node id
        node: String,
        /// Provider message
        message: String,
    },

    /// The control plane rate-limited the request
    #[error("Provisioning throttled for '{node}': {message}")]
    ProvisioningThrottled {
        /// Node id
        node: String,
        /// Provider message
        message: String,
    },

    /// The control plane permanently rejected the request
    #[error("Provisioning rejected for '{node}': {message}")]
    ProvisioningRejected {
        /// Node id
        node: String,
        /// Provider message, verbatim
        message: String,
    },

    /// Some nodes failed or were skipped during apply
    #[error("Apply finished with {failed} failed and {skipped} skipped nodes:\n{summary}")]
    PartialApply {
        /// Number of failed nodes
        failed: usize,
        /// Number of skipped nodes
        skipped: usize,
        /// Per-node status lines
        summary: String,
    },

    /// Blueprint file could not be parsed or is structurally invalid
    #[error("Invalid blueprint {file}: {reason}")]
    BlueprintParseError {
        /// Blueprint path or `<inline>`
        file: String,
        /// Parse failure
        reason: String,
    },

    /// Applied-state file could not be parsed
    #[error("Invalid state file {file}: {reason}")]
    StateParseError {
        /// State path
        file: String,
        /// Parse failure
        reason: String,
    },

    /// Configuration problem
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Description of the problem
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{message}")]
    Other {
        /// Generic error message
        message: String,
    },
}

impl StackError {
    /// Whether a provisioning error may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ProvisioningConflict { .. } | Self::ProvisioningThrottled { .. })
    }

    /// Whether this error is raised before any side effect occurs.
    #[must_use]
    pub const fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::MissingRequiredParameter { .. }
                | Self::UnknownParameter { .. }
                | Self::InvalidParameterValue { .. }
                | Self::InvalidName { .. }
                | Self::InvalidCondition { .. }
                | Self::NonStaticCondition { .. }
                | Self::DuplicateNodeId { .. }
                | Self::UnknownModule { .. }
                | Self::DanglingReference { .. }
                | Self::CyclicDependency { .. }
                | Self::BlueprintParseError { .. }
        )
    }
}

impl Clone for StackError {
    fn clone(&self) -> Self {
        match self {
            Self::IoError(e) => Self::IoError(std::io::Error::new(e.kind(), e.to_string())),
            Self::MissingRequiredParameter {
                scope,
                name,
            } => Self::MissingRequiredParameter {
                scope: scope.clone(),
                name: name.clone(),
            },
            Self::UnknownParameter {
                scope,
                name,
            } => Self::UnknownParameter {
                scope: scope.clone(),
                name: name.clone(),
            },
            Self::InvalidParameterValue {
                scope,
                name,
                reason,
            } => Self::InvalidParameterValue {
                scope: scope.clone(),
                name: name.clone(),
                reason: reason.clone(),
            },
            Self::InvalidName {
                node,
                reason,
            } => Self::InvalidName {
                node: node.clone(),
                reason: reason.clone(),
            },
            Self::InvalidCondition {
                expression,
                reason,
            } => Self::InvalidCondition {
                expression: expression.clone(),
                reason: reason.clone(),
            },
            Self::NonStaticCondition {
                node,
                parameter,
            } => Self::NonStaticCondition {
                node: node.clone(),
                parameter: parameter.clone(),
            },
            Self::DuplicateNodeId {
                scope,
                id,
            } => Self::DuplicateNodeId {
                scope: scope.clone(),
                id: id.clone(),
            },
            Self::UnknownModule {
                instance,
                module,
            } => Self::UnknownModule {
                instance: instance.clone(),
                module: module.clone(),
            },
            Self::DanglingReference {
                from,
                target,
                reason,
            } => Self::DanglingReference {
                from: from.clone(),
                target: target.clone(),
                reason: reason.clone(),
            },
            Self::CyclicDependency {
                cycle,
            } => Self::CyclicDependency {
                cycle: cycle.clone(),
            },
            Self::ReplacementRequired {
                node,
                field,
                old,
                new,
            } => Self::ReplacementRequired {
                node: node.clone(),
                field: field.clone(),
                old: old.clone(),
                new: new.clone(),
            },
            Self::ProvisioningConflict {
                node,
                message,
            } => Self::ProvisioningConflict {
                node: node.clone(),
                message: message.clone(),
            },
            Self::ProvisioningThrottled {
                node,
                message,
            } => Self::ProvisioningThrottled {
                node: node.clone(),
                message: message.clone(),
            },
            Self::ProvisioningRejected {
                node,
                message,
            } => Self::ProvisioningRejected {
                node: node.clone(),
                message: message.clone(),
            },
            Self::PartialApply {
                failed,
                skipped,
                summary,
            } => Self::PartialApply {
                failed: *failed,
                skipped: *skipped,
                summary: summary.clone(),
            },
            Self::BlueprintParseError {
                file,
                reason,
            } => Self::BlueprintParseError {
                file: file.clone(),
                reason: reason.clone(),
            },
            Self::StateParseError {
                file,
                reason,
            } => Self::StateParseError {
                file: file.clone(),
                reason: reason.clone(),
            },
            Self::ConfigError {
                message,
            } => Self::ConfigError {
                message: message.clone(),
            },
            Self::Other {
                message,
            } => Self::Other {
                message: message.clone(),
            },
        }
    }
}

/// Error wrapper carrying a suggestion and details for terminal display.
///
/// ```rust,no_run
/// use stackplan::core::{ErrorContext, StackError};
///
/// let context = ErrorContext::new(StackError::Other { message: "boom".into() })
///     .with_suggestion("Re-run with --verbose")
///     .with_details("The control plane returned an unexpected status");
/// context.display();
/// ```
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying error
    pub error: StackError,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with no suggestion or details.
    #[must_use]
    pub const fn new(error: StackError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add an actionable suggestion, shown in green.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add explanatory details, shown in yellow.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error, details and suggestion to stderr with terminal colors.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert any error to a user-friendly [`ErrorContext`] with actionable suggestions.
///
/// Recognizes [`StackError`] variants anywhere in the error chain, IO errors and
/// TOML parse errors. Anything else is reported with its full cause chain.
#[must_use]
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    for cause in error.chain() {
        if let Some(stack_error) = cause.downcast_ref::<StackError>() {
            return create_error_context(stack_error.clone());
        }
    }

    if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
        match io_error.kind() {
            std::io::ErrorKind::PermissionDenied => {
                return ErrorContext::new(StackError::Other {
                    message: error.to_string(),
                })
                .with_suggestion("Check ownership of the state directory and blueprint file")
                .with_details("stackplan could not read or write a file it needs");
            }
            std::io::ErrorKind::NotFound => {
                return ErrorContext::new(StackError::Other {
                    message: error.to_string(),
                })
                .with_suggestion("Check that the blueprint path passed with --blueprint exists");
            }
            _ => {}
        }
    }

    if let Some(toml_error) = error.downcast_ref::<toml::de::Error>() {
        return ErrorContext::new(StackError::BlueprintParseError {
            file: "<toml>".to_string(),
            reason: toml_error.to_string(),
        })
        .with_suggestion("Check the TOML syntax. Verify quotes, brackets, and table headers");
    }

    let mut message = error.to_string();
    let chain: Vec<String> = error.chain().skip(1).map(std::string::ToString::to_string).collect();

    if !chain.is_empty() {
        message.push_str("\n\nCaused by:");
        for (i, cause) in chain.iter().enumerate() {
            message.push_str(&format!("\n  {}: {}", i + 1, cause));
        }
    }

    ErrorContext::new(StackError::Other {
        message,
    })
}

/// Map each [`StackError`] variant to an [`ErrorContext`] with tailored suggestions.
fn create_error_context(error: StackError) -> ErrorContext {
    match &error {
        StackError::MissingRequiredParameter {
            name,
            ..
        } => {
            let suggestion = format!("Pass a value with --set {name}=<value> or declare a default");
            ErrorContext::new(error).with_suggestion(suggestion)
        }
        StackError::UnknownParameter {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Check the parameter name against the [parameters] table of the scope"),
        StackError::InvalidName {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Raise max_length or shorten hash_length in the name rule")
            .with_details("A name must keep at least one character in front of the scope hash"),
        StackError::NonStaticCondition {
            ..
        } => ErrorContext::new(error).with_details(
            "Conditions are evaluated once while planning and cannot depend on node outputs",
        ),
        StackError::DanglingReference {
            ..
        } => ErrorContext::new(error).with_suggestion(
            "Give the referencing node the same condition as its target, or remove the reference",
        ),
        StackError::CyclicDependency {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Remove one of the depends_on entries or references forming the cycle")
            .with_details("No provisioning call was issued"),
        StackError::ReplacementRequired {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Delete the resource manually or restore the previous value")
            .with_details("Replacing a resource is destructive and is never done implicitly"),
        StackError::ProvisioningRejected {
            ..
        } => ErrorContext::new(error)
            .with_details("The control plane rejected the request permanently; it was not retried"),
        StackError::PartialApply {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Fix the failed nodes and run apply again; applied nodes converge as no-ops")
            .with_details("Already applied resources were not rolled back"),
        StackError::BlueprintParseError {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Check the blueprint syntax and placeholder spelling (${params.x}, ${nodes.id.key})"),
        _ => ErrorContext::new(error),
    }
}
