//! Core types shared by every stackplan module.
//!
//! - [`error`]: the [`StackError`] enum and CLI-friendly [`ErrorContext`]
//! - [`value`]: the [`Value`] tree used for parameters and property bags

pub mod error;
pub mod value;

pub use error::{ErrorContext, StackError, user_friendly_error};
pub use value::{Fragment, OutputRef, Placeholder, PlaceholderResolver, REDACTED, Value};
