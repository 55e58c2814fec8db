//! Integration test suite for stackplan
//!
//! End-to-end tests of planning, applying and the CLI.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **apply_scenarios**: planner + executor against the fake provisioner
//! - **ewa_stack**: the demo blueprint under its parameter scenarios
//! - **cli**: the `stackplan` binary against the local provisioner

#[path = "../common/mod.rs"]
mod common;

mod apply_scenarios;
mod cli;
mod ewa_stack;
