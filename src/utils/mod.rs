//! Shared helpers.
//!
//! - [`fs`] - atomic writes and JSON file helpers
//! - [`lock`] - exclusive file locks around read-modify-write cycles
//! - [`progress`] - apply progress bar
//! - [`suggest`] - "did you mean" suggestions for misspelled ids

pub mod fs;
pub mod lock;
pub mod progress;
pub mod suggest;

pub use fs::{atomic_write, ensure_dir, read_json_file, write_json_file};
pub use lock::FileLock;
pub use progress::ProgressBar;
pub use suggest::{did_you_mean, suggest_similar};
