//! Progress indicator for apply runs.
//!
//! Wraps `indicatif` with stackplan styling. The bar is hidden when
//! `STACKPLAN_NO_PROGRESS` is set, when the caller disables it (`--no-progress`,
//! `--quiet`, `--json`), and automatically by `indicatif` when stderr is not a
//! terminal.

use indicatif::{ProgressBar as IndicatifBar, ProgressStyle as IndicatifStyle};

/// Environment variable that disables progress output.
pub const NO_PROGRESS_ENV: &str = "STACKPLAN_NO_PROGRESS";

fn is_progress_disabled() -> bool {
    std::env::var_os(NO_PROGRESS_ENV).is_some()
}

/// Progress bar counting settled nodes.
#[derive(Clone)]
pub struct ProgressBar {
    inner: IndicatifBar,
}

impl ProgressBar {
    /// Bar over `len` nodes; hidden unless `enabled` and not disabled by env.
    #[must_use]
    pub fn new(len: u64, enabled: bool) -> Self {
        let bar = if enabled && !is_progress_disabled() {
            let bar = IndicatifBar::new(len);
            bar.set_style(default_style());
            bar.set_prefix("Applying");
            bar
        } else {
            IndicatifBar::hidden()
        };
        Self {
            inner: bar,
        }
    }

    /// Bar that never draws.
    #[must_use]
    pub fn hidden() -> Self {
        Self {
            inner: IndicatifBar::hidden(),
        }
    }

    /// Set the trailing message, usually the nodes in flight.
    pub fn set_message(&self, msg: impl Into<String>) {
        self.inner.set_message(msg.into());
    }

    /// Advance by `delta` settled nodes.
    pub fn inc(&self, delta: u64) {
        self.inner.inc(delta);
    }

    /// Print a line above the bar without tearing it.
    pub fn println(&self, line: impl AsRef<str>) {
        if self.inner.is_hidden() {
            return;
        }
        self.inner.println(line.as_ref());
    }

    /// Current position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.inner.position()
    }

    /// Remove the bar from the terminal.
    pub fn finish_and_clear(&self) {
        self.inner.finish_and_clear();
    }
}

fn default_style() -> IndicatifStyle {
    IndicatifStyle::default_bar()
        .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| IndicatifStyle::default_bar())
        .progress_chars("━╸━")
}
