//! Runner configuration.

use serde::Deserialize;

/// Behaviour switches for a [`Runner`](crate::Runner).
///
/// Deserializable so a host can keep it next to its own settings; every field
/// falls back to its default when absent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Run tasks without being asked: right after admission, after an error
    /// is resolved, and on each periodic trigger. Explicit `run_all` and
    /// `run_task` calls ignore this switch.
    pub automatically_run_tasks: bool,

    /// Fail a run with `StrictModeViolation` when a handler reports success
    /// while an error is still recorded for its task. When false the
    /// violation is only logged.
    pub strict: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            automatically_run_tasks: true,
            strict: false,
        }
    }
}
