//! In-memory runner bookkeeping.

use std::collections::BTreeSet;

use serde::Serialize;

use super::store::{StoredTask, TaskId};

/// What the runner is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunnerStatus {
    Idle,
    DrainingAll,
    RunningSingle,
}

/// Process-wide state of the runner. Everything here is lost on restart; the
/// rerun flag lives in the store instead.
#[derive(Debug)]
pub(crate) struct RunnerState {
    /// Id of the last task visited in the current drain pass.
    pub cursor: TaskId,
    /// Groups that failed or were skipped in the current drain pass.
    pub failed_groups: BTreeSet<String>,
    pub currently_running: Option<StoredTask>,
    pub status: RunnerStatus,
}

impl RunnerState {
    pub fn new() -> Self {
        Self {
            cursor: TaskId(0),
            failed_groups: BTreeSet::new(),
            currently_running: None,
            status: RunnerStatus::Idle,
        }
    }

    /// Forget the drain pass position.
    pub fn reset_pass(&mut self) {
        self.cursor = TaskId(0);
        self.failed_groups.clear();
    }

    /// Mark a group failed for the rest of the pass. Returns true the first
    /// time the group is marked.
    pub fn fail_group(&mut self, group_id: &str) -> bool {
        self.failed_groups.insert(group_id.to_string())
    }

    pub fn excluded_groups(&self) -> Vec<String> {
        self.failed_groups.iter().cloned().collect()
    }

    /// The in-flight task, if it has the identity `(tag, data_id)`.
    pub fn is_running_identity(&self, tag: &str, data_id: Option<&str>) -> Option<&StoredTask> {
        self.currently_running
            .as_ref()
            .filter(|task| task.tag == tag && task.data_id.as_deref() == data_id)
    }
}
