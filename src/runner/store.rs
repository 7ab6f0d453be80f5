//! Task storage trait and types.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Unique identifier for a persisted task.
///
/// Assigned by the store on insert and never reused, even after `clear_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task as constructed by the caller, before it has been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub tag: String,
    pub data_id: Option<String>,
    pub group_id: Option<String>,
    pub manually_run: bool,
}

impl NewTask {
    /// Create a task of the given kind.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            data_id: None,
            group_id: None,
            manually_run: false,
        }
    }

    /// Set the business entity this task concerns.
    pub fn with_data_id(mut self, data_id: impl Into<String>) -> Self {
        self.data_id = Some(data_id.into());
        self
    }

    /// Place the task in a group that runs in strict relative order.
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Exclude the task from automatic draining.
    pub fn manually_run(mut self, manually_run: bool) -> Self {
        self.manually_run = manually_run;
        self
    }

    /// Returns true if `task` has the same `(tag, data_id)` identity.
    pub fn same_identity(&self, task: &StoredTask) -> bool {
        self.tag == task.tag && self.data_id == task.data_id
    }
}

/// A task retrieved from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredTask {
    pub id: TaskId,
    pub tag: String,
    pub data_id: Option<String>,
    pub group_id: Option<String>,
    pub manually_run: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredTask {
    /// Returns true if both tasks share the `(tag, data_id)` identity.
    pub fn same_identity(&self, other: &StoredTask) -> bool {
        self.tag == other.tag && self.data_id == other.data_id
    }
}

impl fmt::Display for StoredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} (tag: {}, data id: {}, group id: {}, manually run: {})",
            self.id,
            self.tag,
            self.data_id.as_deref().unwrap_or("none"),
            self.group_id.as_deref().unwrap_or("none"),
            self.manually_run
        )
    }
}

/// An unresolved error recorded against a task. At most one exists per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedError {
    pub task_id: TaskId,
    pub created_at: DateTime<Utc>,
    /// Human readable description, suitable for showing to the user.
    pub message: Option<String>,
    /// Caller-defined classification used to pick a fix-up flow.
    pub error_id: Option<String>,
}

/// Narrows a drain pass or a count to a subset of tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub group_id: Option<String>,
}

impl RunFilter {
    /// No filtering: every automatically runnable task.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only tasks belonging to `group_id`.
    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
        }
    }

    /// Returns true if `task` passes this filter.
    pub fn matches(&self, task: &StoredTask) -> bool {
        match &self.group_id {
            Some(group_id) => task.group_id.as_deref() == Some(group_id.as_str()),
            None => true,
        }
    }
}

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Trait for task storage backends.
///
/// Every method is atomic with respect to the others; no caller can observe a
/// partially written row.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new row with the given sort key.
    async fn insert(&self, task: &NewTask, created_at: DateTime<Utc>)
        -> Result<StoredTask, StoreError>;

    /// Replace every row sharing the task's `(tag, data_id)` identity with a
    /// single fresh row. The replacement always receives a new id.
    async fn replace_by_identity(
        &self,
        task: &NewTask,
        created_at: DateTime<Utc>,
    ) -> Result<StoredTask, StoreError>;

    /// Fetch a task by id.
    async fn get(&self, id: TaskId) -> Result<Option<StoredTask>, StoreError>;

    /// All rows with the given identity, oldest first.
    async fn find_by_identity(
        &self,
        tag: &str,
        data_id: Option<&str>,
    ) -> Result<Vec<StoredTask>, StoreError>;

    /// Any one row with the given tag.
    async fn find_by_tag(&self, tag: &str) -> Result<Option<StoredTask>, StoreError>;

    /// The earliest row of a group.
    async fn group_head(&self, group_id: &str) -> Result<Option<StoredTask>, StoreError>;

    /// The latest row of a group.
    async fn group_tail(&self, group_id: &str) -> Result<Option<StoredTask>, StoreError>;

    /// Automatically runnable rows of a group, oldest first.
    async fn runnable_in_group(&self, group_id: &str) -> Result<Vec<StoredTask>, StoreError>;

    /// The oldest automatically runnable row with `id > after` whose group is
    /// not in `excluded_groups`.
    async fn next_eligible(
        &self,
        after: TaskId,
        excluded_groups: &[String],
        filter: &RunFilter,
    ) -> Result<Option<StoredTask>, StoreError>;

    /// Number of automatically runnable rows matching the filter.
    async fn count_eligible(&self, filter: &RunFilter) -> Result<usize, StoreError>;

    /// Every row, oldest first.
    async fn all_tasks(&self) -> Result<Vec<StoredTask>, StoreError>;

    /// Delete a task (and its error). Returns false if the id did not exist.
    async fn delete(&self, id: TaskId) -> Result<bool, StoreError>;

    /// The recorded error for a task, if any.
    async fn error_for(&self, task_id: TaskId) -> Result<Option<RecordedError>, StoreError>;

    /// Record an error, replacing any existing one for the same task.
    async fn upsert_error(
        &self,
        task_id: TaskId,
        message: Option<&str>,
        error_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<RecordedError, StoreError>;

    /// Delete the error for a task. Returns false if there was none.
    async fn delete_error(&self, task_id: TaskId) -> Result<bool, StoreError>;

    /// Every recorded error, oldest first.
    async fn all_errors(&self) -> Result<Vec<RecordedError>, StoreError>;

    /// Read the durable "rerun the in-flight task" flag.
    async fn rerun_flag(&self) -> Result<bool, StoreError>;

    /// Write the durable "rerun the in-flight task" flag.
    async fn set_rerun_flag(&self, rerun: bool) -> Result<(), StoreError>;

    /// Delete every task, error, and flag.
    async fn clear_all(&self) -> Result<(), StoreError>;
}
