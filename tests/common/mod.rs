//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use offqueue::{
    Runner, RunnerBuilder, RunnerEvent, RunnerListener, SkipReason, SqliteTaskStore, StoredTask,
    TaskContext, TaskHandler, TaskResult,
};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub async fn setup_store() -> SqliteTaskStore {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await.unwrap();
    store
}

/// A runner with `Sync`, `Upload` and `Album` handlers driven by `script`.
/// Nothing runs unless the test asks for it.
pub async fn manual_runner(store: SqliteTaskStore, script: &Arc<Script>) -> Runner<SqliteTaskStore> {
    scripted_builder(store, script)
        .automatically_run_tasks(false)
        .build()
        .await
        .unwrap()
}

pub fn scripted_builder(
    store: SqliteTaskStore,
    script: &Arc<Script>,
) -> RunnerBuilder<SqliteTaskStore> {
    RunnerBuilder::new(store)
        .handler(ScriptedHandler::new("Sync", script))
        .handler(ScriptedHandler::new("Upload", script))
        .handler(ScriptedHandler::new("Album", script))
}

fn label(task: &StoredTask) -> String {
    task.data_id.clone().unwrap_or_else(|| task.tag.clone())
}

/// Decides how scripted handlers behave, keyed by data id, and logs runs.
#[derive(Default)]
pub struct Script {
    runs: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    erroring: Mutex<HashSet<String>>,
    dirty_success: Mutex<HashSet<String>>,
    blocked: AtomicBool,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Data ids in the order their handlers ran.
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }

    pub fn fail(&self, data_id: &str) {
        self.failing.lock().unwrap().insert(data_id.to_string());
    }

    pub fn succeed(&self, data_id: &str) {
        self.failing.lock().unwrap().remove(data_id);
        self.erroring.lock().unwrap().remove(data_id);
        self.dirty_success.lock().unwrap().remove(data_id);
    }

    /// Record an error for the user, then fail.
    pub fn record_error(&self, data_id: &str) {
        self.erroring.lock().unwrap().insert(data_id.to_string());
    }

    /// Record an error, then claim success anyway.
    pub fn record_error_and_succeed(&self, data_id: &str) {
        self.dirty_success.lock().unwrap().insert(data_id.to_string());
    }

    /// Make `can_run` return false.
    pub fn block(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }
}

pub struct ScriptedHandler {
    tag: &'static str,
    script: Arc<Script>,
}

impl ScriptedHandler {
    pub fn new(tag: &'static str, script: &Arc<Script>) -> Self {
        Self {
            tag,
            script: script.clone(),
        }
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    fn tag(&self) -> &'static str {
        self.tag
    }

    async fn run(&self, task: &StoredTask, ctx: &TaskContext) -> anyhow::Result<TaskResult> {
        let label = label(task);
        self.script.runs.lock().unwrap().push(label.clone());

        if self.script.erroring.lock().unwrap().contains(&label) {
            ctx.record_error(Some("needs attention"), Some("E_USER")).await?;
            return Ok(TaskResult::Failed);
        }
        if self.script.dirty_success.lock().unwrap().contains(&label) {
            ctx.record_error(Some("still broken"), None).await?;
            return Ok(TaskResult::Success);
        }
        if self.script.failing.lock().unwrap().contains(&label) {
            return Ok(TaskResult::Failed);
        }
        Ok(TaskResult::Success)
    }

    fn can_run(&self, _task: &StoredTask) -> bool {
        !self.script.blocked.load(Ordering::SeqCst)
    }
}

/// Handler that returns an `Err` instead of a result.
pub struct BrokenHandler;

#[async_trait]
impl TaskHandler for BrokenHandler {
    fn tag(&self) -> &'static str {
        "Broken"
    }

    async fn run(&self, _task: &StoredTask, _ctx: &TaskContext) -> anyhow::Result<TaskResult> {
        anyhow::bail!("connection reset")
    }
}

/// Handler that parks inside its body until the test releases it.
#[derive(Clone)]
pub struct GateHandler {
    tag: &'static str,
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
    runs: Arc<AtomicUsize>,
    records_error: bool,
}

impl GateHandler {
    pub fn new(tag: &'static str) -> Self {
        Self {
            tag,
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            runs: Arc::new(AtomicUsize::new(0)),
            records_error: false,
        }
    }

    /// Record an error once released, then claim success anyway.
    pub fn recording_error(mut self) -> Self {
        self.records_error = true;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for GateHandler {
    fn tag(&self) -> &'static str {
        self.tag
    }

    async fn run(&self, _task: &StoredTask, ctx: &TaskContext) -> anyhow::Result<TaskResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        if self.records_error {
            ctx.record_error(Some("still broken"), None).await?;
        }
        Ok(TaskResult::Success)
    }
}

/// Listener that keeps every event it receives.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<RunnerEvent>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RunnerEvent> {
        self.events.lock().unwrap().clone()
    }

    /// `(label, reason)` for every skip event.
    pub fn skips(&self) -> Vec<(String, SkipReason)> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                RunnerEvent::TaskSkipped { task, reason } => Some((label(task), *reason)),
                _ => None,
            })
            .collect()
    }

    /// `(label, success, rescheduled)` for every completion.
    pub fn completions(&self) -> Vec<(String, bool, bool)> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                RunnerEvent::TaskComplete {
                    task,
                    success,
                    rescheduled,
                } => Some((label(task), *success, *rescheduled)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&RunnerEvent) -> bool) -> usize {
        self.events().iter().filter(|event| pred(event)).count()
    }

    /// Wait until `pred` holds for the events seen so far. Returns false after
    /// two seconds.
    pub async fn wait_for(&self, pred: impl Fn(&[RunnerEvent]) -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if pred(self.events().as_slice()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    pub async fn wait_for_drain(&self) -> bool {
        self.wait_for(|events| events.contains(&RunnerEvent::AllTasksComplete))
            .await
    }

    fn push(&self, event: RunnerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RunnerListener for EventLog {
    fn on_task_added(&self, task: &StoredTask) {
        self.push(RunnerEvent::TaskAdded { task: task.clone() });
    }

    fn on_task_running(&self, task: &StoredTask) {
        self.push(RunnerEvent::TaskRunning { task: task.clone() });
    }

    fn on_task_skipped(&self, task: &StoredTask, reason: SkipReason) {
        self.push(RunnerEvent::TaskSkipped {
            task: task.clone(),
            reason,
        });
    }

    fn on_task_complete(&self, task: &StoredTask, success: bool, rescheduled: bool) {
        self.push(RunnerEvent::TaskComplete {
            task: task.clone(),
            success,
            rescheduled,
        });
    }

    fn on_error_recorded(&self, task: &StoredTask, message: Option<&str>, error_id: Option<&str>) {
        self.push(RunnerEvent::ErrorRecorded {
            task: task.clone(),
            message: message.map(str::to_string),
            error_id: error_id.map(str::to_string),
        });
    }

    fn on_error_resolved(&self, task: &StoredTask) {
        self.push(RunnerEvent::ErrorResolved { task: task.clone() });
    }

    fn on_all_tasks_complete(&self) {
        self.push(RunnerEvent::AllTasksComplete);
    }
}
