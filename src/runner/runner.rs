//! Task runner: drains the queue in order and runs single tasks on request.

use std::sync::{Arc, PoisonError, Weak};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::TaskRegistry;
use super::state::{RunnerState, RunnerStatus};
use super::store::{RunFilter, StoreError, StoredTask, TaskId, TaskStore};
use crate::config::RunnerConfig;
use crate::listener::{Notifier, RunnerEvent, RunnerListener, Scope, SkipReason, Subscription};
use crate::task::TaskHandler;

/// Why admission refused a task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionRejection {
    #[error("task tag must not be blank")]
    BlankTag,

    #[error("every task tagged '{tag}' must agree on having a group id (previously grouped: {previously_grouped})")]
    GroupMismatch { tag: String, previously_grouped: bool },
}

/// Error returned by runner operations.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("task {0} does not exist")]
    TaskNotFound(TaskId),

    #[error("task rejected: {0}")]
    AdmissionRejected(#[from] AdmissionRejection),

    #[error("task {0} is not the head of its group and cannot be run manually")]
    ManualRunNotAllowed(TaskId),

    #[error("task {0} reported success while an unresolved error is recorded for it")]
    StrictModeViolation(TaskId),

    #[error("no handler registered for tag '{0}'")]
    UnknownTag(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

/// Counts for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// How a `run_all` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing eligible was left.
    Completed(DrainSummary),
    /// Stopped between tasks by `cancel` or `clear`.
    Cancelled(DrainSummary),
    /// Another drain or single run held the runner; nothing was done.
    AlreadyRunning,
}

/// How a single task execution attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunOutcome {
    /// The handler succeeded. `retained` is true when new input arrived while
    /// it ran, so the row was kept to run again.
    Succeeded { retained: bool },
    /// The handler failed; the row was kept.
    Failed,
    /// A gate refused the task.
    Skipped(SkipReason),
    /// The row was gone by the time it was picked up.
    Vanished,
}

pub(crate) struct Inner<S> {
    pub(crate) store: S,
    pub(crate) registry: TaskRegistry,
    pub(crate) config: RunnerConfig,
    /// Admission, gate checks, and completion bookkeeping. Never held while a
    /// handler runs.
    pub(crate) state: Mutex<RunnerState>,
    /// Held for a whole drain pass or single run.
    pub(crate) run_lock: Mutex<()>,
    pub(crate) notifier: Notifier,
    pub(crate) cancel: std::sync::Mutex<CancellationToken>,
}

/// Handle to the queue engine. Cheap to clone; all clones share one queue.
///
/// Operations that may kick off work in the background (`submit`,
/// `resolve_error`) need a tokio runtime.
pub struct Runner<S: TaskStore> {
    pub(crate) inner: Arc<Inner<S>>,
}

impl<S: TaskStore> Clone for Runner<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: TaskStore + 'static> Runner<S> {
    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// The configuration the runner was built with.
    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// What the runner is doing right now.
    pub async fn status(&self) -> RunnerStatus {
        self.inner.state.lock().await.status
    }

    /// The task whose handler is executing, if any.
    pub async fn currently_running(&self) -> Option<StoredTask> {
        self.inner.state.lock().await.currently_running.clone()
    }

    /// Listen to events for every task.
    ///
    /// Only a weak reference is kept. Must be called within a tokio runtime.
    pub fn subscribe<L: RunnerListener + 'static>(&self, listener: &Arc<L>) -> Subscription {
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn RunnerListener> = weak;
        self.inner.notifier.subscribe(Scope::All, weak)
    }

    /// Listen to events for one task id. If that task is executing right now,
    /// the listener immediately gets `on_task_running`.
    pub async fn subscribe_task<L: RunnerListener + 'static>(
        &self,
        task_id: TaskId,
        listener: &Arc<L>,
    ) -> Subscription {
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn RunnerListener> = weak;
        let state = self.inner.state.lock().await;
        let subscription = self.inner.notifier.subscribe(Scope::Task(task_id), weak);

        if let Some(task) = state
            .currently_running
            .as_ref()
            .filter(|task| task.id == task_id)
        {
            self.inner.notifier.send_to(
                subscription,
                RunnerEvent::TaskRunning { task: task.clone() },
            );
        }

        subscription
    }

    /// Stop delivering events to a listener. Returns false if the
    /// subscription was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.inner.notifier.unsubscribe(subscription)
    }

    /// Fetch a task by id.
    pub async fn task(&self, id: TaskId) -> Result<Option<StoredTask>, RunnerError> {
        Ok(self.inner.store.get(id).await?)
    }

    /// Every persisted task in execution order.
    pub async fn all_tasks(&self) -> Result<Vec<StoredTask>, RunnerError> {
        Ok(self.inner.store.all_tasks().await?)
    }

    /// Number of tasks a drain pass with this filter would consider.
    pub async fn pending_count(&self, filter: &RunFilter) -> Result<usize, RunnerError> {
        Ok(self.inner.store.count_eligible(filter).await?)
    }

    /// Whether `run_task` would accept this task: it must be ungrouped or the
    /// head of its group.
    pub async fn is_task_able_to_manually_run(&self, id: TaskId) -> Result<bool, RunnerError> {
        let task = self.require_task(id).await?;
        let Some(group_id) = &task.group_id else {
            return Ok(true);
        };

        let head = self.inner.store.group_head(group_id).await?;
        Ok(head.is_some_and(|head| head.id == id))
    }

    /// Drain every eligible task once, oldest first.
    ///
    /// This is the entry point for periodic triggers. If a drain or single
    /// run is already active the call does nothing and returns
    /// [`DrainOutcome::AlreadyRunning`].
    pub async fn run_all(&self, filter: RunFilter) -> Result<DrainOutcome, RunnerError> {
        let Ok(_guard) = self.inner.run_lock.try_lock() else {
            debug!("Runner busy, ignoring drain request");
            return Ok(DrainOutcome::AlreadyRunning);
        };

        let token = self.cancel_token();
        {
            let mut state = self.inner.state.lock().await;
            state.reset_pass();
            state.status = RunnerStatus::DrainingAll;
        }

        let result = self.drain(&filter, &token).await;

        let mut state = self.inner.state.lock().await;
        state.reset_pass();
        state.status = RunnerStatus::Idle;
        drop(state);

        if let Ok(DrainOutcome::Completed(summary) | DrainOutcome::Cancelled(summary)) = &result {
            info!(
                group_id = filter.group_id.as_deref(),
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                "Drain pass finished"
            );
        }

        result
    }

    async fn drain(
        &self,
        filter: &RunFilter,
        token: &CancellationToken,
    ) -> Result<DrainOutcome, RunnerError> {
        let total = self.inner.store.count_eligible(filter).await?;
        info!(
            group_id = filter.group_id.as_deref(),
            total, "Running all tasks"
        );

        let mut summary = DrainSummary::default();
        loop {
            if token.is_cancelled() {
                info!("Drain pass cancelled");
                return Ok(DrainOutcome::Cancelled(summary));
            }

            let next = {
                let mut state = self.inner.state.lock().await;
                let excluded = state.excluded_groups();
                let next = self
                    .inner
                    .store
                    .next_eligible(state.cursor, &excluded, filter)
                    .await?;
                if let Some(task) = &next {
                    state.cursor = task.id;
                }
                next
            };

            let Some(task) = next else {
                debug!("All tasks complete");
                self.inner.notifier.emit(RunnerEvent::AllTasksComplete);
                return Ok(DrainOutcome::Completed(summary));
            };

            let outcome = self.execute(task.id).await?;
            let group_failed = match outcome {
                TaskRunOutcome::Succeeded { .. } => {
                    summary.succeeded += 1;
                    false
                }
                TaskRunOutcome::Failed => {
                    summary.failed += 1;
                    true
                }
                TaskRunOutcome::Skipped(_) => {
                    summary.skipped += 1;
                    true
                }
                TaskRunOutcome::Vanished => false,
            };

            if group_failed {
                if let Some(group_id) = &task.group_id {
                    self.fail_group(group_id, task.id, filter).await?;
                }
            }
        }
    }

    /// Exclude a group for the rest of the pass and tell listeners about the
    /// members that will be passed over.
    async fn fail_group(
        &self,
        group_id: &str,
        failed: TaskId,
        filter: &RunFilter,
    ) -> Result<(), RunnerError> {
        let mut state = self.inner.state.lock().await;
        if !state.fail_group(group_id) {
            return Ok(());
        }
        debug!(group_id, task_id = %failed, "Group failed, skipping its remaining tasks this pass");

        for member in self.inner.store.runnable_in_group(group_id).await? {
            if member.id == failed || !filter.matches(&member) {
                continue;
            }
            self.inner.notifier.emit(RunnerEvent::TaskSkipped {
                task: member,
                reason: SkipReason::PartOfFailedGroup,
            });
        }

        Ok(())
    }

    /// Run one task now, even if it is marked `manually_run` or automatic
    /// running is disabled. Waits for an active drain to finish first.
    ///
    /// Do not await this from inside a task handler: the handler's own run
    /// holds the runner.
    pub async fn run_task(&self, id: TaskId) -> Result<TaskRunOutcome, RunnerError> {
        if !self.is_task_able_to_manually_run(id).await? {
            return Err(RunnerError::ManualRunNotAllowed(id));
        }

        let _guard = self.inner.run_lock.lock().await;
        self.inner.state.lock().await.status = RunnerStatus::RunningSingle;

        let result = self.execute(id).await;

        self.inner.state.lock().await.status = RunnerStatus::Idle;
        result
    }

    /// Stop the active drain pass after the current task. A running handler is
    /// not interrupted.
    pub fn cancel(&self) {
        let mut token = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Cancel any drain and delete every task, error, and the rerun flag.
    ///
    /// Events produced before the clear that listeners have not seen yet are
    /// dropped. Subscriptions stay registered.
    pub async fn clear(&self) -> Result<(), RunnerError> {
        self.cancel();

        let mut state = self.inner.state.lock().await;
        self.inner.notifier.advance_epoch();
        self.inner.store.clear_all().await?;
        state.reset_pass();
        state.currently_running = None;

        info!("Cleared all tasks");
        Ok(())
    }

    pub(crate) async fn require_task(&self, id: TaskId) -> Result<StoredTask, RunnerError> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(RunnerError::TaskNotFound(id))
    }

    fn cancel_token(&self) -> CancellationToken {
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read the persisted rerun flag once at startup. A flag left set by a
    /// previous process means its in-flight task got new input; the row is
    /// still stored, so it simply stays pending.
    async fn recover(&self) -> Result<(), RunnerError> {
        if self.inner.store.rerun_flag().await? {
            info!("Task interrupted by restart had newer input; it stays pending");
            self.inner.store.set_rerun_flag(false).await?;
        }
        Ok(())
    }
}

/// Builder for constructing a Runner.
pub struct RunnerBuilder<S: TaskStore> {
    store: S,
    registry: TaskRegistry,
    config: RunnerConfig,
}

impl<S: TaskStore + 'static> RunnerBuilder<S> {
    /// Create a new builder with the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            registry: TaskRegistry::new(),
            config: RunnerConfig::default(),
        }
    }

    /// Register the handler for one task tag.
    pub fn handler(mut self, handler: impl TaskHandler + 'static) -> Self {
        self.registry.register(handler);
        self
    }

    /// Replace the registry wholesale.
    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the full configuration.
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable or disable running tasks without an explicit request.
    pub fn automatically_run_tasks(mut self, enabled: bool) -> Self {
        self.config.automatically_run_tasks = enabled;
        self
    }

    /// Turn strict mode on or off.
    pub fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    /// Build the runner and read persisted runner state.
    pub async fn build(self) -> Result<Runner<S>, RunnerError> {
        let runner = Runner {
            inner: Arc::new(Inner {
                store: self.store,
                registry: self.registry,
                config: self.config,
                state: Mutex::new(RunnerState::new()),
                run_lock: Mutex::new(()),
                notifier: Notifier::new(),
                cancel: std::sync::Mutex::new(CancellationToken::new()),
            }),
        };

        runner.recover().await?;
        Ok(runner)
    }
}
