//! Single task execution: eligibility gates, the handler call, and completion
//! bookkeeping.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::runner::{Runner, RunnerError, TaskRunOutcome};
use super::store::{StoreError, StoredTask, TaskId, TaskStore};
use crate::listener::{RunnerEvent, SkipReason};
use crate::task::{TaskContext, TaskHandler, TaskResult};

enum Gate {
    Run(Arc<dyn TaskHandler>),
    Skip(SkipReason),
}

impl<S: TaskStore + 'static> Runner<S> {
    /// Run one task through the gates and, if they pass, its handler.
    ///
    /// The caller must hold the run lock. The state lock is released while
    /// the handler runs so it can submit tasks and record errors.
    pub(crate) async fn execute(&self, id: TaskId) -> Result<TaskRunOutcome, RunnerError> {
        let (task, handler, epoch) = {
            let mut state = self.inner.state.lock().await;

            let Some(task) = self.inner.store.get(id).await? else {
                debug!(task_id = %id, "Task no longer exists, nothing to run");
                return Ok(TaskRunOutcome::Vanished);
            };

            let handler = match self.check_gates(&task).await? {
                Gate::Run(handler) => handler,
                Gate::Skip(reason) => {
                    debug!(task_id = %task.id, tag = %task.tag, %reason, "Skipping task");
                    self.inner
                        .notifier
                        .emit(RunnerEvent::TaskSkipped { task, reason });
                    return Ok(TaskRunOutcome::Skipped(reason));
                }
            };

            state.currently_running = Some(task.clone());
            self.inner
                .notifier
                .emit(RunnerEvent::TaskRunning { task: task.clone() });
            (task, handler, self.inner.notifier.epoch())
        };

        info!(task_id = %task.id, tag = %task.tag, data_id = task.data_id.as_deref(), "Running task");

        let ctx = TaskContext::new(task.id, Arc::new(self.clone()));
        let result = match handler.run(&task, &ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(task_id = %task.id, tag = %task.tag, error = %e, "Task handler returned an error");
                TaskResult::Failed
            }
        };

        self.finish(task, result, epoch).await
    }

    async fn check_gates(&self, task: &StoredTask) -> Result<Gate, RunnerError> {
        if let Some(group_id) = &task.group_id {
            let head = self.inner.store.group_head(group_id).await?;
            if head.is_some_and(|head| head.id != task.id) {
                return Ok(Gate::Skip(SkipReason::NotReadyToRun));
            }
        }

        let Some(handler) = self.inner.registry.get(&task.tag) else {
            warn!(task_id = %task.id, tag = %task.tag, "No handler registered for persisted task");
            return Ok(Gate::Skip(SkipReason::NotReadyToRun));
        };

        if !handler.can_run(task) {
            return Ok(Gate::Skip(SkipReason::NotReadyToRun));
        }

        if self.inner.store.error_for(task.id).await?.is_some() {
            return Ok(Gate::Skip(SkipReason::UnresolvedRecordedError));
        }

        Ok(Gate::Run(handler))
    }

    async fn finish(
        &self,
        task: StoredTask,
        result: TaskResult,
        epoch: u64,
    ) -> Result<TaskRunOutcome, RunnerError> {
        let mut state = self.inner.state.lock().await;
        state.currently_running = None;

        if self.inner.notifier.epoch() != epoch {
            debug!(task_id = %task.id, "Queue was cleared while the task ran, dropping its result");
            return Ok(TaskRunOutcome::Vanished);
        }

        match result {
            TaskResult::Success => {
                if self.inner.store.error_for(task.id).await?.is_some() {
                    if self.inner.config.strict {
                        error!(task_id = %task.id, tag = %task.tag, "Task succeeded with an unresolved recorded error");
                        // The row is kept, so the flag must not outlive this task.
                        self.inner.store.set_rerun_flag(false).await?;
                        return Err(RunnerError::StrictModeViolation(task.id));
                    }
                    warn!(task_id = %task.id, tag = %task.tag, "Task succeeded with an unresolved recorded error");
                }

                let persisted = self.settle_success(&task).await;
                // A failed delete leaves the row in place.
                let retained = persisted.as_ref().map_or(true, |retained| *retained);
                self.inner.notifier.emit(RunnerEvent::TaskComplete {
                    task,
                    success: true,
                    rescheduled: retained,
                });

                let retained = persisted?;
                Ok(TaskRunOutcome::Succeeded { retained })
            }
            TaskResult::Failed => {
                debug!(task_id = %task.id, tag = %task.tag, "Task failed, keeping it for a later pass");
                // The retained row already carries any input that arrived mid-run.
                let persisted = self.inner.store.set_rerun_flag(false).await;
                self.inner.notifier.emit(RunnerEvent::TaskComplete {
                    task,
                    success: false,
                    rescheduled: true,
                });

                persisted?;
                Ok(TaskRunOutcome::Failed)
            }
        }
    }

    /// Delete a succeeded task, or keep it when new input arrived while it
    /// ran. Returns whether the row was kept.
    async fn settle_success(&self, task: &StoredTask) -> Result<bool, StoreError> {
        let store = &self.inner.store;
        if store.rerun_flag().await? {
            store.set_rerun_flag(false).await?;
            info!(task_id = %task.id, tag = %task.tag, "Task got new input while running, keeping it");
            return Ok(true);
        }

        store.delete(task.id).await?;
        debug!(task_id = %task.id, tag = %task.tag, "Task complete");
        Ok(false)
    }
}
