use crate::runner::{DrainOutcome, RunFilter, Runner, TaskStore};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info};

/// Type-erased async predicate checked before every trigger.
pub(crate) type ConditionFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// A registered trigger configuration.
#[derive(Debug, Clone)]
pub struct RegisteredTrigger {
    /// Restrict the drain to one group. `None` drains everything.
    pub group_id: Option<String>,
    pub interval: Duration,
    pub run_on_start: bool,
}

/// Host-side periodic trigger that calls [`Runner::run_all`] on a timer.
pub struct PeriodicScheduler<S: TaskStore> {
    runner: Runner<S>,
    triggers: Vec<RegisteredTrigger>,
    condition: Option<ConditionFn>,
}

impl<S: TaskStore + 'static> PeriodicScheduler<S> {
    pub(crate) fn new(
        runner: Runner<S>,
        triggers: Vec<RegisteredTrigger>,
        condition: Option<ConditionFn>,
    ) -> Self {
        Self {
            runner,
            triggers,
            condition,
        }
    }

    /// The registered triggers.
    pub fn triggers(&self) -> &[RegisteredTrigger] {
        &self.triggers
    }

    /// Run all triggers indefinitely.
    pub async fn run(&self) -> ! {
        let handles: Vec<_> = self
            .triggers
            .iter()
            .cloned()
            .map(|trigger| {
                let runner = self.runner.clone();
                let condition = self.condition.clone();
                tokio::spawn(async move { Self::run_trigger(runner, trigger, condition).await })
            })
            .collect();

        // Keep handles in scope to maintain task references
        let _ = handles;

        // Wait forever (triggers run indefinitely)
        futures::future::pending::<()>().await;
        unreachable!()
    }

    async fn run_trigger(
        runner: Runner<S>,
        trigger: RegisteredTrigger,
        condition: Option<ConditionFn>,
    ) {
        info!(
            group_id = trigger.group_id.as_deref(),
            interval_secs = trigger.interval.as_secs(),
            run_on_start = trigger.run_on_start,
            "Starting periodic trigger"
        );

        if trigger.run_on_start {
            Self::fire(&runner, &trigger, condition.as_ref()).await;
        }

        let mut ticker = interval(trigger.interval);
        ticker.tick().await; // Consume immediate first tick

        loop {
            ticker.tick().await;
            Self::fire(&runner, &trigger, condition.as_ref()).await;
        }
    }

    /// One trigger firing. Returns the drain outcome when a drain was
    /// attempted.
    pub(crate) async fn fire(
        runner: &Runner<S>,
        trigger: &RegisteredTrigger,
        condition: Option<&ConditionFn>,
    ) -> Option<DrainOutcome> {
        if !runner.config().automatically_run_tasks {
            debug!("Automatic running disabled, ignoring trigger");
            return None;
        }

        if let Some(condition) = condition {
            if !condition().await {
                debug!(group_id = trigger.group_id.as_deref(), "Trigger condition not met");
                return None;
            }
        }

        let filter = match &trigger.group_id {
            Some(group_id) => RunFilter::group(group_id.clone()),
            None => RunFilter::all(),
        };

        match runner.run_all(filter).await {
            Ok(outcome) => {
                debug!(group_id = trigger.group_id.as_deref(), ?outcome, "Trigger fired");
                Some(outcome)
            }
            Err(e) => {
                error!(
                    group_id = trigger.group_id.as_deref(),
                    error = %e,
                    "Periodic drain failed"
                );
                None
            }
        }
    }
}
