use super::job::{ConditionFn, PeriodicScheduler, RegisteredTrigger};
use crate::runner::{Runner, TaskStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Shortest trigger period. A zero period would make the timer panic.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

fn clamp_interval(interval: Duration) -> Duration {
    if interval < MIN_INTERVAL {
        warn!(?interval, min = ?MIN_INTERVAL, "Trigger interval too short, clamping");
        return MIN_INTERVAL;
    }
    interval
}

/// Builder for configuring a PeriodicScheduler.
pub struct SchedulerBuilder<S: TaskStore> {
    runner: Runner<S>,
    triggers: Vec<RegisteredTrigger>,
    condition: Option<ConditionFn>,
}

impl<S: TaskStore + 'static> SchedulerBuilder<S> {
    /// Create a new scheduler builder driving the given runner.
    pub fn new(runner: Runner<S>) -> Self {
        Self {
            runner,
            triggers: Vec::new(),
            condition: None,
        }
    }

    /// Drain the whole queue at every interval. Zero is raised to one millisecond.
    pub fn every(mut self, interval: Duration) -> Self {
        self.triggers.push(RegisteredTrigger {
            group_id: None,
            interval: clamp_interval(interval),
            run_on_start: false,
        });
        self
    }

    /// Drain only one group at every interval.
    pub fn every_for_group(mut self, group_id: impl Into<String>, interval: Duration) -> Self {
        self.triggers.push(RegisteredTrigger {
            group_id: Some(group_id.into()),
            interval: clamp_interval(interval),
            run_on_start: false,
        });
        self
    }

    /// Set whether the most recently added trigger should fire immediately on start.
    ///
    /// Must be called after `.every()` or `.every_for_group()`. Defaults to false.
    pub fn run_on_start(mut self, run: bool) -> Self {
        if let Some(trigger) = self.triggers.last_mut() {
            trigger.run_on_start = run;
        }
        self
    }

    /// Only fire when `condition` resolves to true, e.g. when the device is
    /// online. Applies to every trigger.
    pub fn when<F, Fut>(mut self, condition: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let condition: ConditionFn = Arc::new(move || {
            let fut = condition();
            Box::pin(fut)
        });
        self.condition = Some(condition);
        self
    }

    /// Build the scheduler.
    pub fn build(self) -> PeriodicScheduler<S> {
        PeriodicScheduler::new(self.runner, self.triggers, self.condition)
    }
}
