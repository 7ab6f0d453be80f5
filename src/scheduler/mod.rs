//! Periodic trigger that drains the queue at intervals.

mod builder;
mod job;

pub use builder::SchedulerBuilder;
pub use job::{PeriodicScheduler, RegisteredTrigger};
