//! # Offqueue
//!
//! A durable on-device work queue.
//!
//! Tasks are persisted before they run, survive restarts, and are retried
//! until their handler reports success. Work that arrives while offline simply
//! waits for the next drain.
//!
//! ## Why Offqueue?
//!
//! - **Deduplicated** - One row per `(tag, data_id)`; new input for a running task reruns it
//! - **Ordered** - Oldest first, with strict FIFO inside a group
//! - **Error gated** - A task with a recorded error waits until the user resolves it
//! - **Embeddable** - A library, not a service. Runs in your process.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use offqueue::{NewTask, RunFilter, RunnerBuilder, SqliteTaskStore};
//!
//! let store = SqliteTaskStore::new(pool);
//! store.run_migrations().await?;
//!
//! let runner = RunnerBuilder::new(store)
//!     .handler(UploadPhoto)
//!     .automatically_run_tasks(true)
//!     .build()
//!     .await?;
//!
//! runner.submit(NewTask::new("UploadPhoto").with_data_id("photo-7")).await?;
//! runner.run_all(RunFilter::all()).await?;
//! ```
//!
//! ## Groups
//!
//! Tasks sharing a group id run strictly in the order they were added. If
//! the head fails, the rest of the group waits for the next drain:
//!
//! ```rust,ignore
//! runner.submit(NewTask::new("CreateAlbum").with_data_id("a1").with_group_id("album-a1")).await?;
//! runner.submit(NewTask::new("AddPhoto").with_data_id("p1").with_group_id("album-a1")).await?;
//! ```
//!
//! ## Periodic draining
//!
//! ```rust,ignore
//! use offqueue::SchedulerBuilder;
//!
//! let scheduler = SchedulerBuilder::new(runner.clone())
//!     .every(Duration::from_secs(15 * 60))
//!     .run_on_start(true)
//!     .when(|| async { network_available().await })
//!     .build();
//!
//! tokio::spawn(async move { scheduler.run().await });
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite-backed task store

pub mod config;
pub mod listener;
pub mod runner;
pub mod scheduler;
pub mod task;

pub use config::RunnerConfig;
pub use listener::{NoopListener, RunnerEvent, RunnerListener, SkipReason, Subscription};
pub use runner::{
    AdmissionRejection, DrainOutcome, DrainSummary, NewTask, RecordedError, RunFilter, Runner,
    RunnerBuilder, RunnerError, RunnerStatus, StoreError, StoredTask, TaskId, TaskRegistry,
    TaskRunOutcome, TaskStore,
};
pub use scheduler::{PeriodicScheduler, SchedulerBuilder};
pub use task::{TaskContext, TaskHandler, TaskResult};

#[cfg(feature = "sqlite")]
pub use runner::SqliteTaskStore;
