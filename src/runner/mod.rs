//! Task runner module.

mod admission;
mod error_gate;
mod executor;
pub mod registry;
#[allow(clippy::module_inception)]
mod runner;
pub mod state;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use registry::TaskRegistry;
pub use runner::{
    AdmissionRejection, DrainOutcome, DrainSummary, Runner, RunnerBuilder, RunnerError,
    TaskRunOutcome,
};
pub use state::RunnerStatus;
pub use store::{NewTask, RecordedError, RunFilter, StoreError, StoredTask, TaskId, TaskStore};

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteTaskStore;
