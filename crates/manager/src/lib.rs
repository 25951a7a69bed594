#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Manager side of the taskmill distributed task-execution system.
//!
//! A [`Manager`] accepts connections from remote workers, stages task
//! inputs (from itself, origin URLs, or peer workers), dispatches tasks
//! under per-worker resource constraints, retrieves outputs, and returns
//! finished tasks to the caller through [`Manager::wait`]. It tolerates
//! worker loss, slow workers, and factory-driven elastic scaling.
//!
//! ```no_run
//! use taskmill_manager::{File, Manager, ManagerConfig, Task};
//!
//! # async fn demo() -> Result<(), taskmill_manager::ManagerError> {
//! let mut m = Manager::listen(ManagerConfig::default()).await?;
//! let mut t = Task::new("grep needle haystack > hits");
//! t.add_input(File::local("haystack", "haystack").cached());
//! t.add_output(File::local("hits", "hits"));
//! t.set_cores(1);
//! m.submit(t)?;
//! while !m.empty() {
//!     if let Some(done) = m.wait(None).await {
//!         println!("task {} exited {}", done.id(), done.exit_code());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod blocklist;
mod capacity;
mod catalog;
mod category;
mod clock;
mod commit;
mod config;
mod error;
mod factory;
mod file;
mod link;
mod liveness;
mod manager;
mod messages;
mod perf_log;
mod resources;
mod results;
mod sched;
mod stats;
mod task;
#[cfg(test)]
mod testutil;
mod transfers;
mod txn_log;
mod worker;

pub use category::{AllocationMode, CategoryStats};
pub use config::ManagerConfig;
pub use error::ManagerError;
pub use file::{File, FileKind, MiniTaskSpec};
pub use manager::Manager;
pub use resources::{Resource, ResourceSummary, ResourcesMeasured, WorkerResources};
pub use sched::Scheduler;
pub use stats::Stats;
pub use task::{AllocationTier, Task, TaskResult, TaskState};
