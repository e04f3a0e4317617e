//! Worker side of the fleet.
//!
//! - [`heartbeat`]: registration, liveness keys and the heartbeat loop
//! - [`executor`]: fetch, caption and embed one task
//! - [`metrics`]: host utilisation published for operators
//! - [`runner`]: the claim, process, commit loop and its handle
//!
//! # Task Flow
//!
//! 1. [`Scheduler::next_task`](crate::scheduler::Scheduler::next_task) picks a tenant and claims its head
//! 2. [`TaskProcessor::process`] runs the collaborators
//! 3. The result is appended to the tenant's artifact under its lock
//! 4. The task is completed, or failed and possibly retried

pub mod executor;
pub mod heartbeat;
pub mod metrics;
pub mod runner;

pub use executor::{ProcessedTask, TaskProcessor};
pub use heartbeat::{HeartbeatSender, WorkerRegistry};
pub use metrics::{MetricsPublisher, ResourceSampler, WorkerMetrics};
pub use runner::{Worker, WorkerHandle};
