pub mod lifecycle;
pub mod picker;
pub mod queue;
pub mod task;

pub use lifecycle::TaskLifecycle;
pub use picker::{SchedulingPolicy, TenantPicker};
pub use queue::TenantQueues;
pub use task::{ClaimedTask, ProcessingRecord, TaskId, TaskState, Transition};

use crate::error::Result;
use crate::store::WorkerName;

/// Chooses the next task for an idle worker.
#[derive(Debug, Clone)]
pub struct Scheduler {
    lifecycle: TaskLifecycle,
    picker: TenantPicker,
}

impl Scheduler {
    pub fn new(lifecycle: TaskLifecycle, policy: SchedulingPolicy) -> Self {
        Self {
            lifecycle,
            picker: TenantPicker::new(policy),
        }
    }

    /// Pick a tenant among those with queued work and claim its head task.
    ///
    /// Returns `None` when no tenant has work, or when the chosen queue was
    /// drained by another worker between the snapshot and the claim; the
    /// caller simply polls again.
    pub async fn next_task(&self, worker: &WorkerName) -> Result<Option<ClaimedTask>> {
        let candidates = self.lifecycle.queues().active_tenants().await?;
        let tenant = {
            let mut rng = rand::thread_rng();
            match self.picker.pick(&candidates, &mut rng) {
                Some(tenant) => tenant.clone(),
                None => return Ok(None),
            }
        };

        let claimed = self.lifecycle.claim(&tenant, worker).await?;
        if claimed.is_none() {
            tracing::debug!(tenant = %tenant, worker = %worker, "Chosen queue drained before claim");
        }
        Ok(claimed)
    }
}
