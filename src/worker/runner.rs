use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactEntry;
use crate::context::FleetContext;
use crate::error::Result;
use crate::lifecycle::Supervisor;
use crate::scheduler::{ClaimedTask, Transition};
use crate::store::WorkerName;
use crate::worker::executor::ProcessedTask;
use crate::worker::heartbeat::HeartbeatSender;
use crate::worker::metrics::MetricsPublisher;

const TASK_LOOP: &str = "tasks";
const HEARTBEAT: &str = "heartbeat";
const METRICS: &str = "metrics";

/// One processing worker: pulls tasks one at a time until stopped.
#[derive(Debug, Clone)]
pub struct Worker {
    name: WorkerName,
    ctx: FleetContext,
}

impl Worker {
    pub fn new(name: WorkerName, ctx: FleetContext) -> Self {
        Self { name, ctx }
    }

    pub fn name(&self) -> &WorkerName {
        &self.name
    }

    /// Register, then start the task loop with its heartbeat and metrics
    /// publishers.
    pub async fn start(self, parent: &CancellationToken) -> Result<WorkerHandle> {
        self.ctx.registry.register(&self.name).await?;

        let supervisor = Supervisor::new(parent.clone());

        let registry = self.ctx.registry.clone();
        let name = self.name.clone();
        let heartbeat = HeartbeatSender::new(self.ctx.config.heartbeat_interval());
        supervisor.spawn(HEARTBEAT, move |cancel| async move {
            heartbeat.run(registry, name, cancel).await
        });

        let publisher =
            MetricsPublisher::new(self.ctx.store.clone(), self.ctx.config.metrics_interval());
        let name = self.name.clone();
        supervisor.spawn(METRICS, move |cancel| async move {
            publisher.run(name, cancel).await
        });

        let handle = WorkerHandle {
            name: self.name.clone(),
            ctx: self.ctx.clone(),
            supervisor,
        };
        handle
            .supervisor
            .spawn(TASK_LOOP, move |cancel| async move { self.run(cancel).await });

        tracing::info!(worker = %handle.name, "Worker started");
        Ok(handle)
    }

    /// Task loop. Cancellation is only observed between tasks, so an
    /// in-flight task always runs to a transition.
    pub async fn run(&self, cancel: CancellationToken) {
        let idle = self.ctx.config.idle_poll_interval();

        while !cancel.is_cancelled() {
            let worked = match self.run_once().await {
                Ok(worked) => worked,
                Err(e) => {
                    tracing::error!(worker = %self.name, error = %e, "Worker iteration failed");
                    false
                }
            };
            if !worked {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }
        tracing::debug!(worker = %self.name, "Task loop stopped");
    }

    /// Claim and handle at most one task. Returns whether a task was found.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(claimed) = self.ctx.scheduler.next_task(&self.name).await? else {
            return Ok(false);
        };
        self.handle(&claimed).await?;
        Ok(true)
    }

    async fn handle(&self, claimed: &ClaimedTask) -> Result<Transition> {
        let outcome = match self.ctx.processor.process(&claimed.task).await {
            Ok(processed) => self.commit(claimed, processed).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(true) => self.ctx.lifecycle.complete(claimed).await,
            Ok(false) => Ok(Transition::Stale),
            Err(e) => {
                tracing::warn!(worker = %self.name, task = %claimed.task, error = %e, "Task processing failed");
                self.ctx.lifecycle.fail(claimed, &e.to_string()).await
            }
        }
    }

    /// Append the result to the tenant's artifact unless the task was taken
    /// away from this worker while it was processing.
    async fn commit(&self, claimed: &ClaimedTask, processed: ProcessedTask) -> Result<bool> {
        if !self.ctx.lifecycle.still_owns(claimed).await? {
            tracing::warn!(worker = %self.name, task = %claimed.task, "Task reclaimed during processing, result dropped");
            return Ok(false);
        }

        let entry = ArtifactEntry {
            resource_path: claimed.task.resource_path.clone(),
            caption: processed.caption,
            worker: self.name.clone(),
            indexed_at: Utc::now(),
        };
        self.ctx
            .artifacts
            .append(&claimed.task.tenant, entry, processed.vector)
            .await?;
        Ok(true)
    }
}

/// Control over a started worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: WorkerName,
    ctx: FleetContext,
    supervisor: Supervisor,
}

impl WorkerHandle {
    pub fn name(&self) -> &WorkerName {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running(TASK_LOOP)
    }

    /// Let the in-flight task finish, stop the background loops and
    /// deregister.
    pub async fn shutdown(self) -> Result<()> {
        self.supervisor.stop(TASK_LOOP).await;
        self.supervisor.shutdown().await;
        self.ctx.registry.deregister(&self.name).await?;
        tracing::info!(worker = %self.name, "Worker stopped");
        Ok(())
    }

    /// Simulate a crash: abort everything without deregistering. The
    /// heartbeat key lapses on its own and the monitor reclaims the
    /// worker's tasks.
    pub fn kill(self) {
        self.supervisor.abort_all();
        tracing::warn!(worker = %self.name, "Worker killed");
    }
}
