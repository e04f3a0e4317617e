//! Recovery loop.
//!
//! Periodically returns tasks to their queues when the worker holding them
//! stopped heartbeating or has been processing them for too long. Every
//! reclaim is guarded on the processing record observed during the sweep,
//! so two overlapping sweeps, or a sweep racing the worker's own completion,
//! apply at most one transition.

pub mod events;

pub use events::{EventKind, EventLog, MonitorEvent};

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scheduler::{TaskId, TaskLifecycle};
use crate::store::{TenantId, WorkerName};
use crate::worker::heartbeat::WorkerRegistry;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub dead_workers: Vec<WorkerName>,
    /// Tasks reclaimed from dead workers.
    pub reclaimed: Vec<TaskId>,
    pub timed_out: Vec<TaskId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.dead_workers.is_empty() && self.reclaimed.is_empty() && self.timed_out.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Monitor {
    lifecycle: TaskLifecycle,
    registry: WorkerRegistry,
    events: EventLog,
    interval: Duration,
    processing_timeout: Duration,
}

impl Monitor {
    pub fn new(
        lifecycle: TaskLifecycle,
        registry: WorkerRegistry,
        events: EventLog,
        interval: Duration,
        processing_timeout: Duration,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            events,
            interval,
            processing_timeout,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(report) if !report.is_empty() => {
                            tracing::info!(
                                dead_workers = report.dead_workers.len(),
                                reclaimed = report.reclaimed.len(),
                                timed_out = report.timed_out.len(),
                                "Monitor sweep recovered tasks"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Monitor sweep failed"),
                    }
                }
            }
        }
        tracing::info!("Monitor stopped");
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep treating `now` as the current wall-clock time for timeouts.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let tenants = self.lifecycle.queues().known_tenants().await?;

        for worker in self.registry.expired_workers().await? {
            let reclaimed = self.reclaim_worker(&worker, &tenants).await?;
            self.registry.evict(&worker).await?;
            tracing::warn!(worker = %worker, reclaimed = reclaimed.len(), "Worker heartbeat expired");

            self.record(MonitorEvent::worker_dead(worker.clone(), reclaimed.clone()))
                .await;
            report.dead_workers.push(worker);
            report.reclaimed.extend(reclaimed);
        }

        for tenant in &tenants {
            for (path, record, encoded) in self.lifecycle.in_flight(tenant).await? {
                if !record.is_older_than(self.processing_timeout, now) {
                    continue;
                }
                match self.lifecycle.reclaim(tenant, &path, &encoded).await {
                    Ok(true) => {
                        let task = TaskId {
                            tenant: tenant.clone(),
                            resource_path: path,
                        };
                        tracing::warn!(tenant = %tenant, resource_path = %task.resource_path, worker = %record.worker, "Task processing timed out");
                        self.record(MonitorEvent::task_timeout(record.worker, task.clone()))
                            .await;
                        report.timed_out.push(task);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(tenant = %tenant, resource_path = %path, error = %e, "Timeout reclaim failed");
                    }
                }
            }
        }

        Ok(report)
    }

    async fn reclaim_worker(&self, worker: &WorkerName, tenants: &[TenantId]) -> Result<Vec<TaskId>> {
        let mut reclaimed = Vec::new();
        for tenant in tenants {
            for (path, record, encoded) in self.lifecycle.in_flight(tenant).await? {
                if &record.worker != worker {
                    continue;
                }
                match self.lifecycle.reclaim(tenant, &path, &encoded).await {
                    Ok(true) => reclaimed.push(TaskId {
                        tenant: tenant.clone(),
                        resource_path: path,
                    }),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(tenant = %tenant, resource_path = %path, worker = %worker, error = %e, "Dead worker reclaim failed");
                    }
                }
            }
        }
        Ok(reclaimed)
    }

    async fn record(&self, event: MonitorEvent) {
        if let Err(e) = self.events.record(&event).await {
            tracing::warn!(kind = %event.kind, error = %e, "Failed to record monitor event");
        }
    }
}
