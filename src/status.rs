//! Read-only snapshots for operators.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::scheduler::TaskLifecycle;
use crate::store::{CoordinationStore, Key, TenantId, WorkerName};
use crate::worker::heartbeat::WorkerRegistry;
use crate::worker::metrics::{read_metrics, WorkerMetrics};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantStatus {
    pub tenant: TenantId,
    /// Queue depth.
    pub queue: usize,
    pub queued_items: Vec<String>,
    pub processing: Vec<String>,
    pub processing_workers: BTreeMap<String, WorkerName>,
    pub done: Vec<String>,
    pub errors: BTreeMap<String, String>,
    pub retries: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantSummary {
    pub tenant: TenantId,
    pub queue: usize,
    pub processing: usize,
    pub done: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerHealth {
    pub worker: WorkerName,
    pub alive: bool,
    pub metrics: Option<WorkerMetrics>,
}

#[derive(Debug, Clone)]
pub struct StatusReader {
    store: Arc<dyn CoordinationStore>,
    lifecycle: TaskLifecycle,
    registry: WorkerRegistry,
}

impl StatusReader {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        lifecycle: TaskLifecycle,
        registry: WorkerRegistry,
    ) -> Self {
        Self {
            store,
            lifecycle,
            registry,
        }
    }

    /// Snapshot of one tenant. The parts are read one after another, so a
    /// task moving between states during the read may show up twice or not
    /// at all.
    pub async fn tenant(&self, tenant: &TenantId) -> Result<TenantStatus> {
        let queued_items = self.lifecycle.queues().list(tenant).await?;
        let mut processing = self.store.set_members(&Key::Processing(tenant.clone())).await?;
        processing.sort();
        let processing_workers = self
            .lifecycle
            .in_flight(tenant)
            .await?
            .into_iter()
            .map(|(path, record, _)| (path, record.worker))
            .collect();
        let mut done = self.store.set_members(&Key::Done(tenant.clone())).await?;
        done.sort();
        let errors = self.store.hash_get_all(&Key::Errors(tenant.clone())).await?;
        let retries = self
            .store
            .hash_get_all(&Key::Retries(tenant.clone()))
            .await?
            .into_iter()
            .filter_map(|(path, n)| n.parse().ok().map(|n| (path, n)))
            .collect();

        Ok(TenantStatus {
            tenant: tenant.clone(),
            queue: queued_items.len(),
            queued_items,
            processing,
            processing_workers,
            done,
            errors,
            retries,
        })
    }

    /// Counts for every tenant that ever submitted work.
    pub async fn tenants(&self) -> Result<Vec<TenantSummary>> {
        let mut summaries = Vec::new();
        for tenant in self.lifecycle.queues().known_tenants().await? {
            let status = self.tenant(&tenant).await?;
            summaries.push(TenantSummary {
                queue: status.queue,
                processing: status.processing.len(),
                done: status.done.len(),
                errors: status.errors.len(),
                tenant,
            });
        }
        summaries.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        Ok(summaries)
    }

    /// Health of registered workers plus any worker that still has metrics
    /// on record.
    pub async fn workers(&self) -> Result<Vec<WorkerHealth>> {
        let mut names: BTreeSet<WorkerName> =
            self.registry.active_workers().await?.into_iter().collect();
        for raw in self.store.hash_get_all(&Key::WorkerMetrics).await?.into_keys() {
            if let Ok(name) = WorkerName::new(raw) {
                names.insert(name);
            }
        }

        let mut health = Vec::with_capacity(names.len());
        for worker in names {
            health.push(WorkerHealth {
                alive: self.registry.is_alive(&worker).await?,
                metrics: read_metrics(self.store.as_ref(), &worker).await?,
                worker,
            });
        }
        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::scheduler::TaskId;
    use std::time::Duration;

    #[tokio::test]
    async fn tenant_snapshot_reflects_lifecycle() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let lifecycle = TaskLifecycle::new(store.clone());
        let registry = WorkerRegistry::new(store.clone(), Duration::from_secs(10));
        let reader = StatusReader::new(store.clone(), lifecycle.clone(), registry);

        let tenant = TenantId::new("acme").unwrap();
        let worker = WorkerName::new("w1").unwrap();
        for path in ["a.png", "b.png", "c.png"] {
            lifecycle
                .submit(&TaskId::new(tenant.clone(), path).unwrap())
                .await
                .unwrap();
        }
        let first = lifecycle.claim(&tenant, &worker).await.unwrap().unwrap();
        lifecycle.complete(&first).await.unwrap();
        let second = lifecycle.claim(&tenant, &worker).await.unwrap().unwrap();

        let status = reader.tenant(&tenant).await.unwrap();
        assert_eq!(status.queue, 1);
        assert_eq!(status.queued_items, vec!["c.png"]);
        assert_eq!(status.processing, vec!["b.png"]);
        assert_eq!(status.processing_workers["b.png"], worker);
        assert_eq!(status.done, vec!["a.png"]);

        lifecycle.fail(&second, "boom").await.unwrap();
        let status = reader.tenant(&tenant).await.unwrap();
        assert_eq!(status.errors["b.png"], "boom");
        assert_eq!(status.retries["b.png"], 1);

        let summaries = reader.tenants().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].queue, 2);
    }
}
