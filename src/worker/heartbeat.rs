use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::{CoordinationStore, Key, WorkerName};

/// Worker membership and liveness.
///
/// A worker is alive while its heartbeat key exists. Membership in the active
/// set alone only means the worker registered and has not said goodbye.
#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn register(&self, worker: &WorkerName) -> Result<()> {
        self.refresh(worker).await?;
        tracing::info!(worker = %worker, "Worker registered");
        Ok(())
    }

    /// Refresh the heartbeat key and make sure the worker is a member of the
    /// active set again. A worker evicted during a lapse rejoins here, so the
    /// monitor keeps watching it.
    pub async fn beat(&self, worker: &WorkerName) -> Result<()> {
        if self.refresh(worker).await? {
            tracing::warn!(worker = %worker, "Worker rejoined after its heartbeat lapsed");
        }
        Ok(())
    }

    /// Key first, then membership: the monitor never sees a member without a
    /// key on account of this call. Returns whether membership was added.
    async fn refresh(&self, worker: &WorkerName) -> Result<bool> {
        self.store
            .put_ex(
                &Key::Heartbeat(worker.clone()),
                &Utc::now().to_rfc3339(),
                self.ttl,
            )
            .await?;
        self.store.set_add(&Key::ActiveWorkers, worker.as_str()).await
    }

    /// Graceful exit.
    pub async fn deregister(&self, worker: &WorkerName) -> Result<()> {
        self.store
            .set_remove(&Key::ActiveWorkers, worker.as_str())
            .await?;
        self.store.delete(&Key::Heartbeat(worker.clone())).await?;
        tracing::info!(worker = %worker, "Worker deregistered");
        Ok(())
    }

    pub async fn is_alive(&self, worker: &WorkerName) -> Result<bool> {
        self.store.exists(&Key::Heartbeat(worker.clone())).await
    }

    pub async fn active_workers(&self) -> Result<Vec<WorkerName>> {
        let members = self.store.set_members(&Key::ActiveWorkers).await?;
        Ok(members
            .into_iter()
            .filter_map(|raw| match WorkerName::new(raw.clone()) {
                Ok(name) => Some(name),
                Err(e) => {
                    tracing::warn!(member = %raw, error = %e, "Ignoring malformed worker name");
                    None
                }
            })
            .collect())
    }

    /// Registered workers whose heartbeat has lapsed.
    pub async fn expired_workers(&self) -> Result<Vec<WorkerName>> {
        let mut expired = Vec::new();
        for worker in self.active_workers().await? {
            if !self.is_alive(&worker).await? {
                expired.push(worker);
            }
        }
        Ok(expired)
    }

    /// Forget a worker found dead; its heartbeat key is already gone.
    pub async fn evict(&self, worker: &WorkerName) -> Result<()> {
        self.store
            .set_remove(&Key::ActiveWorkers, worker.as_str())
            .await?;
        Ok(())
    }
}

/// Periodically refreshes one worker's heartbeat.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Beat until `cancel` fires. A failed beat is logged and retried on the
    /// next tick; the TTL gives several ticks of slack.
    pub async fn run(&self, registry: WorkerRegistry, worker: WorkerName, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = registry.beat(&worker).await {
                        tracing::warn!(worker = %worker, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
        tracing::debug!(worker = %worker, "Heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry(ttl_ms: u64) -> WorkerRegistry {
        WorkerRegistry::new(Arc::new(MemoryStore::new()), Duration::from_millis(ttl_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_lapses_without_beats() {
        let registry = registry(100);
        let w = WorkerName::new("w1").unwrap();
        registry.register(&w).await.unwrap();
        assert!(registry.is_alive(&w).await.unwrap());
        assert!(registry.expired_workers().await.unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!registry.is_alive(&w).await.unwrap());
        assert_eq!(registry.expired_workers().await.unwrap(), vec![w.clone()]);
        // Still a member until evicted.
        assert_eq!(registry.active_workers().await.unwrap(), vec![w.clone()]);

        registry.evict(&w).await.unwrap();
        assert!(registry.active_workers().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn beat_after_eviction_rejoins_active_set() {
        let registry = registry(100);
        let w = WorkerName::new("w1").unwrap();
        registry.register(&w).await.unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(registry.expired_workers().await.unwrap(), vec![w.clone()]);
        registry.evict(&w).await.unwrap();
        assert!(registry.active_workers().await.unwrap().is_empty());

        registry.beat(&w).await.unwrap();
        assert_eq!(registry.active_workers().await.unwrap(), vec![w.clone()]);

        // A second lapse is detected again.
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(registry.expired_workers().await.unwrap(), vec![w]);
    }

    #[tokio::test]
    async fn deregister_removes_membership_and_heartbeat() {
        let registry = registry(10_000);
        let w = WorkerName::new("w1").unwrap();
        registry.register(&w).await.unwrap();
        registry.deregister(&w).await.unwrap();
        assert!(!registry.is_alive(&w).await.unwrap());
        assert!(registry.active_workers().await.unwrap().is_empty());
        assert!(registry.expired_workers().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sender_keeps_worker_alive_until_cancelled() {
        let registry = registry(100);
        let w = WorkerName::new("w1").unwrap();
        registry.register(&w).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let registry = registry.clone();
            let w = w.clone();
            let cancel = cancel.clone();
            async move {
                HeartbeatSender::new(Duration::from_millis(20))
                    .run(registry, w, cancel)
                    .await
            }
        });

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(registry.is_alive(&w).await.unwrap());
        }

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!registry.is_alive(&w).await.unwrap());
    }
}
