use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use super::index::VectorIndex;
use super::store::{Artifact, ArtifactEntry, ArtifactStore};
use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::store::{CoordinationStore, Key, TenantId};

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub entry: ArtifactEntry,
    pub distance: f32,
}

impl SearchHit {
    /// Distance mapped onto a rough `[0, 1]` score.
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance / 100.0
    }
}

/// Serialises read-modify-write cycles on a tenant's artifact.
///
/// Every append runs under the tenant's store lock and reloads the artifact
/// from durable storage first, so concurrent writers never overwrite each
/// other's entries.
#[derive(Debug, Clone)]
pub struct ArtifactUpdater {
    store: Arc<dyn CoordinationStore>,
    artifacts: Arc<dyn ArtifactStore>,
    lock_timeout: Duration,
    lock_lease: Duration,
    retry_interval: Duration,
}

impl ArtifactUpdater {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        artifacts: Arc<dyn ArtifactStore>,
        config: &FleetConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            lock_timeout: config.lock_timeout(),
            lock_lease: config.lock_lease(),
            retry_interval: config.lock_retry_interval(),
        }
    }

    /// Append `entry` and its `vector` to the tenant's artifact, returning
    /// the new entry's position.
    pub async fn append(
        &self,
        tenant: &TenantId,
        entry: ArtifactEntry,
        vector: Vec<f32>,
    ) -> Result<usize> {
        let token = self.lock(tenant).await?;
        let result = self.append_locked(tenant, entry, vector).await;
        self.unlock(tenant, &token).await;
        result
    }

    async fn append_locked(
        &self,
        tenant: &TenantId,
        entry: ArtifactEntry,
        vector: Vec<f32>,
    ) -> Result<usize> {
        let mut artifact = self.artifacts.load(tenant).await?;
        let resource_path = entry.resource_path.clone();
        let position = artifact.append(entry, vector)?;
        self.artifacts.save(tenant, &artifact).await?;
        tracing::info!(tenant = %tenant, resource_path = %resource_path, position, "Artifact entry appended");
        Ok(position)
    }

    /// Nearest `k` entries to `query`.
    ///
    /// Reads without the lock: files are replaced by rename, and a torn pair
    /// is trimmed on load.
    pub async fn search(&self, tenant: &TenantId, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let artifact = self.artifacts.load(tenant).await?;
        let hits = artifact.index.search(query, k)?;
        Ok(hits
            .into_iter()
            .filter_map(|(position, distance)| {
                artifact.entries.get(position).map(|entry| SearchHit {
                    entry: entry.clone(),
                    distance,
                })
            })
            .collect())
    }

    /// Current artifact of `tenant`.
    pub async fn snapshot(&self, tenant: &TenantId) -> Result<Artifact> {
        self.artifacts.load(tenant).await
    }

    /// Administrative reset of the tenant's artifact.
    pub async fn clear(&self, tenant: &TenantId) -> Result<()> {
        let token = self.lock(tenant).await?;
        let result = self.artifacts.clear(tenant).await;
        self.unlock(tenant, &token).await;
        if result.is_ok() {
            tracing::warn!(tenant = %tenant, "Artifact cleared");
        }
        result
    }

    async fn lock(&self, tenant: &TenantId) -> Result<String> {
        let key = Key::ArtifactLock(tenant.clone());
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();

        loop {
            if self.store.try_lock(&key, &token, self.lock_lease).await? {
                tracing::debug!(tenant = %tenant, waited_ms = started.elapsed().as_millis() as u64, "Artifact lock acquired");
                return Ok(token);
            }
            let waited = started.elapsed();
            if waited >= self.lock_timeout {
                tracing::warn!(tenant = %tenant, waited_ms = waited.as_millis() as u64, "Artifact lock wait timed out");
                return Err(FleetError::LockTimeout {
                    tenant: tenant.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.retry_interval.min(self.lock_timeout - waited)).await;
        }
    }

    async fn unlock(&self, tenant: &TenantId, token: &str) {
        match self.store.unlock(&Key::ArtifactLock(tenant.clone()), token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(tenant = %tenant, "Artifact lock lease expired before release");
            }
            Err(e) => {
                tracing::error!(tenant = %tenant, error = %e, "Failed to release artifact lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FsArtifactStore;
    use crate::store::{MemoryStore, WorkerName};
    use chrono::Utc;

    fn updater(dir: &std::path::Path, config: &FleetConfig) -> (Arc<MemoryStore>, ArtifactUpdater) {
        let store = Arc::new(MemoryStore::new());
        let updater = ArtifactUpdater::new(
            store.clone(),
            Arc::new(FsArtifactStore::new(dir)),
            config,
        );
        (store, updater)
    }

    fn entry(path: &str) -> ArtifactEntry {
        ArtifactEntry {
            resource_path: path.to_string(),
            caption: path.to_string(),
            worker: WorkerName::new("w").unwrap(),
            indexed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_then_search() {
        let dir = tempfile::tempdir().unwrap();
        let (_, updater) = updater(dir.path(), &FleetConfig::default());
        let tenant = TenantId::new("t").unwrap();

        assert_eq!(updater.append(&tenant, entry("a"), vec![0.0, 1.0]).await.unwrap(), 0);
        assert_eq!(updater.append(&tenant, entry("b"), vec![1.0, 0.0]).await.unwrap(), 1);

        let hits = updater.search(&tenant, &[0.9, 0.1], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.resource_path, "b");
        assert!(hits[0].similarity() > 0.99);
    }

    #[tokio::test]
    async fn lock_is_released_after_failed_append() {
        let dir = tempfile::tempdir().unwrap();
        let (store, updater) = updater(dir.path(), &FleetConfig::default());
        let tenant = TenantId::new("t").unwrap();

        updater.append(&tenant, entry("a"), vec![1.0, 2.0]).await.unwrap();
        let err = updater.append(&tenant, entry("b"), vec![1.0]).await.unwrap_err();
        assert!(matches!(err, FleetError::DimensionMismatch { .. }));
        assert!(!store.exists(&Key::ArtifactLock(tenant.clone())).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = FleetConfig::default().with_lock_timeout(200);
        let (store, updater) = updater(dir.path(), &config);
        let tenant = TenantId::new("t").unwrap();

        store
            .try_lock(&Key::ArtifactLock(tenant.clone()), "other", Duration::from_secs(60))
            .await
            .unwrap();

        let err = updater.append(&tenant, entry("a"), vec![1.0]).await.unwrap_err();
        assert!(matches!(err, FleetError::LockTimeout { waited_ms, .. } if waited_ms >= 200));
        assert!(updater.snapshot(&tenant).await.unwrap().is_empty());
    }
}
