//! Durable per-tenant artifact files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::index::{FlatIndex, VectorIndex};
use crate::error::{FleetError, Result};
use crate::store::{TenantId, WorkerName};

const METADATA_FILE: &str = "metadata.json";
const INDEX_FILE: &str = "index.json";

/// Metadata describing vector `i` of the tenant's index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub resource_path: String,
    pub caption: String,
    pub worker: WorkerName,
    pub indexed_at: DateTime<Utc>,
}

/// A tenant's paired metadata list and vector index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artifact {
    pub entries: Vec<ArtifactEntry>,
    pub index: FlatIndex,
}

impl Artifact {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append one entry and its vector; on error nothing changes.
    pub fn append(&mut self, entry: ArtifactEntry, vector: Vec<f32>) -> Result<usize> {
        let position = self.index.add(vector)?;
        self.entries.push(entry);
        Ok(position)
    }

    /// Restore the equal-length invariant after a torn write by keeping the
    /// common prefix. Returns how many trailing items were dropped.
    fn repair(&mut self) -> usize {
        let common = self.entries.len().min(self.index.len());
        let dropped = (self.entries.len() - common) + (self.index.len() - common);
        self.entries.truncate(common);
        self.index.truncate(common);
        dropped
    }
}

/// Load/save pair for tenant artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    async fn load(&self, tenant: &TenantId) -> Result<Artifact>;
    async fn save(&self, tenant: &TenantId, artifact: &Artifact) -> Result<()>;
    async fn clear(&self, tenant: &TenantId) -> Result<()>;
}

/// Artifacts as JSON files under `<root>/<tenant>/`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn tenant_dir(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(tenant.as_str())
    }

    async fn read_json<T: serde::de::DeserializeOwned + Default>(
        tenant: &TenantId,
        path: &Path,
    ) -> Result<T> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| FleetError::ArtifactCorrupt {
                tenant: tenant.to_string(),
                reason: format!("{}: {}", path.display(), e),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a sibling temp file and rename over the target.
    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn load(&self, tenant: &TenantId) -> Result<Artifact> {
        let dir = self.tenant_dir(tenant);
        let entries: Vec<ArtifactEntry> = Self::read_json(tenant, &dir.join(METADATA_FILE)).await?;
        let index: FlatIndex = Self::read_json(tenant, &dir.join(INDEX_FILE)).await?;

        let mut artifact = Artifact { entries, index };
        let dropped = artifact.repair();
        if dropped > 0 {
            tracing::warn!(tenant = %tenant, dropped, "Artifact lengths disagreed, kept common prefix");
        }
        Ok(artifact)
    }

    async fn save(&self, tenant: &TenantId, artifact: &Artifact) -> Result<()> {
        let dir = self.tenant_dir(tenant);
        tokio::fs::create_dir_all(&dir).await?;
        // Index first: a crash in between leaves the index one longer, which
        // the next load trims back.
        Self::write_json(&dir.join(INDEX_FILE), &artifact.index).await?;
        Self::write_json(&dir.join(METADATA_FILE), &artifact.entries).await?;
        Ok(())
    }

    async fn clear(&self, tenant: &TenantId) -> Result<()> {
        match tokio::fs::remove_dir_all(self.tenant_dir(tenant)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> ArtifactEntry {
        ArtifactEntry {
            resource_path: path.to_string(),
            caption: format!("caption of {path}"),
            worker: WorkerName::new("w1").unwrap(),
            indexed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_artifact_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let artifact = store.load(&TenantId::new("a").unwrap()).await.unwrap();
        assert!(artifact.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_preserves_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let tenant = TenantId::new("a").unwrap();

        let mut artifact = Artifact::default();
        artifact.append(entry("1.png"), vec![1.0, 0.0]).unwrap();
        artifact.append(entry("2.png"), vec![0.0, 1.0]).unwrap();
        store.save(&tenant, &artifact).await.unwrap();

        let loaded = store.load(&tenant).await.unwrap();
        assert_eq!(loaded, artifact);
    }

    #[tokio::test]
    async fn torn_write_is_trimmed_to_common_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let tenant = TenantId::new("a").unwrap();

        let mut artifact = Artifact::default();
        artifact.append(entry("1.png"), vec![1.0]).unwrap();
        store.save(&tenant, &artifact).await.unwrap();

        // Simulate a crash after the index write of a second append.
        artifact.index.add(vec![2.0]).unwrap();
        FsArtifactStore::write_json(&dir.path().join("a").join(INDEX_FILE), &artifact.index)
            .await
            .unwrap();

        let loaded = store.load(&tenant).await.unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.index.len(), 1);
    }

    #[tokio::test]
    async fn garbage_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let tenant = TenantId::new("a").unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a").join(METADATA_FILE), b"{not json").unwrap();

        assert!(matches!(
            store.load(&tenant).await,
            Err(FleetError::ArtifactCorrupt { .. })
        ));
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let tenant = TenantId::new("a").unwrap();
        let mut artifact = Artifact::default();
        artifact.append(entry("1.png"), vec![1.0]).unwrap();
        store.save(&tenant, &artifact).await.unwrap();

        store.clear(&tenant).await.unwrap();
        store.clear(&tenant).await.unwrap();
        assert!(store.load(&tenant).await.unwrap().is_empty());
    }
}
