use std::sync::Arc;

use crate::collab::{Captioner, Embedder, SourceFetcher};
use crate::error::{FleetError, Result};
use crate::scheduler::TaskId;

/// Output of running one task through the collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedTask {
    pub caption: String,
    pub vector: Vec<f32>,
}

/// Runs the fetch, caption and embed steps for a claimed task.
#[derive(Debug, Clone)]
pub struct TaskProcessor {
    fetcher: Arc<dyn SourceFetcher>,
    captioner: Arc<dyn Captioner>,
    embedder: Arc<dyn Embedder>,
}

impl TaskProcessor {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        captioner: Arc<dyn Captioner>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            fetcher,
            captioner,
            embedder,
        }
    }

    pub fn fetcher(&self) -> &Arc<dyn SourceFetcher> {
        &self.fetcher
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Any step failing fails the whole task; nothing partial is returned.
    pub async fn process(&self, task: &TaskId) -> Result<ProcessedTask> {
        tracing::debug!(tenant = %task.tenant, resource_path = %task.resource_path, "Processing task");

        let bytes = self.fetcher.fetch(&task.resource_path).await?;
        let caption = self.captioner.caption(&bytes).await?;
        let vector = self.embedder.embed(&caption).await?;

        let expected = self.embedder.dimension();
        if vector.len() != expected {
            return Err(FleetError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }

        Ok(ProcessedTask { caption, vector })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{HashingEmbedder, HeaderCaptioner, LocalFiles};
    use crate::store::TenantId;

    fn processor(root: &std::path::Path) -> TaskProcessor {
        TaskProcessor::new(
            Arc::new(LocalFiles::new(root)),
            Arc::new(HeaderCaptioner),
            Arc::new(HashingEmbedder::new(16)),
        )
    }

    #[tokio::test]
    async fn gif_is_captioned_and_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[0x20, 0x00, 0x10, 0x00]);
        std::fs::write(dir.path().join("cat.gif"), &gif).unwrap();

        let task = TaskId::new(TenantId::new("t").unwrap(), "cat.gif").unwrap();
        let out = processor(dir.path()).process(&task).await.unwrap();
        assert!(out.caption.contains("GIF image of 32x16"), "{}", out.caption);
        assert_eq!(out.vector.len(), 16);
    }

    #[tokio::test]
    async fn missing_input_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let task = TaskId::new(TenantId::new("t").unwrap(), "nope.png").unwrap();
        assert!(processor(dir.path()).process(&task).await.is_err());
    }
}
