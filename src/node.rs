use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::artifact::FsArtifactStore;
use crate::collab::{HashingEmbedder, HeaderCaptioner, LocalFiles};
use crate::config::NodeConfig;
use crate::context::FleetContext;
use crate::error::{FleetError, Result};
use crate::lifecycle::Supervisor;
use crate::store::{self, CoordinationStore, WorkerName};
use crate::worker::{TaskProcessor, Worker, WorkerHandle};

/// One process running any of the API, the monitor and a pool of workers.
///
/// With a shared store several nodes form one fleet, for instance one node
/// serving the API and the monitor and others running only workers.
pub struct Node {
    pub config: NodeConfig,
    pub ctx: FleetContext,
}

impl Node {
    /// Node backed by the store named in `config.store_url`.
    pub async fn connect(config: NodeConfig) -> Result<Self> {
        let local = matches!(config.store_url.as_deref(), None | Some("memory://"));
        if local && !config.run_api {
            return Err(FleetError::InvalidConfig(
                "a node with an in-process store must serve the API to receive work".to_string(),
            ));
        }
        let store = store::connect(config.store_url.as_deref()).await?;
        Self::with_store(config, store)
    }

    /// Node on an already opened store, with the reference collaborators.
    pub fn with_store(config: NodeConfig, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        config.validate()?;

        let processor = TaskProcessor::new(
            Arc::new(LocalFiles::new(&config.data_dir)),
            Arc::new(HeaderCaptioner),
            Arc::new(HashingEmbedder::new(config.embedding_dim)),
        );
        let ctx = FleetContext::new(
            config.fleet.clone(),
            store,
            Arc::new(FsArtifactStore::new(&config.artifact_dir)),
            processor,
        )?;

        Ok(Self { config, ctx })
    }

    fn worker_name(&self, n: usize) -> Result<WorkerName> {
        WorkerName::new(format!("{}-{}", self.config.worker_prefix, n))
    }

    /// Run until `shutdown` fires, then let in-flight tasks finish and
    /// deregister every worker.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let background = Supervisor::new(shutdown.clone());
        if self.config.run_monitor {
            let monitor = self.ctx.monitor();
            background.spawn("monitor", move |cancel| async move { monitor.run(cancel).await });
        }

        let mut workers: Vec<WorkerHandle> = Vec::with_capacity(self.config.worker_count);
        for n in 1..=self.config.worker_count {
            let worker = Worker::new(self.worker_name(n)?, self.ctx.clone());
            workers.push(worker.start(&shutdown).await?);
        }

        tracing::info!(
            api = self.config.run_api,
            monitor = self.config.run_monitor,
            workers = workers.len(),
            artifact_dir = %self.config.artifact_dir.display(),
            "Node running"
        );

        let served = if self.config.run_api {
            let state = ApiState {
                ctx: self.ctx.clone(),
            };
            run_api(self.config.listen_addr, state, shutdown.clone()).await
        } else {
            shutdown.cancelled().await;
            Ok(())
        };
        if served.is_err() {
            shutdown.cancel();
        }

        for worker in workers {
            let name = worker.name().clone();
            if let Err(e) = worker.shutdown().await {
                tracing::warn!(worker = %name, error = %e, "Worker shutdown incomplete");
            }
        }
        background.shutdown().await;

        tracing::info!("Node stopped");
        served
    }
}
