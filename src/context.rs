use std::sync::Arc;

use crate::artifact::{ArtifactStore, ArtifactUpdater};
use crate::config::FleetConfig;
use crate::error::Result;
use crate::monitor::{EventLog, Monitor};
use crate::scheduler::{Scheduler, TaskLifecycle};
use crate::status::StatusReader;
use crate::store::CoordinationStore;
use crate::worker::heartbeat::WorkerRegistry;
use crate::worker::TaskProcessor;

/// Everything a worker, the monitor or the API needs, built once per process
/// and cloned into each component.
#[derive(Debug, Clone)]
pub struct FleetContext {
    pub config: FleetConfig,
    pub store: Arc<dyn CoordinationStore>,
    pub lifecycle: TaskLifecycle,
    pub scheduler: Scheduler,
    pub registry: WorkerRegistry,
    pub events: EventLog,
    pub artifacts: ArtifactUpdater,
    pub processor: TaskProcessor,
}

impl FleetContext {
    pub fn new(
        config: FleetConfig,
        store: Arc<dyn CoordinationStore>,
        artifact_store: Arc<dyn ArtifactStore>,
        processor: TaskProcessor,
    ) -> Result<Self> {
        config.validate()?;

        let lifecycle = TaskLifecycle::new(store.clone());
        Ok(Self {
            scheduler: Scheduler::new(lifecycle.clone(), config.scheduling_policy),
            registry: WorkerRegistry::new(store.clone(), config.heartbeat_ttl()),
            events: EventLog::new(store.clone(), config.event_log_capacity),
            artifacts: ArtifactUpdater::new(store.clone(), artifact_store, &config),
            lifecycle,
            processor,
            store,
            config,
        })
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            self.lifecycle.clone(),
            self.registry.clone(),
            self.events.clone(),
            self.config.monitor_interval(),
            self.config.processing_timeout(),
        )
    }

    pub fn status(&self) -> StatusReader {
        StatusReader::new(self.store.clone(), self.lifecycle.clone(), self.registry.clone())
    }
}
