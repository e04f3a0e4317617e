use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::TaskId;
use crate::store::{CoordinationStore, Key, WorkerName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkerDead,
    TaskTimeout,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            EventKind::WorkerDead => "worker_dead",
            EventKind::TaskTimeout => "task_timeout",
        })
    }
}

/// A recovery action taken by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub worker: Option<WorkerName>,
    /// Tasks returned to their queue by this action.
    pub tasks: Vec<TaskId>,
}

impl MonitorEvent {
    pub fn worker_dead(worker: WorkerName, tasks: Vec<TaskId>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: EventKind::WorkerDead,
            worker: Some(worker),
            tasks,
        }
    }

    pub fn task_timeout(worker: WorkerName, task: TaskId) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: EventKind::TaskTimeout,
            worker: Some(worker),
            tasks: vec![task],
        }
    }
}

/// Bounded, newest-first event feed kept in the coordination store.
#[derive(Debug, Clone)]
pub struct EventLog {
    store: Arc<dyn CoordinationStore>,
    capacity: usize,
}

impl EventLog {
    pub fn new(store: Arc<dyn CoordinationStore>, capacity: usize) -> Self {
        Self { store, capacity }
    }

    pub async fn record(&self, event: &MonitorEvent) -> Result<()> {
        let encoded = serde_json::to_string(event)?;
        self.store
            .list_push_front(&Key::MonitorEvents, &encoded)
            .await?;
        self.store
            .list_trim(&Key::MonitorEvents, self.capacity)
            .await
    }

    /// Up to `limit` events, newest first. Unreadable entries are skipped.
    pub async fn recent(&self, limit: usize) -> Result<Vec<MonitorEvent>> {
        let raw = self
            .store
            .list_range(&Key::MonitorEvents, Some(limit))
            .await?;
        Ok(raw
            .iter()
            .filter_map(|e| serde_json::from_str(e).ok())
            .collect())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.delete(&Key::MonitorEvents).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, TenantId};

    fn event(n: usize) -> MonitorEvent {
        MonitorEvent::task_timeout(
            WorkerName::new("w").unwrap(),
            TaskId::new(TenantId::new("t").unwrap(), format!("{n}.png")).unwrap(),
        )
    }

    #[tokio::test]
    async fn log_is_newest_first_and_bounded() {
        let log = EventLog::new(Arc::new(MemoryStore::new()), 3);
        for n in 0..5 {
            log.record(&event(n)).await.unwrap();
        }

        let recent = log.recent(10).await.unwrap();
        let paths: Vec<&str> = recent
            .iter()
            .map(|e| e.tasks[0].resource_path.as_str())
            .collect();
        assert_eq!(paths, vec!["4.png", "3.png", "2.png"]);
        assert_eq!(log.recent(1).await.unwrap().len(), 1);

        log.clear().await.unwrap();
        assert!(log.recent(10).await.unwrap().is_empty());
    }

    #[test]
    fn event_serializes_type_field() {
        let json = serde_json::to_value(event(1)).unwrap();
        assert_eq!(json["type"], "task_timeout");
        assert_eq!(json["tasks"][0]["tenant"], "t");
    }
}
