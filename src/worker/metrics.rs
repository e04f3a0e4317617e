//! Host CPU and memory utilisation published by each worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::{CoordinationStore, Key, WorkerName};

/// Last reported utilisation of a worker's host, in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub cpu: f32,
    pub mem: f32,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

/// Memory in use as a percentage, from `/proc/meminfo`.
fn parse_memory_percent(meminfo: &str) -> Option<f32> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f32 * 100.0 / total as f32)
}

/// Samples utilisation from procfs. CPU usage is the busy share since the
/// previous sample; on hosts without procfs every reading is zero.
#[derive(Debug, Default)]
pub struct ResourceSampler {
    previous: Option<CpuTimes>,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self::default()
    }

    fn cpu_percent(&mut self, current: CpuTimes) -> f32 {
        let percent = match self.previous {
            Some(prev) if current.total > prev.total => {
                let total = (current.total - prev.total) as f32;
                let idle = current.idle.saturating_sub(prev.idle) as f32;
                ((total - idle) * 100.0 / total).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
        self.previous = Some(current);
        percent
    }

    pub async fn sample(&mut self) -> WorkerMetrics {
        let cpu = match tokio::fs::read_to_string("/proc/stat").await {
            Ok(stat) => parse_cpu_times(&stat)
                .map(|t| self.cpu_percent(t))
                .unwrap_or(0.0),
            Err(_) => 0.0,
        };
        let mem = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|m| parse_memory_percent(&m))
            .unwrap_or(0.0);

        WorkerMetrics {
            cpu,
            mem,
            ts: Utc::now(),
        }
    }
}

/// Writes a worker's utilisation into the shared metrics hash.
pub struct MetricsPublisher {
    store: Arc<dyn CoordinationStore>,
    interval: Duration,
}

impl MetricsPublisher {
    pub fn new(store: Arc<dyn CoordinationStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn publish(&self, worker: &WorkerName, metrics: &WorkerMetrics) -> Result<()> {
        let encoded = serde_json::to_string(metrics)?;
        self.store
            .hash_set(&Key::WorkerMetrics, worker.as_str(), &encoded)
            .await
    }

    pub async fn run(&self, worker: WorkerName, cancel: CancellationToken) {
        let mut sampler = ResourceSampler::new();
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let metrics = sampler.sample().await;
                    if let Err(e) = self.publish(&worker, &metrics).await {
                        tracing::debug!(worker = %worker, error = %e, "Metrics publish failed");
                    }
                }
            }
        }
    }
}

/// Read the last published metrics of `worker`, if any.
pub async fn read_metrics(
    store: &dyn CoordinationStore,
    worker: &WorkerName,
) -> Result<Option<WorkerMetrics>> {
    match store.hash_get(&Key::WorkerMetrics, worker.as_str()).await? {
        Some(raw) => Ok(serde_json::from_str(&raw).ok()),
        None => Ok(None),
    }
}
