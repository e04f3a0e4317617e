use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FleetError, Result};
use crate::scheduler::picker::SchedulingPolicy;

/// Timing and capacity settings shared by workers and the monitor.
///
/// All durations are kept in milliseconds, like the rest of the fleet's
/// configuration, and exposed as [`Duration`] through accessor methods.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// How often a worker refreshes its heartbeat key.
    pub heartbeat_interval_ms: u64,
    /// Expiry of the heartbeat key. Must be strictly longer than the interval.
    pub heartbeat_ttl_ms: u64,
    /// Period of the monitor's recovery sweep.
    pub monitor_interval_ms: u64,
    /// A task processing for longer than this is reclaimed by the monitor.
    pub processing_timeout_ms: u64,
    /// Maximum time a worker waits for a tenant's artifact lock.
    pub lock_timeout_ms: u64,
    /// Lease on an acquired artifact lock, so a crashed holder cannot wedge a tenant.
    pub lock_lease_ms: u64,
    /// Pause between lock acquisition attempts.
    pub lock_retry_interval_ms: u64,
    /// Sleep of an idle worker when no tenant has queued work.
    pub idle_poll_interval_ms: u64,
    /// How often a worker publishes CPU and memory utilisation.
    pub metrics_interval_ms: u64,
    /// Number of monitor events retained.
    pub event_log_capacity: usize,
    /// How the scheduler weighs tenants against each other.
    pub scheduling_policy: SchedulingPolicy,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2_000,
            heartbeat_ttl_ms: 10_000,
            monitor_interval_ms: 5_000,
            processing_timeout_ms: 60_000,
            lock_timeout_ms: 10_000,
            lock_lease_ms: 30_000,
            lock_retry_interval_ms: 50,
            idle_poll_interval_ms: 1_000,
            metrics_interval_ms: 5_000,
            event_log_capacity: 200,
            scheduling_policy: SchedulingPolicy::DepthWeighted,
        }
    }
}

impl FleetConfig {
    /// Derive the heartbeat TTL as five heartbeat intervals.
    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.heartbeat_ttl_ms = interval_ms * 5;
        self
    }

    pub fn with_monitor_interval(mut self, interval_ms: u64) -> Self {
        self.monitor_interval_ms = interval_ms;
        self
    }

    pub fn with_processing_timeout(mut self, timeout_ms: u64) -> Self {
        self.processing_timeout_ms = timeout_ms;
        self
    }

    pub fn with_lock_timeout(mut self, timeout_ms: u64) -> Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }

    pub fn with_scheduling_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.scheduling_policy = policy;
        self
    }

    /// Reject settings under which liveness detection would misfire.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(FleetError::InvalidConfig(
                "heartbeat interval must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_ttl_ms <= self.heartbeat_interval_ms {
            return Err(FleetError::InvalidConfig(format!(
                "heartbeat TTL ({}ms) must exceed heartbeat interval ({}ms)",
                self.heartbeat_ttl_ms, self.heartbeat_interval_ms
            )));
        }
        if self.monitor_interval_ms == 0 || self.idle_poll_interval_ms == 0 {
            return Err(FleetError::InvalidConfig(
                "monitor and idle poll intervals must be non-zero".to_string(),
            ));
        }
        if self.lock_lease_ms == 0 || self.lock_retry_interval_ms == 0 {
            return Err(FleetError::InvalidConfig(
                "lock lease and retry interval must be non-zero".to_string(),
            ));
        }
        if self.event_log_capacity == 0 {
            return Err(FleetError::InvalidConfig(
                "event log capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ttl_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

/// Settings for one node process: the HTTP API, local storage and worker pool.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// Root under which resource paths are resolved by the source fetcher.
    pub data_dir: PathBuf,
    /// Root of the per-tenant artifact files.
    pub artifact_dir: PathBuf,
    /// Number of in-process workers to start.
    pub worker_count: usize,
    /// Prefix for worker names; workers are named `<prefix>-<n>`.
    pub worker_prefix: String,
    /// Dimension of the reference embedder.
    pub embedding_dim: usize,
    /// Coordination store; `None` keeps it inside this process.
    pub store_url: Option<String>,
    /// Serve the HTTP API from this process.
    pub run_api: bool,
    /// Run the monitor loop in this process.
    pub run_monitor: bool,
    pub fleet: FleetConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            data_dir: PathBuf::from("data"),
            artifact_dir: PathBuf::from("data/artifacts"),
            worker_count: 2,
            worker_prefix: "worker".to_string(),
            embedding_dim: 384,
            store_url: None,
            run_api: true,
            run_monitor: true,
            fleet: FleetConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            listen_addr,
            artifact_dir: data_dir.join("artifacts"),
            data_dir,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_fleet(mut self, fleet: FleetConfig) -> Self {
        self.fleet = fleet;
        self
    }

    pub fn with_store_url(mut self, url: impl Into<String>) -> Self {
        self.store_url = Some(url.into());
        self
    }

    /// Choose which parts of the fleet this process runs.
    pub fn with_roles(mut self, run_api: bool, run_monitor: bool) -> Self {
        self.run_api = run_api;
        self.run_monitor = run_monitor;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 && !self.run_api && !self.run_monitor {
            return Err(FleetError::InvalidConfig(
                "node runs nothing: no workers, API or monitor".to_string(),
            ));
        }

        if self.embedding_dim == 0 {
            return Err(FleetError::InvalidConfig(
                "embedding dimension must be non-zero".to_string(),
            ));
        }
        self.fleet.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_config_default() {
        let cfg = FleetConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 2_000);
        assert_eq!(cfg.heartbeat_ttl_ms, 10_000);
        assert_eq!(cfg.monitor_interval_ms, 5_000);
        assert_eq!(cfg.processing_timeout_ms, 60_000);
        assert_eq!(cfg.lock_timeout_ms, 10_000);
        assert_eq!(cfg.scheduling_policy, SchedulingPolicy::DepthWeighted);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn heartbeat_ttl_follows_interval() {
        let cfg = FleetConfig::default().with_heartbeat_interval(40);
        assert_eq!(cfg.heartbeat_interval_ms, 40);
        assert_eq!(cfg.heartbeat_ttl_ms, 200);
        assert_eq!(cfg.heartbeat_ttl(), Duration::from_millis(200));
    }

    #[test]
    fn ttl_not_exceeding_interval_is_rejected() {
        let cfg = FleetConfig {
            heartbeat_interval_ms: 100,
            heartbeat_ttl_ms: 100,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(FleetError::InvalidConfig(_))));
    }

    #[test]
    fn node_roles_are_validated() {
        assert!(NodeConfig::default().validate().is_ok());
        assert!(NodeConfig::default().with_workers(0).validate().is_ok());

        let idle = NodeConfig::default().with_workers(0).with_roles(false, false);
        assert!(idle.validate().is_err());

        let workers_only = NodeConfig::default().with_roles(false, false);
        assert!(workers_only.validate().is_ok());
    }

    #[test]
    fn zero_event_capacity_is_rejected() {
        let cfg = FleetConfig {
            event_log_capacity: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn node_config_new_places_artifacts_under_data_dir() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = NodeConfig::new(addr, PathBuf::from("/srv/data"));
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.artifact_dir, PathBuf::from("/srv/data/artifacts"));
        assert_eq!(cfg.worker_count, 2);
    }

    #[test]
    fn node_config_requires_a_worker() {
        let cfg = NodeConfig::default().with_workers(0);
        assert!(cfg.validate().is_err());
        assert!(NodeConfig::default().with_workers(3).validate().is_ok());
    }
}
