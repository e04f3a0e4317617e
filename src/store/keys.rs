//! Typed key space of the coordination store.
//!
//! Every piece of shared state lives under one [`Key`]. Keys are only turned
//! into strings inside store backends, so two components can never disagree
//! on a prefix or accidentally collide across tenants.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

const MAX_ID_LEN: usize = 128;

fn validate_id(kind: &str, raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(FleetError::InvalidConfig(format!("{kind} must not be empty")));
    }
    if raw.len() > MAX_ID_LEN {
        return Err(FleetError::InvalidConfig(format!(
            "{kind} longer than {MAX_ID_LEN} bytes"
        )));
    }
    // Tenant ids name artifact directories, so they must stay a single plain
    // path component.
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(FleetError::InvalidConfig(format!(
            "{kind} {raw:?} may only contain ASCII letters, digits, '-', '_' and '.'"
        )));
    }
    if raw == "." || raw == ".." {
        return Err(FleetError::InvalidConfig(format!("{kind} {raw:?} is reserved")));
    }
    Ok(())
}

/// Namespace isolating one user's queues, processing state and artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        validate_id("tenant id", &raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = FleetError;

    fn try_from(raw: String) -> Result<Self> {
        Self::new(raw)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fleet-unique name of a worker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerName(String);

impl WorkerName {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        validate_id("worker name", &raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WorkerName {
    type Error = FleetError;

    fn try_from(raw: String) -> Result<Self> {
        Self::new(raw)
    }
}

impl From<WorkerName> for String {
    fn from(name: WorkerName) -> Self {
        name.0
    }
}

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// List of queued resource paths; head is the next to run.
    Queue(TenantId),
    /// Set of resource paths currently processing.
    Processing(TenantId),
    /// Hash: resource path -> serialized processing record.
    ProcessingRecords(TenantId),
    /// Set of completed resource paths.
    Done(TenantId),
    /// Hash: resource path -> last error text.
    Errors(TenantId),
    /// Hash: resource path -> automatic retries already issued.
    Retries(TenantId),
    /// Mutual exclusion lock guarding the tenant's artifact files.
    ArtifactLock(TenantId),
    /// Set of tenants with queued work.
    ActiveTenants,
    /// Set of every tenant that ever submitted work.
    KnownTenants,
    /// Set of registered workers.
    ActiveWorkers,
    /// Expiring liveness key of one worker.
    Heartbeat(WorkerName),
    /// Hash: worker name -> latest resource metrics JSON.
    WorkerMetrics,
    /// List of monitor events, newest first.
    MonitorEvents,
}

impl Key {
    /// Every key namespaced under `tenant`, used by administrative reset.
    pub fn tenant_keys(tenant: &TenantId) -> Vec<Key> {
        vec![
            Key::Queue(tenant.clone()),
            Key::Processing(tenant.clone()),
            Key::ProcessingRecords(tenant.clone()),
            Key::Done(tenant.clone()),
            Key::Errors(tenant.clone()),
            Key::Retries(tenant.clone()),
            Key::ArtifactLock(tenant.clone()),
        ]
    }

    pub fn render(&self) -> String {
        match self {
            Key::Queue(t) => format!("tenant:{t}:queue"),
            Key::Processing(t) => format!("tenant:{t}:processing"),
            Key::ProcessingRecords(t) => format!("tenant:{t}:processing_records"),
            Key::Done(t) => format!("tenant:{t}:done"),
            Key::Errors(t) => format!("tenant:{t}:errors"),
            Key::Retries(t) => format!("tenant:{t}:retries"),
            Key::ArtifactLock(t) => format!("tenant:{t}:artifact_lock"),
            Key::ActiveTenants => "fleet:active_tenants".to_string(),
            Key::KnownTenants => "fleet:known_tenants".to_string(),
            Key::ActiveWorkers => "fleet:active_workers".to_string(),
            Key::Heartbeat(w) => format!("worker:{w}:heartbeat"),
            Key::WorkerMetrics => "fleet:worker_metrics".to_string(),
            Key::MonitorEvents => "fleet:monitor_events".to_string(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_reject_separator_and_whitespace() {
        assert!(TenantId::new("acme").is_ok());
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("a:b").is_err());
        assert!(TenantId::new("a b").is_err());
        assert!(WorkerName::new("worker-1").is_ok());
        assert!(WorkerName::new("w\n").is_err());
        assert!(TenantId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn tenant_ids_stay_one_path_component() {
        assert!(TenantId::new("team.v2_a-b").is_ok());
        for bad in [".", "..", "../x", "a/b", "a\\b", "/abs", "caf\u{e9}"] {
            assert!(TenantId::new(bad).is_err(), "{bad:?} accepted");
        }
        assert!(serde_json::from_str::<TenantId>("\"..\"").is_err());
    }

    #[test]
    fn tenant_keys_are_disjoint_across_tenants() {
        let a = TenantId::new("a").unwrap();
        let b = TenantId::new("b").unwrap();
        let rendered: HashSet<String> = Key::tenant_keys(&a)
            .into_iter()
            .chain(Key::tenant_keys(&b))
            .map(|k| k.render())
            .collect();
        assert_eq!(rendered.len(), 14);
    }

    #[test]
    fn tenant_id_deserialization_validates() {
        let ok: TenantId = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(ok.as_str(), "acme");
        assert!(serde_json::from_str::<TenantId>("\"bad:id\"").is_err());
    }
}
