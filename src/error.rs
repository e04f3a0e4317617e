use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Task {resource_path} not found for tenant {tenant}")]
    TaskNotFound {
        tenant: String,
        resource_path: String,
    },

    #[error("Timed out after {waited_ms}ms waiting for artifact lock of tenant {tenant}")]
    LockTimeout { tenant: String, waited_ms: u64 },

    #[error("Artifact of tenant {tenant} is corrupt: {reason}")]
    ArtifactCorrupt { tenant: String, reason: String },

    #[error("Vector dimension mismatch: index holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid resource path: {0}")]
    InvalidResourcePath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
