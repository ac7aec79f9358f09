//! Error types for the state store.

use crate::types::{AgentId, Checksum, ConflictId, SnapshotId, Version, WorkflowId};
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Write conflict on {workflow}: base {base} is behind head {head} (conflict {conflict})")]
    Conflict {
        workflow: WorkflowId,
        conflict: ConflictId,
        base: Version,
        head: Version,
    },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Version {1} not found for workflow {0}")]
    VersionNotFound(WorkflowId, Version),

    #[error("Version {1} of workflow {0} has been archived out of hot storage")]
    VersionArchived(WorkflowId, Version),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch for workflow {workflow} version {version}: stored {stored}, computed {computed}")]
    ChecksumMismatch {
        workflow: WorkflowId,
        version: Version,
        stored: Checksum,
        computed: Checksum,
    },

    #[error("Storage backend timed out: {0}")]
    StorageTimeout(String),

    #[error("Delivery to {agent} failed after {attempts} attempts")]
    DeliveryFailure { agent: AgentId, attempts: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
