//! # Statevault
//!
//! A versioned state store for multi-agent workflows: every accepted write
//! becomes an immutable, checksummed version in a per-workflow chain.
//!
//! ## Core Concepts
//!
//! - **Versions**: Append-only chain of full state snapshots per workflow
//! - **Optimistic concurrency**: Writes declare the version they build on;
//!   stale writes are auto-merged when disjoint, queued as conflicts when not
//! - **Subscriptions**: Per-field change events fanned out off the write path
//! - **Snapshots**: Named restore points; restoring appends, never rewrites
//! - **Archival**: Old versions move to compressed cold storage, history
//!   totals stay intact
//!
//! ## Example
//!
//! ```ignore
//! use statevault::{StateStore, StoreConfig, WorkflowState, WorkflowId, AgentId, Version};
//!
//! let store = StateStore::open(StoreConfig::at_path("./vault"))?;
//!
//! let state = WorkflowState::new(statevault::default_schema_ref())
//!     .with_field("status", serde_json::json!("running"));
//! let v1 = store.persist_state(
//!     &WorkflowId::new("deploy-42"),
//!     Version::INITIAL,
//!     state,
//!     AgentId::new("planner"),
//!     "kick off deployment",
//! )?;
//!
//! let (head, version) = store.get_state(&WorkflowId::new("deploy-42"))?;
//! ```

pub mod api;
pub mod archive;
pub mod backend;
pub mod cache;
pub mod chain;
pub mod codec;
pub mod conflict;
pub mod error;
pub mod ids;
pub mod schema;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use api::{ApiError, ApiHandler, ErrorCode, HistoryPage, Request, Response};
pub use archive::{ArchiveManager, ArchiveRunner, ColdStore, SweepReport};
pub use backend::{FileBackend, KvBackend, MemoryBackend};
pub use cache::ActiveStateCache;
pub use chain::{AppendOutcome, ArchiveStub, ChainStore, History};
pub use conflict::{merge_states, ConflictQueue, MergeOutcome};
pub use error::{Result, StoreError};
pub use schema::{default_schema_ref, FieldKind, FieldSpec, SchemaRegistry, StateSchema};
pub use store::{StateStore, StoreConfig};
pub use subscriptions::{
    DeliveryHandle, DropReason, Notification, Notifier, NotifierConfig, SubscriptionRegistry,
};
pub use types::{
    AgentId, ArchivePolicy, ChangeId, ChangeKind, Checksum, CompetingWrite, ConflictId,
    ConflictStatus, ResolutionStrategy, SchemaRef, SnapshotId, StateChange, StateConflict,
    StateSnapshot, StateVersion, StoreStats, Timestamp, Version, VersionId, WorkflowId,
    WorkflowState,
};
