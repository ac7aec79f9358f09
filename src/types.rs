//! Core types for the versioned workflow state store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a workflow tracked by the store.
///
/// Workflow ids are caller-assigned. They are restricted to
/// `[A-Za-z0-9._-]` so they can double as storage key segments.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        WorkflowId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is usable as a storage key segment.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
    }
}

impl fmt::Debug for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkflowId({})", self.0)
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        WorkflowId(s.to_string())
    }
}

/// Identity of an agent (writer or subscriber).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        AgentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self.0)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        AgentId(s.to_string())
    }
}

/// Monotonic version number within a workflow's chain (first version is 1).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Version(pub u64);

impl Version {
    /// Base version for a workflow's first write.
    pub const INITIAL: Version = Version(0);

    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 1 {
            Some(Version(self.0 - 1))
        } else {
            None
        }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! id_newtype {
    ($name:ident, $label:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(VersionId, "VersionId");
id_newtype!(SnapshotId, "SnapshotId");
id_newtype!(ConflictId, "ConflictId");
id_newtype!(ChangeId, "ChangeId");

/// SHA-256 digest of a canonically serialized state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    /// Compute checksum from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Checksum(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Checksum(arr))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }

    /// Whole days elapsed between `self` and `now` (0 if `now` is earlier).
    pub fn age_days(&self, now: Timestamp) -> u64 {
        const MICROS_PER_DAY: i64 = 24 * 60 * 60 * 1_000_000;
        ((now.0 - self.0).max(0) / MICROS_PER_DAY) as u64
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Reference to the schema a state claims to conform to.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct SchemaRef {
    pub id: String,
    pub version: u32,
}

impl SchemaRef {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        SchemaRef {
            id: id.into(),
            version,
        }
    }
}

/// Caller-defined workflow state: a named-field document validated against
/// a registered schema before acceptance.
///
/// Fields are kept in a `BTreeMap` so serialization order is canonical,
/// which makes the checksum stable across processes.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct WorkflowState {
    pub schema: SchemaRef,
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl WorkflowState {
    pub fn new(schema: SchemaRef) -> Self {
        WorkflowState {
            schema,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

/// An immutable committed version in a workflow's chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateVersion {
    /// Store-assigned unique id.
    pub id: VersionId,

    /// Workflow this version belongs to.
    pub workflow_id: WorkflowId,

    /// Position in the chain, starting at 1.
    pub version: Version,

    /// Full state snapshot at this version.
    pub state: WorkflowState,

    /// When the version was committed.
    pub timestamp: Timestamp,

    /// Agent that produced the write.
    pub author: AgentId,

    /// Id of the immediately preceding version (None for version 1).
    pub parent_version: Option<VersionId>,

    /// Human-readable description of the change.
    pub change_description: String,

    /// Digest of the canonically serialized state.
    pub checksum: Checksum,
}

/// Category of a state change, derived from the changed field path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    TaskUpdate,
    AgentStatus,
    WorkflowStatus,
    MetadataUpdate,
}

impl ChangeKind {
    /// Classify a dotted field path.
    pub fn from_path(path: &str) -> Self {
        let head = path.split('.').next().unwrap_or(path);
        match head {
            "tasks" | "task" => ChangeKind::TaskUpdate,
            "agents" | "agent" => ChangeKind::AgentStatus,
            "status" | "phase" => ChangeKind::WorkflowStatus,
            _ => ChangeKind::MetadataUpdate,
        }
    }
}

/// Ephemeral delta event produced alongside a committed version.
///
/// Consumed by the notifier; not persisted beyond delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateChange {
    pub id: ChangeId,
    pub workflow_id: WorkflowId,
    pub kind: ChangeKind,
    /// Dotted path of the changed field.
    pub path: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub timestamp: Timestamp,
    /// Agent that produced the write.
    pub agent_id: AgentId,
    /// Version the change was committed as.
    pub version: Version,
}

/// On-demand point-in-time copy of a workflow's state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: SnapshotId,
    pub workflow_id: WorkflowId,
    pub state: WorkflowState,
    /// Version the snapshot was taken at.
    pub version: Version,
    pub created_at: Timestamp,
    pub description: String,
    /// Canonical serialized size in bytes.
    pub size: u64,
    pub checksum: Checksum,
}

/// A write that lost the base-version race, retained inside a conflict.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompetingWrite {
    pub author: AgentId,
    pub state: WorkflowState,
    pub description: String,
    pub submitted_at: Timestamp,
}

/// Strategy used (or requested) to settle a conflict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "strategy")]
pub enum ResolutionStrategy {
    /// Deterministic merge of disjoint field paths.
    AutoMerge,
    /// Apply the competing write on top of the current head.
    AcceptIncoming,
    /// Discard the competing write, keep the head.
    KeepCurrent,
    /// Caller supplies the merged state explicitly.
    Manual { state: WorkflowState },
}

/// Lifecycle of a contested write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "state")]
pub enum ConflictStatus {
    /// Mismatch found; candidate and actual head recorded.
    Detected,
    /// The deterministic merge policy is being attempted.
    AutoResolving,
    /// Settled; a follow-up version exists or the write was discarded.
    Resolved {
        strategy: ResolutionStrategy,
        /// Version the resolution committed as, if any.
        resulting_version: Option<Version>,
    },
    /// Overlapping-field collision that needs an explicit resolution.
    Escalated { overlapping_paths: Vec<String> },
}

impl ConflictStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ConflictStatus::Resolved { .. })
    }
}

/// Queued record of a detected write collision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateConflict {
    pub id: ConflictId,
    pub workflow_id: WorkflowId,
    /// Version the writer attempted to create (base + 1).
    pub attempted_version: Version,
    /// What the head actually was when the collision was detected.
    pub base_version: Version,
    pub competing_writes: Vec<CompetingWrite>,
    pub detected_at: Timestamp,
    pub status: ConflictStatus,
}

/// Retention configuration for the archive sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchivePolicy {
    /// Hot versions retained per workflow before the sweep kicks in.
    pub max_versions_per_workflow: u64,
    /// Versions older than this are eligible regardless of count.
    pub archive_after_days: u64,
    /// Gzip archived batches.
    pub compression_enabled: bool,
    /// Whether sweeping is allowed to move versions out of hot storage.
    /// When disabled the sweep leaves the workflow untouched.
    pub cold_storage_enabled: bool,
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self {
            max_versions_per_workflow: 100,
            archive_after_days: 30,
            compression_enabled: true,
            cold_storage_enabled: true,
        }
    }
}

/// Counters reported by `get-metrics`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub writes_committed: u64,
    pub conflicts_detected: u64,
    pub conflicts_auto_resolved: u64,
    pub conflicts_escalated: u64,
    pub notifications_delivered: u64,
    pub notifications_dropped: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub versions_archived: u64,
    pub snapshots_created: u64,
    pub workflow_count: u64,
}
