//! Operational request/response surface.
//!
//! A thin serde-tagged envelope over `StateStore` for embedding the store
//! behind a transport (IPC, HTTP, a job queue). Errors come back as typed
//! payloads instead of transport faults.

use crate::chain::ArchiveStub;
use crate::error::StoreError;
use crate::store::StateStore;
use crate::subscriptions::DeliveryHandle;
use crate::types::{
    AgentId, ConflictId, ResolutionStrategy, SnapshotId, StateConflict, StateSnapshot,
    StateVersion, StoreStats, Version, WorkflowId, WorkflowState,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Store operation, tagged by `op`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Request {
    PersistState {
        workflow_id: WorkflowId,
        base_version: Version,
        state: WorkflowState,
        author: AgentId,
        description: String,
    },
    GetState {
        workflow_id: WorkflowId,
        /// Specific version; `None` reads the head.
        version: Option<Version>,
    },
    GetHistory {
        workflow_id: WorkflowId,
        /// Resume below this version (exclusive).
        before: Option<Version>,
        limit: Option<usize>,
    },
    SubscribeChanges {
        workflow_id: WorkflowId,
        agent_id: AgentId,
    },
    CreateSnapshot {
        workflow_id: WorkflowId,
        description: String,
    },
    RestoreSnapshot {
        workflow_id: WorkflowId,
        snapshot_id: SnapshotId,
        author: AgentId,
    },
    ResolveConflict {
        conflict_id: ConflictId,
        #[serde(flatten)]
        strategy: ResolutionStrategy,
        resolver: AgentId,
    },
    ValidateState {
        state: WorkflowState,
    },
    ArchiveOldVersions,
    GetMetrics,
}

/// Serializable view of one history page.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryPage {
    pub workflow_id: WorkflowId,
    pub head: Version,
    pub total_versions: u64,
    /// Hot versions in this page, newest first.
    pub versions: Vec<StateVersion>,
    pub archived: Option<ArchiveStub>,
}

/// Operation result, tagged by `result`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum Response {
    Committed {
        version: StateVersion,
    },
    State {
        workflow_id: WorkflowId,
        version: Version,
        state: WorkflowState,
    },
    Version {
        version: StateVersion,
    },
    History {
        page: HistoryPage,
    },
    Subscribed {
        workflow_id: WorkflowId,
        agent_id: AgentId,
    },
    Snapshot {
        snapshot: StateSnapshot,
    },
    Resolved {
        conflict: StateConflict,
    },
    Valid,
    Archived {
        workflows_examined: usize,
        workflows_swept: usize,
        versions_archived: u64,
    },
    Metrics {
        stats: StoreStats,
    },
    Error(ApiError),
}

/// Stable error codes for transport clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Validation,
    Conflict,
    WorkflowNotFound,
    VersionNotFound,
    VersionArchived,
    SnapshotNotFound,
    ConflictNotFound,
    Corruption,
    StorageTimeout,
    DeliveryFailure,
    Locked,
    Internal,
}

/// Typed error payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// Set when the failure left a queued conflict behind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<ConflictId>,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        let (code, conflict_id) = match err {
            StoreError::Validation(_) => (ErrorCode::Validation, None),
            StoreError::Conflict { conflict, .. } => (ErrorCode::Conflict, Some(conflict)),
            StoreError::WorkflowNotFound(_) => (ErrorCode::WorkflowNotFound, None),
            StoreError::VersionNotFound(_, _) => (ErrorCode::VersionNotFound, None),
            StoreError::VersionArchived(_, _) => (ErrorCode::VersionArchived, None),
            StoreError::SnapshotNotFound(_) => (ErrorCode::SnapshotNotFound, None),
            StoreError::ConflictNotFound(_) => (ErrorCode::ConflictNotFound, None),
            StoreError::Corruption(_) | StoreError::ChecksumMismatch { .. } => {
                (ErrorCode::Corruption, None)
            }
            StoreError::StorageTimeout(_) => (ErrorCode::StorageTimeout, None),
            StoreError::DeliveryFailure { .. } => (ErrorCode::DeliveryFailure, None),
            StoreError::Locked => (ErrorCode::Locked, None),
            _ => (ErrorCode::Internal, None),
        };
        ApiError {
            code,
            message,
            conflict_id,
        }
    }
}

/// Dispatches requests against a store.
///
/// Delivery handles created through `subscribe-changes` are parked here;
/// the embedding transport claims them with `take_delivery_handle` and
/// pumps notifications out however it sees fit.
pub struct ApiHandler {
    store: Arc<StateStore>,
    handles: Mutex<HashMap<(WorkflowId, AgentId), DeliveryHandle>>,
}

impl ApiHandler {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Claim the delivery handle created by a `subscribe-changes` request.
    pub fn take_delivery_handle(
        &self,
        workflow: &WorkflowId,
        agent: &AgentId,
    ) -> Option<DeliveryHandle> {
        self.handles
            .lock()
            .remove(&(workflow.clone(), agent.clone()))
    }

    /// Execute one request. Never panics; failures come back as
    /// `Response::Error`.
    pub fn handle(&self, request: Request) -> Response {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(err) => Response::Error(err.into()),
        }
    }

    fn dispatch(&self, request: Request) -> Result<Response, StoreError> {
        match request {
            Request::PersistState {
                workflow_id,
                base_version,
                state,
                author,
                description,
            } => {
                let version = self.store.persist_state(
                    &workflow_id,
                    base_version,
                    state,
                    author,
                    description,
                )?;
                Ok(Response::Committed { version })
            }
            Request::GetState {
                workflow_id,
                version: Some(version),
            } => {
                let record = self.store.get_version(&workflow_id, version)?;
                Ok(Response::Version { version: record })
            }
            Request::GetState {
                workflow_id,
                version: None,
            } => {
                let (state, version) = self.store.get_state(&workflow_id)?;
                Ok(Response::State {
                    workflow_id,
                    version,
                    state,
                })
            }
            Request::GetHistory {
                workflow_id,
                before,
                limit,
            } => {
                let history = self.store.history(
                    &workflow_id,
                    before,
                    limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
                )?;
                let total_versions = history.total_versions();
                Ok(Response::History {
                    page: HistoryPage {
                        workflow_id: history.workflow_id,
                        head: history.head,
                        total_versions,
                        versions: history.versions,
                        archived: history.archived,
                    },
                })
            }
            Request::SubscribeChanges {
                workflow_id,
                agent_id,
            } => {
                let handle = self.store.subscribe(&workflow_id, &agent_id)?;
                self.handles
                    .lock()
                    .insert((workflow_id.clone(), agent_id.clone()), handle);
                Ok(Response::Subscribed {
                    workflow_id,
                    agent_id,
                })
            }
            Request::CreateSnapshot {
                workflow_id,
                description,
            } => {
                let snapshot = self.store.create_snapshot(&workflow_id, description)?;
                Ok(Response::Snapshot { snapshot })
            }
            Request::RestoreSnapshot {
                workflow_id,
                snapshot_id,
                author,
            } => {
                let version = self
                    .store
                    .restore_snapshot(&workflow_id, snapshot_id, author)?;
                Ok(Response::Committed { version })
            }
            Request::ResolveConflict {
                conflict_id,
                strategy,
                resolver,
            } => {
                let conflict = self.store.resolve_conflict(conflict_id, strategy, resolver)?;
                Ok(Response::Resolved { conflict })
            }
            Request::ValidateState { state } => {
                self.store.validate_state(&state)?;
                Ok(Response::Valid)
            }
            Request::ArchiveOldVersions => {
                let report = self.store.archive_old_versions()?;
                Ok(Response::Archived {
                    workflows_examined: report.workflows_examined,
                    workflows_swept: report.workflows_swept,
                    versions_archived: report.versions_archived,
                })
            }
            Request::GetMetrics => Ok(Response::Metrics {
                stats: self.store.metrics(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::default_schema_ref;
    use crate::store::StoreConfig;
    use serde_json::json;

    fn handler() -> ApiHandler {
        let store = Arc::new(StateStore::open(StoreConfig::in_memory()).unwrap());
        ApiHandler::new(store)
    }

    fn sample_state() -> WorkflowState {
        WorkflowState::new(default_schema_ref()).with_field("status", json!("running"))
    }

    #[test]
    fn test_persist_then_get_state() {
        let handler = handler();
        let wf = WorkflowId::new("wf-1");

        let response = handler.handle(Request::PersistState {
            workflow_id: wf.clone(),
            base_version: Version(0),
            state: sample_state(),
            author: AgentId::new("planner"),
            description: "initial".into(),
        });
        match response {
            Response::Committed { version } => assert_eq!(version.version, Version(1)),
            other => panic!("unexpected response {other:?}"),
        }

        match handler.handle(Request::GetState {
            workflow_id: wf,
            version: None,
        }) {
            Response::State { version, state, .. } => {
                assert_eq!(version, Version(1));
                assert_eq!(state.get("status"), Some(&json!("running")));
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_missing_workflow_maps_to_error_code() {
        let handler = handler();
        match handler.handle(Request::GetState {
            workflow_id: WorkflowId::new("ghost"),
            version: None,
        }) {
            Response::Error(err) => assert_eq!(err.code, ErrorCode::WorkflowNotFound),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_conflict_error_carries_conflict_id() {
        let handler = handler();
        let wf = WorkflowId::new("wf-1");
        for (base, value) in [(0, "a"), (1, "b")] {
            handler.handle(Request::PersistState {
                workflow_id: wf.clone(),
                base_version: Version(base),
                state: WorkflowState::new(default_schema_ref())
                    .with_field("status", json!(value)),
                author: AgentId::new("a"),
                description: "write".into(),
            });
        }

        let response = handler.handle(Request::PersistState {
            workflow_id: wf,
            base_version: Version(1),
            state: WorkflowState::new(default_schema_ref()).with_field("status", json!("c")),
            author: AgentId::new("b"),
            description: "stale overlapping write".into(),
        });
        match response {
            Response::Error(err) => {
                assert_eq!(err.code, ErrorCode::Conflict);
                assert!(err.conflict_id.is_some());
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_get_history_reports_totals() {
        let handler = handler();
        let wf = WorkflowId::new("wf-1");
        for i in 0..3u64 {
            handler.handle(Request::PersistState {
                workflow_id: wf.clone(),
                base_version: Version(i),
                state: WorkflowState::new(default_schema_ref())
                    .with_field("status", json!(format!("step-{}", i + 1))),
                author: AgentId::new("writer"),
                description: "write".into(),
            });
        }

        match handler.handle(Request::GetHistory {
            workflow_id: wf.clone(),
            before: None,
            limit: Some(2),
        }) {
            Response::History { page } => {
                assert_eq!(page.workflow_id, wf);
                assert_eq!(page.total_versions, 3);
                let versions: Vec<u64> = page.versions.iter().map(|v| v.version.0).collect();
                assert_eq!(versions, vec![3, 2]);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_subscribe_parks_delivery_handle() {
        let handler = handler();
        let wf = WorkflowId::new("wf-1");
        let agent = AgentId::new("watcher");

        match handler.handle(Request::SubscribeChanges {
            workflow_id: wf.clone(),
            agent_id: agent.clone(),
        }) {
            Response::Subscribed { .. } => {}
            other => panic!("unexpected response {other:?}"),
        }
        assert!(handler.take_delivery_handle(&wf, &agent).is_some());
        assert!(handler.take_delivery_handle(&wf, &agent).is_none());
    }

    #[test]
    fn test_request_wire_shape() {
        let request: Request = serde_json::from_value(json!({
            "op": "get-history",
            "workflow_id": "wf-1",
            "before": null,
            "limit": 10
        }))
        .unwrap();
        match request {
            Request::GetHistory { workflow_id, limit, .. } => {
                assert_eq!(workflow_id, WorkflowId::new("wf-1"));
                assert_eq!(limit, Some(10));
            }
            other => panic!("unexpected request {other:?}"),
        }

        let resolve: Request = serde_json::from_value(json!({
            "op": "resolve-conflict",
            "conflict_id": 7,
            "strategy": "keep-current",
            "resolver": "lead"
        }))
        .unwrap();
        match resolve {
            Request::ResolveConflict { conflict_id, strategy, .. } => {
                assert_eq!(conflict_id, ConflictId(7));
                assert_eq!(strategy, ResolutionStrategy::KeepCurrent);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_metrics_response() {
        let handler = handler();
        match handler.handle(Request::GetMetrics) {
            Response::Metrics { stats } => assert_eq!(stats.writes_committed, 0),
            other => panic!("unexpected response {other:?}"),
        }
    }
}
