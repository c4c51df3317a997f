//! Durable, versioned snapshots of [`WorkflowState`] keyed by thread id.
//!
//! `save` uses optimistic concurrency: the state's own `version` is the
//! caller's base version and must equal the store's latest version for the
//! thread, otherwise the write is rejected with [`CheckpointError::Conflict`].

use crate::shared::ids::{StepId, ThreadId};
use crate::state::{WorkflowState, WorkflowStatus};
use serde::{Deserialize, Serialize};

pub mod codec;
pub mod memory;
pub mod sqlite;

pub use codec::{decode_state, encode_state, state_digest, CHECKPOINT_SCHEMA_VERSION};
pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("no checkpoint exists for thread `{thread_id}`")]
    NotFound { thread_id: ThreadId },
    #[error("checkpoint version {version} does not exist for thread `{thread_id}`")]
    VersionNotFound { thread_id: ThreadId, version: u64 },
    #[error(
        "checkpoint conflict for thread `{thread_id}`: base version {expected} but store is at {actual}"
    )]
    Conflict {
        thread_id: ThreadId,
        expected: u64,
        actual: u64,
    },
    #[error("state for thread `{state_thread}` cannot be saved under thread `{thread_id}`")]
    ThreadMismatch {
        thread_id: ThreadId,
        state_thread: ThreadId,
    },
    #[error("checkpoint {version} for thread `{thread_id}` failed its integrity check")]
    Corrupt { thread_id: ThreadId, version: u64 },
    #[error("checkpoint schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },
    #[error("checkpoint encode failed: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint decode failed: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create checkpoint database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid checkpoint column `{column}` value `{value}`")]
    InvalidColumn { column: &'static str, value: String },
}

/// Audit metadata for one persisted checkpoint record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMeta {
    pub thread_id: ThreadId,
    pub version: u64,
    pub written_at: i64,
    pub schema_version: u32,
    pub digest: String,
    pub step: StepId,
    pub status: WorkflowStatus,
}

pub trait CheckpointStore: Send + Sync {
    /// Persist `state` as the next version of `thread_id`, returning the new version.
    fn save(&self, thread_id: &ThreadId, state: &WorkflowState) -> Result<u64, CheckpointError>;

    /// Latest state and its version.
    fn load(&self, thread_id: &ThreadId) -> Result<(WorkflowState, u64), CheckpointError>;

    fn load_version(
        &self,
        thread_id: &ThreadId,
        version: u64,
    ) -> Result<WorkflowState, CheckpointError>;

    /// Most-recent-first checkpoint metadata, at most `limit` entries.
    fn history(
        &self,
        thread_id: &ThreadId,
        limit: usize,
    ) -> Result<Vec<CheckpointMeta>, CheckpointError>;

    fn threads(&self) -> Result<Vec<ThreadId>, CheckpointError>;
}

pub(crate) fn ensure_thread_matches(
    thread_id: &ThreadId,
    state: &WorkflowState,
) -> Result<(), CheckpointError> {
    if state.thread_id() == thread_id {
        return Ok(());
    }
    Err(CheckpointError::ThreadMismatch {
        thread_id: thread_id.clone(),
        state_thread: state.thread_id().clone(),
    })
}
