use crate::checkpoint::CheckpointError;
use crate::orchestration::graph::GraphError;
use crate::orchestration::phase::EnginePhase;
use crate::shared::ids::{ThreadId, WorkflowType};
use crate::state::{StateError, WorkflowStatus};
use crate::trust::TrustError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("workflow thread `{thread_id}` not found")]
    NotFound { thread_id: ThreadId },
    #[error("workflow thread `{thread_id}` already exists")]
    ThreadAlreadyStarted { thread_id: ThreadId },
    #[error("unknown workflow type `{workflow_type}`")]
    UnknownWorkflowType { workflow_type: WorkflowType },
    #[error(
        "workflow thread `{thread_id}` was updated concurrently (base version {expected}, store at {actual}); reload and retry"
    )]
    Conflict {
        thread_id: ThreadId,
        expected: u64,
        actual: u64,
    },
    #[error("workflow thread `{thread_id}` has no pending approval (status `{status}`)")]
    NoPendingApproval {
        thread_id: ThreadId,
        status: WorkflowStatus,
    },
    #[error("engine phase transition `{from}` -> `{to}` is invalid")]
    InvalidPhaseTransition { from: EnginePhase, to: EnginePhase },
    #[error("thread id generation failed: {0}")]
    ThreadIdGeneration(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Checkpoint(CheckpointError),
}

impl From<CheckpointError> for OrchestratorError {
    fn from(value: CheckpointError) -> Self {
        match value {
            CheckpointError::NotFound { thread_id } => Self::NotFound { thread_id },
            CheckpointError::Conflict {
                thread_id,
                expected,
                actual,
            } => Self::Conflict {
                thread_id,
                expected,
                actual,
            },
            other => Self::Checkpoint(other),
        }
    }
}

impl OrchestratorError {
    /// Conflicts are resolved by reloading the thread and trying again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OrchestratorError::Conflict { .. })
    }
}
