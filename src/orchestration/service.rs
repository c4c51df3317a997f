//! Caller-facing workflow API. Wraps the orchestrator with thread id
//! generation, conflict retries and serializable response shapes.

use crate::checkpoint::CheckpointMeta;
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::workflow_engine::{ApprovalDecision, Orchestrator};
use crate::shared::clock::format_timestamp_ms;
use crate::shared::ids::{generate_thread_id, StepId, ThreadId, UserId, WorkflowType};
use crate::state::{HistoryOutcome, PendingApproval, WorkflowState, WorkflowStatus};
use crate::trust::TrustLevel;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
    pub workflow_type: WorkflowType,
    pub user_id: UserId,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResponse {
    pub thread_id: ThreadId,
    pub status: WorkflowStatus,
    pub trust_level: TrustLevel,
    pub current_step: StepId,
    pub version: u64,
    /// Accumulated context so far.
    pub partial_result: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl From<&WorkflowState> for WorkflowResponse {
    fn from(state: &WorkflowState) -> Self {
        Self {
            thread_id: state.thread_id().clone(),
            status: state.status(),
            trust_level: state.trust_level(),
            current_step: state.current_step().clone(),
            version: state.version(),
            partial_result: state
                .accumulated_context()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            pending_approval: state.pending_approval().cloned(),
            failure_reason: state.failure_reason(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummary {
    pub steps_executed: u64,
    pub errors: usize,
    pub last_step: Option<StepId>,
    pub last_outcome: Option<HistoryOutcome>,
    pub last_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub thread_id: ThreadId,
    pub workflow_type: WorkflowType,
    pub user_id: UserId,
    pub current_step: StepId,
    pub status: WorkflowStatus,
    pub trust_level: TrustLevel,
    pub version: u64,
    pub history: HistorySummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub updated_at: i64,
    /// `updated_at` as RFC 3339.
    pub updated: String,
}

impl From<&WorkflowState> for StatusResponse {
    fn from(state: &WorkflowState) -> Self {
        let last = state.history().last();
        Self {
            thread_id: state.thread_id().clone(),
            workflow_type: state.workflow_type().clone(),
            user_id: state.user_id().clone(),
            current_step: state.current_step().clone(),
            status: state.status(),
            trust_level: state.trust_level(),
            version: state.version(),
            history: HistorySummary {
                steps_executed: state.total_iterations(),
                errors: state.error_log().len(),
                last_step: last.map(|record| record.step.clone()),
                last_outcome: last.map(|record| record.outcome),
                last_timestamp: last.map(|record| record.timestamp),
            },
            pending_approval: state.pending_approval().cloned(),
            failure_reason: state.failure_reason(),
            updated_at: state.updated_at(),
            updated: format_timestamp_ms(state.updated_at()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "decision")]
pub enum ApprovalRequest {
    Approve {
        #[serde(default)]
        input: Option<Value>,
    },
    Reject {
        reason: String,
    },
}

impl From<ApprovalRequest> for ApprovalDecision {
    fn from(value: ApprovalRequest) -> Self {
        match value {
            ApprovalRequest::Approve { input } => ApprovalDecision::Approve { input },
            ApprovalRequest::Reject { reason } => ApprovalDecision::Reject { reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    pub success: bool,
    #[serde(default)]
    pub feedback_score: Option<f64>,
    /// Defaults to the workflow type.
    #[serde(default)]
    pub interaction_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackResponse {
    pub thread_id: ThreadId,
    pub status: WorkflowStatus,
    pub user_id: UserId,
    pub trust_level: TrustLevel,
    pub level_changed: bool,
    pub total_interactions: u64,
}

pub struct WorkflowService {
    orchestrator: Arc<Orchestrator>,
    conflict_retries: u32,
}

impl WorkflowService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<WorkflowResponse, OrchestratorError> {
        let thread_id = match request.thread_id {
            Some(thread_id) => thread_id,
            None => generate_thread_id(self.orchestrator.now_ms())
                .map_err(OrchestratorError::ThreadIdGeneration)?,
        };
        let state = self.orchestrator.start(
            &thread_id,
            &request.user_id,
            &request.workflow_type,
            request.input,
        )?;
        Ok(WorkflowResponse::from(&state))
    }

    pub fn resume_workflow(
        &self,
        thread_id: &ThreadId,
        input: Option<Value>,
    ) -> Result<WorkflowResponse, OrchestratorError> {
        let state = self.retry_on_conflict(thread_id, || {
            self.orchestrator.resume(thread_id, input.clone())
        })?;
        Ok(WorkflowResponse::from(&state))
    }

    pub fn get_status(&self, thread_id: &ThreadId) -> Result<StatusResponse, OrchestratorError> {
        let state = self.orchestrator.status(thread_id)?;
        Ok(StatusResponse::from(&state))
    }

    pub fn submit_approval(
        &self,
        thread_id: &ThreadId,
        request: ApprovalRequest,
    ) -> Result<WorkflowResponse, OrchestratorError> {
        let decision = ApprovalDecision::from(request);
        let state = self.retry_on_conflict(thread_id, || {
            self.orchestrator.submit_approval(thread_id, decision.clone())
        })?;
        Ok(WorkflowResponse::from(&state))
    }

    /// Feed a caller-observed outcome of this workflow into trust calibration
    /// for the workflow's user.
    pub fn submit_feedback(
        &self,
        thread_id: &ThreadId,
        request: FeedbackRequest,
    ) -> Result<FeedbackResponse, OrchestratorError> {
        let state = self.orchestrator.status(thread_id)?;
        let interaction_type = request
            .interaction_type
            .unwrap_or_else(|| state.workflow_type().to_string());
        let record = self.orchestrator.trust().record_outcome(
            state.user_id(),
            request.success,
            request.feedback_score,
            &interaction_type,
        )?;
        tracing::debug!(
            thread_id = %thread_id,
            user_id = %state.user_id(),
            success = request.success,
            "feedback recorded"
        );
        Ok(FeedbackResponse {
            thread_id: thread_id.clone(),
            status: state.status(),
            user_id: state.user_id().clone(),
            trust_level: record.new_level,
            level_changed: record.level_changed,
            total_interactions: record.metrics.total_interactions,
        })
    }

    pub fn cancel_workflow(
        &self,
        thread_id: &ThreadId,
    ) -> Result<WorkflowResponse, OrchestratorError> {
        let state = self.retry_on_conflict(thread_id, || self.orchestrator.cancel(thread_id))?;
        Ok(WorkflowResponse::from(&state))
    }

    pub fn checkpoint_history(
        &self,
        thread_id: &ThreadId,
        limit: usize,
    ) -> Result<Vec<CheckpointMeta>, OrchestratorError> {
        self.orchestrator.checkpoint_history(thread_id, limit)
    }

    pub fn trust_level(&self, user_id: &UserId) -> Result<TrustLevel, OrchestratorError> {
        Ok(self.orchestrator.trust().current_level(user_id)?)
    }

    fn retry_on_conflict<F>(
        &self,
        thread_id: &ThreadId,
        mut operation: F,
    ) -> Result<WorkflowState, OrchestratorError>
    where
        F: FnMut() -> Result<WorkflowState, OrchestratorError>,
    {
        let mut attempt = 0;
        loop {
            match operation() {
                Err(err) if err.is_conflict() && attempt < self.conflict_retries => {
                    attempt += 1;
                    tracing::debug!(thread_id = %thread_id, attempt, "checkpoint conflict, reloading");
                }
                other => return other,
            }
        }
    }
}
