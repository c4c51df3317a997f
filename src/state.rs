//! Workflow state: the unit of persistence.
//!
//! Engine-owned fields (`status`, `trust_level`, `version`, `history`,
//! `error_log`, `pending_approval`) are private; steps read them through
//! accessors and can only influence them through the orchestrator.

use crate::shared::ids::{StepId, ThreadId, UserId, WorkflowType};
use crate::trust::TrustLevel;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    InProgress,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (WorkflowStatus::InProgress, WorkflowStatus::AwaitingApproval)
                | (WorkflowStatus::InProgress, WorkflowStatus::Completed)
                | (WorkflowStatus::InProgress, WorkflowStatus::Failed)
                | (WorkflowStatus::InProgress, WorkflowStatus::Cancelled)
                | (WorkflowStatus::AwaitingApproval, WorkflowStatus::InProgress)
                | (WorkflowStatus::AwaitingApproval, WorkflowStatus::Failed)
                | (WorkflowStatus::AwaitingApproval, WorkflowStatus::Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::InProgress => write!(f, "in_progress"),
            WorkflowStatus::AwaitingApproval => write!(f, "awaiting_approval"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOutcome {
    Started,
    Succeeded,
    Degraded,
    Failed,
    Retried,
    AwaitingApproval,
    Approved,
    Rejected,
    Cancelled,
    CeilingExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub step: StepId,
    pub timestamp: i64,
    pub outcome: HistoryOutcome,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    CircuitOpen,
    Validation,
    Routing,
    Unrecoverable,
    IterationCeilingExceeded,
    ApprovalRejected,
    TrustUnavailable,
}

impl ErrorKind {
    /// Kinds the error-handling step may retry by re-running the failed step.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::CircuitOpen)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Validation => "validation",
            ErrorKind::Routing => "routing",
            ErrorKind::Unrecoverable => "unrecoverable",
            ErrorKind::IterationCeilingExceeded => "iteration_ceiling_exceeded",
            ErrorKind::ApprovalRejected => "approval_rejected",
            ErrorKind::TrustUnavailable => "trust_unavailable",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub step: StepId,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub step: StepId,
    /// Step to route to once approved; `None` completes the workflow.
    #[serde(default)]
    pub resume_at: Option<StepId>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub reasoning: String,
    pub requested_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryState {
    /// The failure that handed control to the error step.
    #[serde(default)]
    pub failure: Option<ErrorRecord>,
    #[serde(default)]
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("workflow status transition `{from}` -> `{to}` is invalid")]
    InvalidStatusTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    thread_id: ThreadId,
    user_id: UserId,
    workflow_type: WorkflowType,
    current_step: StepId,
    #[serde(default)]
    status: WorkflowStatus,
    #[serde(default)]
    history: Vec<HistoryRecord>,
    #[serde(default)]
    trust_level: TrustLevel,
    #[serde(default)]
    accumulated_context: BTreeMap<String, Value>,
    #[serde(default)]
    pending_approval: Option<PendingApproval>,
    #[serde(default)]
    error_log: Vec<ErrorRecord>,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    total_iterations: u64,
    #[serde(default)]
    recovery: RecoveryState,
    created_at: i64,
    updated_at: i64,
}

impl WorkflowState {
    pub fn new(
        thread_id: ThreadId,
        user_id: UserId,
        workflow_type: WorkflowType,
        entry_step: StepId,
        input: Value,
        now: i64,
    ) -> Self {
        Self {
            thread_id,
            user_id,
            workflow_type,
            current_step: entry_step,
            status: WorkflowStatus::InProgress,
            history: Vec::new(),
            trust_level: TrustLevel::Observational,
            accumulated_context: BTreeMap::new(),
            pending_approval: None,
            error_log: Vec::new(),
            version: 0,
            input,
            total_iterations: 0,
            recovery: RecoveryState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn workflow_type(&self) -> &WorkflowType {
        &self.workflow_type
    }

    pub fn current_step(&self) -> &StepId {
        &self.current_step
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    pub fn trust_level(&self) -> TrustLevel {
        self.trust_level
    }

    pub fn accumulated_context(&self) -> &BTreeMap<String, Value> {
        &self.accumulated_context
    }

    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.accumulated_context.get(key)
    }

    pub fn pending_approval(&self) -> Option<&PendingApproval> {
        self.pending_approval.as_ref()
    }

    pub fn error_log(&self) -> &[ErrorRecord] {
        &self.error_log
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.error_log.last()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn total_iterations(&self) -> u64 {
        self.total_iterations
    }

    pub fn recovery(&self) -> &RecoveryState {
        &self.recovery
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Human-readable reason for a failed workflow, drawn from the last
    /// error record. Trust-store outages never fail a run, so they are
    /// passed over while any other record exists.
    pub fn failure_reason(&self) -> Option<String> {
        if self.status != WorkflowStatus::Failed {
            return None;
        }
        self.error_log
            .iter()
            .rev()
            .find(|record| record.kind != ErrorKind::TrustUnavailable)
            .or_else(|| self.error_log.last())
            .map(|record| format!("{} at step `{}`: {}", record.kind, record.step, record.message))
    }

    /// The subset of state shared with agents.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut snapshot = Map::new();
        snapshot.insert(
            "threadId".to_string(),
            Value::String(self.thread_id.to_string()),
        );
        snapshot.insert(
            "workflowType".to_string(),
            Value::String(self.workflow_type.to_string()),
        );
        snapshot.insert(
            "currentStep".to_string(),
            Value::String(self.current_step.to_string()),
        );
        snapshot.insert("input".to_string(), self.input.clone());
        snapshot.insert(
            "context".to_string(),
            Value::Object(
                self.accumulated_context
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ),
        );
        snapshot
    }

    pub(crate) fn set_status(&mut self, next: WorkflowStatus) -> Result<(), StateError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidStatusTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn tag_trust_level(&mut self, level: TrustLevel) {
        self.trust_level = level;
    }

    pub(crate) fn set_current_step(&mut self, step: StepId) {
        self.current_step = step;
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub(crate) fn set_input(&mut self, input: Value) {
        self.input = input;
    }

    pub(crate) fn touch(&mut self, now: i64) {
        self.updated_at = self.updated_at.max(now);
    }

    pub(crate) fn append_history(
        &mut self,
        step: StepId,
        outcome: HistoryOutcome,
        detail: Option<String>,
        now: i64,
    ) {
        self.history.push(HistoryRecord {
            step,
            timestamp: now,
            outcome,
            detail,
        });
        self.touch(now);
    }

    pub(crate) fn append_error(
        &mut self,
        kind: ErrorKind,
        step: StepId,
        message: impl Into<String>,
        now: i64,
    ) {
        self.error_log.push(ErrorRecord {
            kind,
            step,
            message: message.into(),
            timestamp: now,
        });
        self.touch(now);
    }

    pub(crate) fn set_pending_approval(&mut self, pending: PendingApproval) {
        self.pending_approval = Some(pending);
    }

    pub(crate) fn take_pending_approval(&mut self) -> Option<PendingApproval> {
        self.pending_approval.take()
    }

    pub(crate) fn context_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.accumulated_context
    }

    pub(crate) fn recovery_mut(&mut self) -> &mut RecoveryState {
        &mut self.recovery
    }

    pub(crate) fn increment_iterations(&mut self) {
        self.total_iterations = self.total_iterations.saturating_add(1);
    }
}
