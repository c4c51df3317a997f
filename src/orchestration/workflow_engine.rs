use crate::agents::{AgentRegistry, AgentResponse};
use crate::checkpoint::{CheckpointError, CheckpointMeta, CheckpointStore};
use crate::context;
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::graph::{NextStep, WorkflowGraph};
use crate::orchestration::phase::EnginePhase;
use crate::orchestration::steps::{InteractionOutcome, RecoveryDecision, StepContext, StepOutput};
use crate::resilience::ResilienceLayer;
use crate::shared::clock::Clock;
use crate::shared::ids::{StepId, ThreadId, UserId, WorkflowType};
use crate::shared::logging::EventLog;
use crate::state::{
    ErrorKind, HistoryOutcome, PendingApproval, RecoveryState, WorkflowState, WorkflowStatus,
};
use crate::trust::TrustCalibrator;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Step executions allowed in one `start`/`resume`/approval call.
    pub max_iterations_per_invocation: u32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_iterations_per_invocation: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    /// Resume at the gated step's successor, optionally replacing the workflow input.
    Approve { input: Option<Value> },
    Reject { reason: String },
}

pub struct Orchestrator {
    graphs: BTreeMap<WorkflowType, Arc<WorkflowGraph>>,
    checkpoints: Arc<dyn CheckpointStore>,
    trust: Arc<TrustCalibrator>,
    resilience: Arc<ResilienceLayer>,
    agents: AgentRegistry,
    clock: Arc<dyn Clock>,
    limits: ExecutionLimits,
    event_log: Option<Arc<EventLog>>,
    active: Mutex<BTreeMap<ThreadId, usize>>,
    cancel_requests: Mutex<BTreeMap<ThreadId, i64>>,
}

/// Marks a thread as executing in this process for the guard's lifetime.
/// A cancel request still pending when the last execution leaves is dropped.
struct ActiveExecution<'a> {
    active: &'a Mutex<BTreeMap<ThreadId, usize>>,
    cancel_requests: &'a Mutex<BTreeMap<ThreadId, i64>>,
    thread_id: ThreadId,
}

impl<'a> ActiveExecution<'a> {
    fn enter(
        active: &'a Mutex<BTreeMap<ThreadId, usize>>,
        cancel_requests: &'a Mutex<BTreeMap<ThreadId, i64>>,
        thread_id: &ThreadId,
    ) -> Self {
        *active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(thread_id.clone())
            .or_default() += 1;
        Self {
            active,
            cancel_requests,
            thread_id: thread_id.clone(),
        }
    }
}

impl Drop for ActiveExecution<'_> {
    fn drop(&mut self) {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(count) = active.get_mut(&self.thread_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(&self.thread_id);
                self.cancel_requests
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&self.thread_id);
            }
        }
    }
}

fn advance(phase: EnginePhase, next: EnginePhase) -> Result<EnginePhase, OrchestratorError> {
    if phase.can_transition_to(next) {
        Ok(next)
    } else {
        Err(OrchestratorError::InvalidPhaseTransition {
            from: phase,
            to: next,
        })
    }
}

impl Orchestrator {
    pub fn new(
        checkpoints: Arc<dyn CheckpointStore>,
        trust: Arc<TrustCalibrator>,
        resilience: Arc<ResilienceLayer>,
        agents: AgentRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            graphs: BTreeMap::new(),
            checkpoints,
            trust,
            resilience,
            agents,
            clock,
            limits: ExecutionLimits::default(),
            event_log: None,
            active: Mutex::new(BTreeMap::new()),
            cancel_requests: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_graph(mut self, graph: WorkflowGraph) -> Self {
        self.graphs
            .insert(graph.workflow_type().clone(), Arc::new(graph));
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_event_log(mut self, event_log: Arc<EventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn trust(&self) -> &TrustCalibrator {
        &self.trust
    }

    pub fn resilience(&self) -> &ResilienceLayer {
        &self.resilience
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn graph(&self, workflow_type: &WorkflowType) -> Result<Arc<WorkflowGraph>, OrchestratorError> {
        self.graphs
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownWorkflowType {
                workflow_type: workflow_type.clone(),
            })
    }

    pub fn status(&self, thread_id: &ThreadId) -> Result<WorkflowState, OrchestratorError> {
        let (state, _) = self.checkpoints.load(thread_id)?;
        Ok(state)
    }

    pub fn checkpoint_history(
        &self,
        thread_id: &ThreadId,
        limit: usize,
    ) -> Result<Vec<CheckpointMeta>, OrchestratorError> {
        Ok(self.checkpoints.history(thread_id, limit)?)
    }

    pub fn load_checkpoint(
        &self,
        thread_id: &ThreadId,
        version: u64,
    ) -> Result<WorkflowState, OrchestratorError> {
        Ok(self.checkpoints.load_version(thread_id, version)?)
    }

    pub fn start(
        &self,
        thread_id: &ThreadId,
        user_id: &UserId,
        workflow_type: &WorkflowType,
        input: Value,
    ) -> Result<WorkflowState, OrchestratorError> {
        let graph = self.graph(workflow_type)?;
        match self.checkpoints.load(thread_id) {
            Ok(_) => {
                return Err(OrchestratorError::ThreadAlreadyStarted {
                    thread_id: thread_id.clone(),
                })
            }
            Err(CheckpointError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        let now = self.clock.now_ms();
        let mut state = WorkflowState::new(
            thread_id.clone(),
            user_id.clone(),
            workflow_type.clone(),
            graph.entry().clone(),
            input,
            now,
        );
        self.tag_trust(&mut state, now);
        match self.persist(&mut state) {
            Err(OrchestratorError::Conflict { .. }) => {
                return Err(OrchestratorError::ThreadAlreadyStarted {
                    thread_id: thread_id.clone(),
                })
            }
            other => other?,
        }
        tracing::info!(
            thread_id = %thread_id,
            workflow_type = %workflow_type,
            user_id = %user_id,
            "workflow started"
        );
        self.record_event(now, "workflow_started", &state, &[]);
        self.run(&graph, state)
    }

    /// Continue an in-progress workflow. Suspended and terminal workflows
    /// are returned unchanged.
    pub fn resume(
        &self,
        thread_id: &ThreadId,
        input: Option<Value>,
    ) -> Result<WorkflowState, OrchestratorError> {
        let (mut state, _) = self.checkpoints.load(thread_id)?;
        if state.status() != WorkflowStatus::InProgress {
            return Ok(state);
        }
        if let Some(input) = input {
            state.set_input(input);
        }
        let graph = self.graph(state.workflow_type())?;
        self.run(&graph, state)
    }

    pub fn submit_approval(
        &self,
        thread_id: &ThreadId,
        decision: ApprovalDecision,
    ) -> Result<WorkflowState, OrchestratorError> {
        let (mut state, _) = self.checkpoints.load(thread_id)?;
        let pending = match state.status() {
            WorkflowStatus::AwaitingApproval => state.take_pending_approval(),
            _ => None,
        }
        .ok_or_else(|| OrchestratorError::NoPendingApproval {
            thread_id: thread_id.clone(),
            status: state.status(),
        })?;
        let now = self.clock.now_ms();

        match decision {
            ApprovalDecision::Approve { input } => {
                if let Some(input) = input {
                    state.set_input(input);
                }
                state.append_history(pending.step.clone(), HistoryOutcome::Approved, None, now);
                state.set_status(WorkflowStatus::InProgress)?;
                match pending.resume_at {
                    Some(step) => state.set_current_step(step),
                    None => state.set_status(WorkflowStatus::Completed)?,
                }
                self.persist(&mut state)?;
                self.record_event(now, "approval_granted", &state, &[]);
                if state.status() != WorkflowStatus::InProgress {
                    return Ok(state);
                }
                let graph = self.graph(state.workflow_type())?;
                self.run(&graph, state)
            }
            ApprovalDecision::Reject { reason } => {
                state.append_history(
                    pending.step.clone(),
                    HistoryOutcome::Rejected,
                    Some(reason.clone()),
                    now,
                );
                state.append_error(ErrorKind::ApprovalRejected, pending.step, reason, now);
                state.set_status(WorkflowStatus::Failed)?;
                self.persist(&mut state)?;
                self.record_event(now, "approval_rejected", &state, &[]);
                Ok(state)
            }
        }
    }

    /// Cancel a workflow. A workflow executing in this process stops at its
    /// next step boundary; an idle or suspended one is cancelled immediately.
    pub fn cancel(&self, thread_id: &ThreadId) -> Result<WorkflowState, OrchestratorError> {
        let (mut state, _) = self.checkpoints.load(thread_id)?;
        if state.status().is_terminal() {
            return Ok(state);
        }
        let now = self.clock.now_ms();
        if state.status() == WorkflowStatus::InProgress && self.request_cancel(thread_id, now) {
            tracing::info!(thread_id = %thread_id, "cancellation requested");
            return Ok(state);
        }
        self.cancel_now(&mut state, now)?;
        Ok(state)
    }

    /// Queue a cancel for a run executing in this process. Checked and
    /// queued under the `active` lock so the request cannot outlive the run.
    fn request_cancel(&self, thread_id: &ThreadId, now: i64) -> bool {
        let active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.contains_key(thread_id) {
            return false;
        }
        self.cancel_requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(thread_id.clone(), now);
        true
    }

    fn take_cancel_request(&self, thread_id: &ThreadId) -> bool {
        self.cancel_requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(thread_id)
            .is_some()
    }

    fn run(
        &self,
        graph: &WorkflowGraph,
        mut state: WorkflowState,
    ) -> Result<WorkflowState, OrchestratorError> {
        let thread_id = state.thread_id().clone();
        let _active = ActiveExecution::enter(&self.active, &self.cancel_requests, &thread_id);
        let mut phase = EnginePhase::Routing;
        let mut iterations = 0_u32;

        while state.status() == WorkflowStatus::InProgress {
            let now = self.clock.now_ms();
            if self.take_cancel_request(&thread_id) {
                phase = advance(phase, EnginePhase::Checkpointing)?;
                self.cancel_now(&mut state, now)?;
                phase = advance(phase, EnginePhase::Terminal)?;
                break;
            }
            if iterations >= self.limits.max_iterations_per_invocation {
                phase = advance(phase, EnginePhase::Checkpointing)?;
                self.fail_iteration_ceiling(&mut state, now)?;
                phase = advance(phase, EnginePhase::Terminal)?;
                break;
            }
            iterations += 1;

            self.tag_trust(&mut state, now);
            let step_id = state.current_step().clone();
            phase = advance(phase, EnginePhase::StepExecuting)?;
            self.execute_step(graph, &mut state, &step_id, now)?;

            phase = advance(phase, EnginePhase::Checkpointing)?;
            self.persist(&mut state)?;
            phase = advance(
                phase,
                match state.status() {
                    WorkflowStatus::InProgress => EnginePhase::Routing,
                    WorkflowStatus::AwaitingApproval => EnginePhase::AwaitingApproval,
                    _ => EnginePhase::Terminal,
                },
            )?;
        }

        // A cancel that arrived after the last step boundary still applies to a suspended run.
        if self.take_cancel_request(&thread_id)
            && state.status() == WorkflowStatus::AwaitingApproval
        {
            let now = self.clock.now_ms();
            self.cancel_now(&mut state, now)?;
            phase = EnginePhase::Terminal;
        }

        tracing::debug!(
            thread_id = %thread_id,
            phase = %phase,
            iterations,
            status = %state.status(),
            "workflow invocation returned"
        );
        self.log_outcome(&state);
        Ok(state)
    }

    fn execute_step(
        &self,
        graph: &WorkflowGraph,
        state: &mut WorkflowState,
        step_id: &StepId,
        now: i64,
    ) -> Result<(), OrchestratorError> {
        let step = match graph.step(step_id) {
            Ok(step) => step,
            Err(err) => {
                return self.route_failure(
                    graph,
                    state,
                    step_id,
                    ErrorKind::Routing,
                    err.to_string(),
                    now,
                )
            }
        };

        state.increment_iterations();
        state.append_history(step_id.clone(), HistoryOutcome::Started, None, now);
        let thread_id = state.thread_id().clone();
        tracing::debug!(
            thread_id = %thread_id,
            step = %step_id,
            trust_level = %state.trust_level(),
            "executing step"
        );

        let ctx = StepContext {
            thread_id: &thread_id,
            step_id,
            trust_level: state.trust_level(),
            agents: &self.agents,
            resilience: &self.resilience,
            now,
        };
        match step.run(&ctx, state) {
            Ok(output) => self.apply_output(graph, state, step_id, output, now),
            Err(err) => {
                tracing::warn!(
                    thread_id = %thread_id,
                    step = %step_id,
                    kind = %err.kind(),
                    error = %err,
                    "step failed"
                );
                self.route_failure(
                    graph,
                    state,
                    step_id,
                    err.kind(),
                    err.message().to_string(),
                    now,
                )
            }
        }
    }

    fn apply_output(
        &self,
        graph: &WorkflowGraph,
        state: &mut WorkflowState,
        step_id: &StepId,
        output: StepOutput,
        now: i64,
    ) -> Result<(), OrchestratorError> {
        let StepOutput {
            observation,
            response,
            interaction,
            recovery,
            issues,
        } = output;

        if step_id == graph.error_step() {
            return self.apply_recovery(graph, state, step_id, recovery, now);
        }

        if !observation.is_empty() {
            match context::merge(graph.context(), state, &observation) {
                Ok(merged) => *state = merged,
                Err(err) => {
                    return self.route_failure(
                        graph,
                        state,
                        step_id,
                        ErrorKind::Validation,
                        err.to_string(),
                        now,
                    )
                }
            }
        }

        let degraded = !issues.is_empty();
        for issue in issues {
            state.append_error(issue.kind, step_id.clone(), issue.message, now);
        }
        if let Some(interaction) = interaction {
            self.record_interaction(state, step_id, &interaction, now);
        }

        let next = match graph.resolve_next(step_id, state) {
            Ok(next) => next,
            Err(err) => {
                return self.route_failure(
                    graph,
                    state,
                    step_id,
                    ErrorKind::Routing,
                    err.to_string(),
                    now,
                )
            }
        };

        *state.recovery_mut() = RecoveryState::default();
        let outcome = if degraded {
            HistoryOutcome::Degraded
        } else {
            HistoryOutcome::Succeeded
        };
        state.append_history(step_id.clone(), outcome, None, now);
        self.record_event(
            now,
            if degraded { "step_degraded" } else { "step_succeeded" },
            state,
            &[("step", Value::String(step_id.to_string()))],
        );
        self.gate(state, step_id, next, response, now)
    }

    /// The single approval gate: a response flagged for human review
    /// suspends the workflow, anything else routes on.
    fn gate(
        &self,
        state: &mut WorkflowState,
        step_id: &StepId,
        next: NextStep,
        response: Option<AgentResponse>,
        now: i64,
    ) -> Result<(), OrchestratorError> {
        if let Some(response) = response.filter(|response| response.requires_human_review) {
            let resume_at = match next {
                NextStep::Step(step) => Some(step),
                NextStep::End => None,
            };
            state.set_pending_approval(PendingApproval {
                step: step_id.clone(),
                resume_at,
                payload: response.payload,
                reasoning: response.reasoning.clone(),
                requested_at: now,
            });
            state.append_history(
                step_id.clone(),
                HistoryOutcome::AwaitingApproval,
                (!response.reasoning.is_empty()).then_some(response.reasoning),
                now,
            );
            state.set_status(WorkflowStatus::AwaitingApproval)?;
            self.record_event(
                now,
                "approval_requested",
                state,
                &[("step", Value::String(step_id.to_string()))],
            );
            return Ok(());
        }

        match next {
            NextStep::Step(step) => {
                tracing::debug!(thread_id = %state.thread_id(), from = %step_id, to = %step, "routing");
                state.set_current_step(step);
            }
            NextStep::End => state.set_status(WorkflowStatus::Completed)?,
        }
        Ok(())
    }

    fn apply_recovery(
        &self,
        graph: &WorkflowGraph,
        state: &mut WorkflowState,
        error_step: &StepId,
        recovery: Option<RecoveryDecision>,
        now: i64,
    ) -> Result<(), OrchestratorError> {
        let decision = recovery.unwrap_or_else(|| RecoveryDecision::Fail {
            reason: "error step returned no recovery decision".to_string(),
        });
        match decision {
            RecoveryDecision::Retry { step } => {
                if let Err(err) = graph.step(&step) {
                    return self.fail(state, error_step, err.to_string(), now);
                }
                state.recovery_mut().retries += 1;
                state.append_history(
                    error_step.clone(),
                    HistoryOutcome::Retried,
                    Some(format!("retrying step `{step}`")),
                    now,
                );
                state.set_current_step(step);
                Ok(())
            }
            RecoveryDecision::Escalate { step, reason } => {
                if let Err(err) = graph.step(&step) {
                    return self.fail(state, error_step, err.to_string(), now);
                }
                let payload = state
                    .recovery()
                    .failure
                    .as_ref()
                    .and_then(|record| serde_json::to_value(record).ok())
                    .unwrap_or(Value::Null);
                let review = AgentResponse {
                    success: false,
                    confidence: 0.0,
                    payload,
                    requires_human_review: true,
                    reasoning: reason,
                };
                self.gate(state, error_step, NextStep::Step(step), Some(review), now)
            }
            RecoveryDecision::Fail { reason } => self.fail(state, error_step, reason, now),
        }
    }

    fn fail(
        &self,
        state: &mut WorkflowState,
        step_id: &StepId,
        reason: String,
        now: i64,
    ) -> Result<(), OrchestratorError> {
        state.append_history(step_id.clone(), HistoryOutcome::Failed, Some(reason), now);
        state.set_status(WorkflowStatus::Failed)?;
        Ok(())
    }

    /// Record a step failure and hand control to the error step. A failure
    /// inside the error step itself is terminal.
    fn route_failure(
        &self,
        graph: &WorkflowGraph,
        state: &mut WorkflowState,
        step_id: &StepId,
        kind: ErrorKind,
        message: String,
        now: i64,
    ) -> Result<(), OrchestratorError> {
        state.append_error(kind, step_id.clone(), message.clone(), now);
        self.record_event(
            now,
            "step_failed",
            state,
            &[
                ("step", Value::String(step_id.to_string())),
                ("kind", Value::String(kind.to_string())),
                ("message", Value::String(message.clone())),
            ],
        );
        if step_id == graph.error_step() {
            return self.fail(state, step_id, message, now);
        }
        state.append_history(step_id.clone(), HistoryOutcome::Failed, Some(message), now);
        let failure = state.last_error().cloned();
        state.recovery_mut().failure = failure;
        state.set_current_step(graph.error_step().clone());
        Ok(())
    }

    fn record_interaction(
        &self,
        state: &mut WorkflowState,
        step_id: &StepId,
        interaction: &InteractionOutcome,
        now: i64,
    ) {
        match self.trust.record_outcome(
            state.user_id(),
            interaction.success,
            interaction.feedback_score,
            &interaction.interaction_type,
        ) {
            Ok(record) if record.level_changed => self.record_event(
                now,
                "trust_level_changed",
                state,
                &[("newLevel", Value::String(record.new_level.to_string()))],
            ),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(user_id = %state.user_id(), error = %err, "trust outcome not recorded");
                state.append_error(ErrorKind::TrustUnavailable, step_id.clone(), err.to_string(), now);
            }
        }
    }

    /// Trust is read before every step; when it cannot be read the
    /// previous level stays in place.
    fn tag_trust(&self, state: &mut WorkflowState, now: i64) {
        match self.trust.current_level(state.user_id()) {
            Ok(level) => state.tag_trust_level(level),
            Err(err) => {
                tracing::warn!(user_id = %state.user_id(), error = %err, "trust level unavailable");
                let step = state.current_step().clone();
                state.append_error(ErrorKind::TrustUnavailable, step, err.to_string(), now);
            }
        }
    }

    fn fail_iteration_ceiling(
        &self,
        state: &mut WorkflowState,
        now: i64,
    ) -> Result<(), OrchestratorError> {
        let step = state.current_step().clone();
        let message = format!(
            "workflow exceeded {} step executions in one invocation",
            self.limits.max_iterations_per_invocation
        );
        tracing::warn!(thread_id = %state.thread_id(), step = %step, "iteration ceiling exceeded");
        state.append_error(
            ErrorKind::IterationCeilingExceeded,
            step.clone(),
            message.clone(),
            now,
        );
        state.append_history(step, HistoryOutcome::CeilingExceeded, Some(message), now);
        state.set_status(WorkflowStatus::Failed)?;
        self.persist(state)
    }

    fn cancel_now(&self, state: &mut WorkflowState, now: i64) -> Result<(), OrchestratorError> {
        let step = state.current_step().clone();
        state.take_pending_approval();
        state.append_history(step, HistoryOutcome::Cancelled, None, now);
        state.set_status(WorkflowStatus::Cancelled)?;
        self.persist(state)?;
        self.record_event(now, "workflow_cancelled", state, &[]);
        Ok(())
    }

    fn persist(&self, state: &mut WorkflowState) -> Result<(), OrchestratorError> {
        state.touch(self.clock.now_ms());
        let thread_id = state.thread_id().clone();
        let version = self.checkpoints.save(&thread_id, state)?;
        state.set_version(version);
        self.record_event(
            state.updated_at(),
            "checkpoint_saved",
            state,
            &[("version", Value::from(version))],
        );
        Ok(())
    }

    fn log_outcome(&self, state: &WorkflowState) {
        let event = match state.status() {
            WorkflowStatus::Completed => "workflow_completed",
            WorkflowStatus::Failed => "workflow_failed",
            WorkflowStatus::Cancelled => "workflow_cancelled",
            WorkflowStatus::AwaitingApproval => "workflow_suspended",
            WorkflowStatus::InProgress => return,
        };
        if state.status().is_terminal() {
            tracing::info!(
                thread_id = %state.thread_id(),
                status = %state.status(),
                reason = %state.failure_reason().unwrap_or_default(),
                "workflow finished"
            );
        }
        // Cancellation already wrote its own event.
        if state.status() != WorkflowStatus::Cancelled {
            let reason = state
                .failure_reason()
                .map(Value::String)
                .unwrap_or(Value::Null);
            self.record_event(state.updated_at(), event, state, &[("reason", reason)]);
        }
    }

    fn record_event(
        &self,
        timestamp_ms: i64,
        event: &str,
        state: &WorkflowState,
        extra: &[(&str, Value)],
    ) {
        let Some(event_log) = &self.event_log else {
            return;
        };
        let mut fields = vec![
            ("threadId", Value::String(state.thread_id().to_string())),
            ("currentStep", Value::String(state.current_step().to_string())),
            ("status", Value::String(state.status().to_string())),
        ];
        fields.extend(extra.iter().cloned());
        event_log.record(timestamp_ms, event, &fields);
    }
}
