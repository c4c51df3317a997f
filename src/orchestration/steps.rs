use crate::agents::{AgentError, AgentRegistry, AgentRequest, AgentResponse};
use crate::context::Observation;
use crate::resilience::{Invocation, ResilienceFailure, ResilienceLayer};
use crate::shared::ids::{CapabilityId, StepId, ThreadId};
use crate::state::{ErrorKind, WorkflowState};
use crate::trust::TrustLevel;

/// What a step sees besides the state: its own id, the tagged trust level
/// and the collaborators it may call.
pub struct StepContext<'a> {
    pub thread_id: &'a ThreadId,
    pub step_id: &'a StepId,
    pub trust_level: TrustLevel,
    pub agents: &'a AgentRegistry,
    pub resilience: &'a ResilienceLayer,
    pub now: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    #[error("transient failure: {message}")]
    Transient { message: String },
    #[error("capability unavailable: {message}")]
    CircuitOpen { message: String },
    #[error("validation failed: {message}")]
    Validation { message: String },
    #[error("unrecoverable failure: {message}")]
    Unrecoverable { message: String },
}

impl StepError {
    pub fn validation(message: impl Into<String>) -> Self {
        StepError::Validation {
            message: message.into(),
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        StepError::Unrecoverable {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Transient { .. } => ErrorKind::Transient,
            StepError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            StepError::Validation { .. } => ErrorKind::Validation,
            StepError::Unrecoverable { .. } => ErrorKind::Unrecoverable,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StepError::Transient { message }
            | StepError::CircuitOpen { message }
            | StepError::Validation { message }
            | StepError::Unrecoverable { message } => message,
        }
    }
}

/// Request from a step to feed one interaction into trust calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionOutcome {
    pub success: bool,
    pub feedback_score: Option<f64>,
    pub interaction_type: String,
}

/// Non-fatal problem recorded in the error log while the step still produced output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepIssue {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    Retry { step: StepId },
    Escalate { step: StepId, reason: String },
    Fail { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub observation: Observation,
    /// Agent response; `requires_human_review` suspends the workflow.
    pub response: Option<AgentResponse>,
    pub interaction: Option<InteractionOutcome>,
    /// Set by the error step only.
    pub recovery: Option<RecoveryDecision>,
    pub issues: Vec<StepIssue>,
}

impl StepOutput {
    pub fn observe(observation: Observation) -> Self {
        Self {
            observation,
            ..Self::default()
        }
    }
}

pub trait WorkflowStep: Send + Sync {
    fn run(&self, ctx: &StepContext<'_>, state: &WorkflowState) -> Result<StepOutput, StepError>;
}

impl<F> WorkflowStep for F
where
    F: Fn(&StepContext<'_>, &WorkflowState) -> Result<StepOutput, StepError> + Send + Sync,
{
    fn run(&self, ctx: &StepContext<'_>, state: &WorkflowState) -> Result<StepOutput, StepError> {
        self(ctx, state)
    }
}

/// Invokes one capability through the resilience layer and stores its
/// payload under `output_key`.
#[derive(Debug, Clone)]
pub struct AgentStep {
    capability: CapabilityId,
    output_key: Option<String>,
    fallback: Option<AgentResponse>,
}

impl AgentStep {
    pub fn new(capability: CapabilityId) -> Self {
        Self {
            capability,
            output_key: None,
            fallback: None,
        }
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn fallback(mut self, response: AgentResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    pub fn capability(&self) -> &CapabilityId {
        &self.capability
    }
}

impl WorkflowStep for AgentStep {
    fn run(&self, ctx: &StepContext<'_>, state: &WorkflowState) -> Result<StepOutput, StepError> {
        let adapter = ctx
            .agents
            .get(&self.capability)
            .map_err(|err| StepError::unrecoverable(err.to_string()))?;
        let request = AgentRequest {
            capability_id: self.capability.clone(),
            snapshot: state.snapshot(),
            trust_level: ctx.trust_level,
        };

        let invocation = ctx
            .resilience
            .invoke(&self.capability, adapter, &request, self.fallback.as_ref())
            .map_err(step_error_for)?;

        let mut output = StepOutput::default();
        let response = match invocation {
            Invocation::Completed { response, .. } => response,
            Invocation::Fallback { response, cause } => {
                output.issues.push(StepIssue {
                    kind: issue_kind_for(&cause),
                    message: format!("fallback used: {cause}"),
                });
                response
            }
        };
        if !response.success {
            let reason = if response.reasoning.is_empty() {
                format!("capability `{}` reported failure", self.capability)
            } else {
                response.reasoning.clone()
            };
            // A review request always reaches the approval gate; the
            // unsuccessful payload goes to the approver, not into context.
            if response.requires_human_review {
                output.issues.push(StepIssue {
                    kind: ErrorKind::Validation,
                    message: reason,
                });
                output.response = Some(response);
                return Ok(output);
            }
            return Err(StepError::Validation { message: reason });
        }

        if let Some(key) = &self.output_key {
            output.observation.insert(key.clone(), response.payload.clone());
        }
        output.response = Some(response);
        Ok(output)
    }
}

fn issue_kind_for(cause: &ResilienceFailure) -> ErrorKind {
    match cause {
        ResilienceFailure::CircuitOpen { .. } => ErrorKind::CircuitOpen,
        ResilienceFailure::Exhausted { .. } => ErrorKind::Transient,
        ResilienceFailure::Rejected(_) => ErrorKind::Validation,
    }
}

fn step_error_for(failure: ResilienceFailure) -> StepError {
    let message = failure.to_string();
    match failure {
        ResilienceFailure::CircuitOpen { .. } => StepError::CircuitOpen { message },
        ResilienceFailure::Exhausted { .. } => StepError::Transient { message },
        ResilienceFailure::Rejected(AgentError::Validation { .. }) => {
            StepError::Validation { message }
        }
        ResilienceFailure::Rejected(AgentError::UnknownCapability { .. }) => {
            StepError::Unrecoverable { message }
        }
        ResilienceFailure::Rejected(_) => StepError::Transient { message },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    pub escalate_validation_errors: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            escalate_validation_errors: true,
        }
    }
}

/// Built-in error step: retry retryable kinds while the retry budget
/// lasts, hand validation errors to a human, fail everything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorHandlerStep {
    policy: RecoveryPolicy,
}

impl ErrorHandlerStep {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self { policy }
    }

    /// Decides from the failure that routed here, not from whatever was
    /// logged last.
    pub fn decide(&self, state: &WorkflowState) -> RecoveryDecision {
        let Some(last_error) = state.recovery().failure.as_ref() else {
            return RecoveryDecision::Fail {
                reason: "error step reached without a recorded failure".to_string(),
            };
        };
        let failed_step = last_error.step.clone();

        if last_error.kind.is_retryable() && state.recovery().retries < self.policy.max_retries {
            return RecoveryDecision::Retry { step: failed_step };
        }
        if last_error.kind == ErrorKind::Validation && self.policy.escalate_validation_errors {
            return RecoveryDecision::Escalate {
                step: failed_step,
                reason: format!("human review required: {}", last_error.message),
            };
        }
        RecoveryDecision::Fail {
            reason: format!(
                "{} error at step `{}` is not recoverable",
                last_error.kind, last_error.step
            ),
        }
    }
}

impl WorkflowStep for ErrorHandlerStep {
    fn run(&self, _ctx: &StepContext<'_>, state: &WorkflowState) -> Result<StepOutput, StepError> {
        Ok(StepOutput {
            recovery: Some(self.decide(state)),
            ..StepOutput::default()
        })
    }
}
