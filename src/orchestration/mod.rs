pub mod error;
pub mod graph;
pub mod phase;
pub mod service;
pub mod steps;
pub mod workflow_engine;

pub use error::OrchestratorError;
pub use graph::{GraphBuilder, GraphError, NextStep, Transition, WorkflowGraph, DEFAULT_ERROR_STEP};
pub use phase::EnginePhase;
pub use service::{
    ApprovalRequest, FeedbackRequest, FeedbackResponse, StartWorkflowRequest, StatusResponse,
    WorkflowResponse, WorkflowService,
};
pub use steps::{
    AgentStep, ErrorHandlerStep, InteractionOutcome, RecoveryDecision, RecoveryPolicy,
    StepContext, StepError, StepIssue, StepOutput, WorkflowStep,
};
pub use workflow_engine::{ApprovalDecision, ExecutionLimits, Orchestrator};
