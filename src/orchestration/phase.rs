/// Engine phase within one invocation of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Routing,
    StepExecuting,
    Checkpointing,
    AwaitingApproval,
    Terminal,
}

impl EnginePhase {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (EnginePhase::Routing, EnginePhase::StepExecuting)
                // cancellation and the iteration ceiling are decided without running a step
                | (EnginePhase::Routing, EnginePhase::Checkpointing)
                | (EnginePhase::StepExecuting, EnginePhase::Checkpointing)
                | (EnginePhase::Checkpointing, EnginePhase::Routing)
                | (EnginePhase::Checkpointing, EnginePhase::AwaitingApproval)
                | (EnginePhase::Checkpointing, EnginePhase::Terminal)
                | (EnginePhase::AwaitingApproval, EnginePhase::Routing)
        )
    }
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnginePhase::Routing => write!(f, "routing"),
            EnginePhase::StepExecuting => write!(f, "step_executing"),
            EnginePhase::Checkpointing => write!(f, "checkpointing"),
            EnginePhase::AwaitingApproval => write!(f, "awaiting_approval"),
            EnginePhase::Terminal => write!(f, "terminal"),
        }
    }
}
