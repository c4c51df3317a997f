use super::{AgentAdapter, AgentError, AgentRequest, AgentResponse};

type AgentFn = dyn Fn(&AgentRequest) -> Result<AgentResponse, AgentError> + Send + Sync;

/// In-process adapter backed by a closure.
pub struct FnAgentAdapter {
    handler: Box<AgentFn>,
}

impl FnAgentAdapter {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&AgentRequest) -> Result<AgentResponse, AgentError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }
}

impl std::fmt::Debug for FnAgentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnAgentAdapter")
    }
}

impl AgentAdapter for FnAgentAdapter {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        (self.handler)(request)
    }
}
