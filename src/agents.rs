//! Fixed request/response contract between the orchestrator and pluggable
//! domain capabilities. What happens behind an adapter is not the
//! orchestrator's concern.

use crate::shared::ids::CapabilityId;
use crate::shared::serde_ext::deserialize_unit_interval;
use crate::trust::TrustLevel;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod function;
pub mod http;

pub use function::FnAgentAdapter;
pub use http::HttpAgentAdapter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub capability_id: CapabilityId,
    pub snapshot: Map<String, Value>,
    pub trust_level: TrustLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub success: bool,
    #[serde(deserialize_with = "deserialize_unit_interval")]
    pub confidence: f64,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub requires_human_review: bool,
    #[serde(default)]
    pub reasoning: String,
}

impl AgentResponse {
    pub fn success(payload: Value, confidence: f64) -> Self {
        Self {
            success: true,
            confidence,
            payload,
            requires_human_review: false,
            reasoning: String::new(),
        }
    }

    pub fn with_review(mut self, reasoning: impl Into<String>) -> Self {
        self.requires_human_review = true;
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("capability `{capability}` timed out after {timeout_ms}ms")]
    Timeout {
        capability: CapabilityId,
        timeout_ms: u64,
    },
    #[error("capability `{capability}` unavailable: {message}")]
    Unavailable {
        capability: CapabilityId,
        message: String,
    },
    #[error("capability `{capability}` rejected the request: {message}")]
    Validation {
        capability: CapabilityId,
        message: String,
    },
    #[error("no agent registered for capability `{capability}`")]
    UnknownCapability { capability: CapabilityId },
}

impl AgentError {
    /// Timeouts and 5xx-equivalents; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Timeout { .. } | AgentError::Unavailable { .. }
        )
    }

    pub fn capability(&self) -> &CapabilityId {
        match self {
            AgentError::Timeout { capability, .. }
            | AgentError::Unavailable { capability, .. }
            | AgentError::Validation { capability, .. }
            | AgentError::UnknownCapability { capability } => capability,
        }
    }
}

pub trait AgentAdapter: Send + Sync {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError>;
}

/// Capability id -> adapter dispatch table, built at startup.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    adapters: BTreeMap<CapabilityId, Arc<dyn AgentAdapter>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("capabilities", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: CapabilityId, adapter: Arc<dyn AgentAdapter>) {
        self.adapters.insert(capability, adapter);
    }

    pub fn with(mut self, capability: CapabilityId, adapter: Arc<dyn AgentAdapter>) -> Self {
        self.register(capability, adapter);
        self
    }

    pub fn get(&self, capability: &CapabilityId) -> Result<Arc<dyn AgentAdapter>, AgentError> {
        self.adapters
            .get(capability)
            .cloned()
            .ok_or_else(|| AgentError::UnknownCapability {
                capability: capability.clone(),
            })
    }

    pub fn contains(&self, capability: &CapabilityId) -> bool {
        self.adapters.contains_key(capability)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &CapabilityId> {
        self.adapters.keys()
    }
}
