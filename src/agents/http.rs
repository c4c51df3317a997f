use super::{AgentAdapter, AgentError, AgentRequest, AgentResponse};
use crate::shared::ids::CapabilityId;
use std::time::Duration;

/// Posts the request as JSON to a remote capability endpoint.
pub struct HttpAgentAdapter {
    capability: CapabilityId,
    endpoint: String,
    agent: ureq::Agent,
}

impl std::fmt::Debug for HttpAgentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAgentAdapter")
            .field("capability", &self.capability)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl HttpAgentAdapter {
    pub fn new(capability: CapabilityId, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            capability,
            endpoint: endpoint.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn unavailable(&self, message: impl Into<String>) -> AgentError {
        AgentError::Unavailable {
            capability: self.capability.clone(),
            message: message.into(),
        }
    }

    fn validation(&self, message: impl Into<String>) -> AgentError {
        AgentError::Validation {
            capability: self.capability.clone(),
            message: message.into(),
        }
    }
}

impl AgentAdapter for HttpAgentAdapter {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        let body = serde_json::to_value(request)
            .map_err(|e| self.validation(format!("request encode failed: {e}")))?;
        let response = match self.agent.post(&self.endpoint).send_json(body) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                let message = format!("http status {code}: {}", detail.trim());
                return Err(if is_transient_status(code) {
                    self.unavailable(message)
                } else {
                    self.validation(message)
                });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(self.unavailable(transport.to_string()));
            }
        };

        response
            .into_json::<AgentResponse>()
            .map_err(|e| self.validation(format!("malformed agent response: {e}")))
    }
}

fn is_transient_status(code: u16) -> bool {
    code == 429 || (500..600).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(is_transient_status(503));
        assert!(is_transient_status(429));
        assert!(!is_transient_status(400));
        assert!(!is_transient_status(422));
    }

    #[test]
    fn unreachable_endpoint_is_unavailable() {
        let adapter = HttpAgentAdapter::new(
            CapabilityId::parse("policy_drafting").expect("id"),
            "http://127.0.0.1:9/agents/policy",
            Duration::from_millis(200),
        );
        let request = AgentRequest {
            capability_id: CapabilityId::parse("policy_drafting").expect("id"),
            snapshot: serde_json::Map::new(),
            trust_level: crate::trust::TrustLevel::Observational,
        };
        let err = adapter.invoke(&request).expect_err("connection refused");
        assert!(err.is_transient());
    }
}
