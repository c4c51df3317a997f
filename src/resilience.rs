//! Circuit breaking, bounded retries and fallback around agent calls.

use crate::agents::{AgentAdapter, AgentError, AgentRequest, AgentResponse};
use crate::shared::clock::Clock;
use crate::shared::ids::CapabilityId;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitBreakerState, CircuitStatus, Permit,
    Rejection,
};
pub use retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceFailure {
    #[error("circuit open for capability `{capability}` (retry after {retry_after_ms}ms)")]
    CircuitOpen {
        capability: CapabilityId,
        retry_after_ms: i64,
    },
    #[error("capability `{capability}` failed after {attempts} attempts: {last}")]
    Exhausted {
        capability: CapabilityId,
        attempts: u32,
        #[source]
        last: AgentError,
    },
    #[error(transparent)]
    Rejected(AgentError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Completed {
        response: AgentResponse,
        attempts: u32,
    },
    /// The caller's fallback stood in for the capability.
    Fallback {
        response: AgentResponse,
        cause: ResilienceFailure,
    },
}

impl Invocation {
    pub fn response(&self) -> &AgentResponse {
        match self {
            Invocation::Completed { response, .. } | Invocation::Fallback { response, .. } => {
                response
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Invocation::Fallback { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResilienceConfig {
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
    pub call_timeouts: BTreeMap<CapabilityId, Duration>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_millis(30_000),
            call_timeouts: BTreeMap::new(),
        }
    }
}

pub struct ResilienceLayer {
    config: ResilienceConfig,
    breakers: BreakerRegistry,
}

impl ResilienceLayer {
    pub fn new(config: ResilienceConfig, clock: Arc<dyn Clock>) -> Self {
        let breakers = BreakerRegistry::new(config.breaker, clock);
        Self { config, breakers }
    }

    pub fn snapshot(&self, capability: &CapabilityId) -> Option<CircuitBreakerState> {
        self.breakers.snapshot(capability)
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        self.breakers.snapshots()
    }

    fn call_timeout(&self, capability: &CapabilityId) -> Duration {
        self.config
            .call_timeouts
            .get(capability)
            .copied()
            .unwrap_or(self.config.call_timeout)
    }

    /// Invoke `adapter` for `capability`. Transient failures are retried
    /// with backoff; an open circuit or exhausted retries yield `fallback`
    /// when one is given. Non-transient errors are returned immediately.
    pub fn invoke(
        &self,
        capability: &CapabilityId,
        adapter: Arc<dyn AgentAdapter>,
        request: &AgentRequest,
        fallback: Option<&AgentResponse>,
    ) -> Result<Invocation, ResilienceFailure> {
        let breaker = self.breakers.breaker(capability);
        let timeout = self.call_timeout(capability);
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if let Err(rejection) = breaker.try_acquire() {
                tracing::debug!(capability = %capability, "call short-circuited by open breaker");
                return degrade(
                    fallback,
                    ResilienceFailure::CircuitOpen {
                        capability: capability.clone(),
                        retry_after_ms: rejection.retry_after_ms,
                    },
                );
            }

            match call_with_timeout(capability, adapter.clone(), request, timeout) {
                Ok(response) => {
                    breaker.record_success();
                    return Ok(Invocation::Completed {
                        response,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_transient() => {
                    breaker.record_failure();
                    tracing::warn!(
                        capability = %capability,
                        attempt,
                        error = %err,
                        "transient agent failure"
                    );
                    if attempt >= max_attempts {
                        return degrade(
                            fallback,
                            ResilienceFailure::Exhausted {
                                capability: capability.clone(),
                                attempts: attempt,
                                last: err,
                            },
                        );
                    }
                    let delay = self.config.retry.jittered_backoff(attempt);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(err) => {
                    // The capability answered, so it counts as reachable.
                    breaker.record_success();
                    return Err(ResilienceFailure::Rejected(err));
                }
            }
        }
    }
}

fn degrade(
    fallback: Option<&AgentResponse>,
    cause: ResilienceFailure,
) -> Result<Invocation, ResilienceFailure> {
    match fallback {
        Some(response) => Ok(Invocation::Fallback {
            response: response.clone(),
            cause,
        }),
        None => Err(cause),
    }
}

/// Runs the adapter on a worker thread and stops waiting after `timeout`.
/// A call that outlives the timeout finishes in the background and its
/// result is discarded.
fn call_with_timeout(
    capability: &CapabilityId,
    adapter: Arc<dyn AgentAdapter>,
    request: &AgentRequest,
    timeout: Duration,
) -> Result<AgentResponse, AgentError> {
    let (tx, rx) = mpsc::channel();
    let request = request.clone();
    let spawned = thread::Builder::new()
        .name(format!("agent-{capability}"))
        .spawn(move || {
            let _ = tx.send(adapter.invoke(&request));
        });
    if let Err(err) = spawned {
        return Err(AgentError::Unavailable {
            capability: capability.clone(),
            message: format!("failed to spawn agent worker: {err}"),
        });
    }

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(AgentError::Timeout {
            capability: capability.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(AgentError::Unavailable {
            capability: capability.clone(),
            message: "agent worker exited without a response".to_string(),
        }),
    }
}
