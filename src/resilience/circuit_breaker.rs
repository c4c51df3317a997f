//! Per-capability circuit breaker.
//!
//! Closed -> Open after `failure_threshold` consecutive failures; Open ->
//! HalfOpen once `recovery_timeout_ms` has elapsed; HalfOpen admits exactly
//! one trial call whose outcome decides Closed or Open.

use crate::shared::clock::Clock;
use crate::shared::ids::CapabilityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitStatus::Closed => write!(f, "closed"),
            CircuitStatus::Open => write!(f, "open"),
            CircuitStatus::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub capability: CapabilityId,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<i64>,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Trial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    /// Milliseconds until a trial call may be admitted; zero while a trial is in flight.
    pub retry_after_ms: i64,
}

#[derive(Debug, Default)]
struct BreakerInner {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<i64>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    capability: CapabilityId,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("capability", &self.capability)
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(capability: CapabilityId, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            capability,
            config,
            clock,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn capability(&self) -> &CapabilityId {
        &self.capability
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // Every mutation leaves the fields consistent, so a poisoned lock is still usable.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn promote_if_recovered(&self, inner: &mut BreakerInner, now: i64) {
        if inner.status != CircuitStatus::Open {
            return;
        }
        let opened_at = inner.opened_at.unwrap_or(now);
        if now.saturating_sub(opened_at) >= self.config.recovery_timeout_ms {
            inner.status = CircuitStatus::HalfOpen;
            inner.trial_in_flight = false;
            info!(capability = %self.capability, "circuit breaker half-open");
        }
    }

    pub fn try_acquire(&self) -> Result<Permit, Rejection> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        self.promote_if_recovered(&mut inner, now);
        match inner.status {
            CircuitStatus::Closed => Ok(Permit::Normal),
            CircuitStatus::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(Permit::Trial)
            }
            CircuitStatus::HalfOpen => Err(Rejection { retry_after_ms: 0 }),
            CircuitStatus::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                Err(Rejection {
                    retry_after_ms: (opened_at + self.config.recovery_timeout_ms - now).max(0),
                })
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.status {
            CircuitStatus::Closed => inner.consecutive_failures = 0,
            CircuitStatus::HalfOpen => {
                info!(capability = %self.capability, "circuit breaker closed after trial call");
                *inner = BreakerInner::default();
            }
            CircuitStatus::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        match inner.status {
            CircuitStatus::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        capability = %self.capability,
                        failures = inner.consecutive_failures,
                        "circuit breaker opening"
                    );
                    inner.status = CircuitStatus::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitStatus::HalfOpen => {
                warn!(capability = %self.capability, "circuit breaker re-opening after failed trial");
                inner.consecutive_failures += 1;
                inner.status = CircuitStatus::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
            }
            CircuitStatus::Open => {}
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        self.promote_if_recovered(&mut inner, now);
        CircuitBreakerState {
            capability: self.capability.clone(),
            status: inner.status,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: self.config.recovery_timeout_ms,
        }
    }
}

/// One breaker per capability, created on first use and shared by every workflow.
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Mutex<BTreeMap<CapabilityId, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn breaker(&self, capability: &CapabilityId) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(capability.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    capability.clone(),
                    self.config,
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn snapshot(&self, capability: &CapabilityId) -> Option<CircuitBreakerState> {
        let breaker = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(capability)
            .cloned();
        breaker.map(|breaker| breaker.state())
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect::<Vec<_>>();
        breakers.iter().map(|breaker| breaker.state()).collect()
    }
}
