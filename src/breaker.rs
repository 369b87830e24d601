//! Per-provider circuit breaker.
//!
//! ```text
//!            failures >= threshold                  reset_timeout elapsed
//!   CLOSED ─────────────────────────▶ OPEN ─────────────────────────────▶ HALF_OPEN
//!     ▲                                ▲                                     │
//!     │          probe fails           │                                     │
//!     │                                └─────────────────────────────────────┤
//!     │                     probe succeeds                                   │
//!     └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only consecutive failures count; any success while closed resets the
//! counter. While half-open exactly one probe is admitted and every other
//! caller is turned away as if the circuit were still open.
//!
//! The breaker is plain data behind a [`BreakerHandle`]. The lock is held
//! only for the state check and the state update, never across the call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ProviderConfig;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed.
    pub reset_timeout: Duration,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }
}

impl From<&ProviderConfig> for BreakerConfig {
    fn from(p: &ProviderConfig) -> Self {
        Self::new(p.failure_threshold, p.reset_timeout())
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Verdict for one prospective call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; call normally.
    Allowed,
    /// This call is the single half-open probe.
    Probe,
    /// Do not call the provider.
    Rejected,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Public-facing state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of one breaker for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: State,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: State::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
        }
    }

    /// Decide whether a call may go out, moving OPEN → HALF_OPEN when the
    /// reset timeout has elapsed.
    pub fn admit(&mut self) -> Admission {
        match self.state {
            State::Closed => Admission::Allowed,
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    self.state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    info!(circuit = %self.name, "circuit half-open; sending probe");
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            State::HalfOpen {
                probe_in_flight: true,
            } => Admission::Rejected,
            State::HalfOpen {
                probe_in_flight: false,
            } => {
                self.state = State::HalfOpen {
                    probe_in_flight: true,
                };
                Admission::Probe
            }
        }
    }

    pub fn record_success(&mut self, admission: Admission) {
        match (self.state, admission) {
            (State::Closed, _) => {
                self.consecutive_failures = 0;
            }
            (State::HalfOpen { .. }, Admission::Probe) => {
                self.consecutive_failures = 0;
                self.state = State::Closed;
                info!(circuit = %self.name, "circuit closed after successful probe");
            }
            // Late result of a call admitted before the circuit opened.
            _ => {}
        }
    }

    pub fn record_failure(&mut self, admission: Admission) {
        self.last_failure_at = Some(Utc::now());
        match (self.state, admission) {
            (State::Closed, _) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = State::Open {
                        opened_at: Instant::now(),
                    };
                    warn!(
                        circuit = %self.name,
                        failures = self.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "circuit opened after consecutive failures"
                    );
                }
            }
            (State::HalfOpen { .. }, Admission::Probe) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.state = State::Open {
                    opened_at: Instant::now(),
                };
                warn!(circuit = %self.name, "circuit re-opened after failed probe");
            }
            _ => {}
        }
    }

    /// The call finished with an outcome that says nothing about provider
    /// health (bad credentials, quota). Frees the probe slot if it held it.
    pub fn record_neutral(&mut self, admission: Admission) {
        if let (State::HalfOpen { .. }, Admission::Probe) = (self.state, admission) {
            self.state = State::HalfOpen {
                probe_in_flight: false,
            };
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let (state, retry_in_ms) = match self.state {
            State::Closed => (BreakerState::Closed, None),
            State::Open { opened_at } => {
                let remaining = self.config.reset_timeout.saturating_sub(opened_at.elapsed());
                (BreakerState::Open, Some(remaining.as_millis() as u64))
            }
            State::HalfOpen { .. } => (BreakerState::HalfOpen, None),
        };
        BreakerStatus {
            name: self.name.clone(),
            state,
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
            last_failure_at: self.last_failure_at,
            retry_in_ms,
        }
    }
}

/// Shared handle to one provider's breaker. Each provider gets its own lock.
#[derive(Debug, Clone)]
pub struct BreakerHandle(Arc<Mutex<CircuitBreaker>>);

impl BreakerHandle {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self(Arc::new(Mutex::new(CircuitBreaker::new(name, config))))
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreaker> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn admit(&self) -> Admission {
        self.lock().admit()
    }

    pub fn record_success(&self, admission: Admission) {
        self.lock().record_success(admission)
    }

    pub fn record_failure(&self, admission: Admission) {
        self.lock().record_failure(admission)
    }

    pub fn record_neutral(&self, admission: Admission) {
        self.lock().record_neutral(admission)
    }

    pub fn status(&self) -> BreakerStatus {
        self.lock().status()
    }
}
