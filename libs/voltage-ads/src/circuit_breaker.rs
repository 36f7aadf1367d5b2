//! Circuit breaker gating reads and writes at the hub boundary
//!
//! ```text
//!   ┌──────┐  failure_count >= threshold  ┌──────┐  recovery_timeout  ┌──────────┐
//!   │Closed│ ────────────────────────────▶│ Open │ ──────────────────▶│ HalfOpen │
//!   └──────┘                              └──────┘                    └──────────┘
//!      ▲                                      ▲         probe failed       │
//!      │                                      └────────────────────────────┤
//!      └───────────────────────────────────────────────────────────────────┘
//!                                   any success
//! ```
//!
//! Reconnection attempts are not gated here; they are throttled by the
//! reconnect backoff instead.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures before the breaker trips
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is allowed
    pub recovery_timeout: Duration,
    /// Calls permitted while half-open
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_requests: 1,
        }
    }
}

/// Consecutive-failure circuit breaker
///
/// Not internally synchronized; the hub keeps it inside its state lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_count: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_count: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_time(&self) -> Option<Instant> {
        self.last_failure_time
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Closed means healthy
    pub fn is_healthy(&self) -> bool {
        self.state == CircuitState::Closed
    }

    /// Record a successful call
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!("Circuit breaker closed after successful call");
        }
        self.failure_count = 0;
        self.state = CircuitState::Closed;
        self.half_open_count = 0;
    }

    /// Record a failed call
    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);

        match self.state {
            CircuitState::HalfOpen => {
                warn!("Circuit breaker probe failed, reopening");
                self.state = CircuitState::Open;
                self.half_open_count = 0;
            },
            CircuitState::Closed if self.failure_count >= self.config.failure_threshold => {
                warn!(
                    "Circuit breaker tripped after {} failures",
                    self.failure_count
                );
                self.state = CircuitState::Open;
            },
            _ => {},
        }
    }

    /// Whether a call may be attempted now
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// and lets the call through; further half-open calls consume the probe
    /// budget.
    pub fn can_execute(&mut self) -> bool {
        self.can_execute_at(Instant::now())
    }

    pub fn can_execute_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = self
                    .last_failure_time
                    .is_some_and(|t| now.saturating_duration_since(t) > self.config.recovery_timeout);
                if recovered {
                    debug!("Circuit breaker half-open, allowing probe");
                    self.state = CircuitState::HalfOpen;
                    self.half_open_count = 0;
                }
                recovered
            },
            CircuitState::HalfOpen => {
                if self.half_open_count < self.config.half_open_requests {
                    self.half_open_count += 1;
                    true
                } else {
                    false
                }
            },
        }
    }
}
