//! Per-collaborator circuit breaker.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::ClientError;

/// Breaker thresholds.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Closed / open / half-open breaker guarding one collaborator.
///
/// While open, calls fail fast with `CircuitOpen`. After the cooldown the
/// breaker goes half-open and lets probes through; one success closes it,
/// one failure reopens it.
pub struct CircuitBreaker {
    collaborator: String,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for the named collaborator.
    pub fn new(collaborator: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            collaborator: collaborator.into(),
            config,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Checks whether a call may proceed.
    pub fn check(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { until } => {
                if Instant::now() >= until {
                    *state = State::HalfOpen;
                    tracing::info!(collaborator = %self.collaborator, "breaker half-open");
                    Ok(())
                } else {
                    metrics::counter!("breaker_rejections_total").increment(1);
                    Err(ClientError::CircuitOpen {
                        collaborator: self.collaborator.clone(),
                    })
                }
            }
        }
    }

    /// Records a successful call, closing the breaker.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, State::Closed { consecutive_failures: 0 }) {
            tracing::info!(collaborator = %self.collaborator, "breaker closed");
        }
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    /// Records a transient failure; opens the breaker at the threshold or on
    /// a failed half-open probe.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    self.open(&mut state);
                } else {
                    *state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            State::HalfOpen => self.open(&mut state),
            State::Open { .. } => {}
        }
    }

    fn open(&self, state: &mut State) {
        tracing::warn!(
            collaborator = %self.collaborator,
            cooldown_secs = self.config.cooldown.as_secs(),
            "breaker opened"
        );
        metrics::counter!("breaker_opens_total").increment(1);
        *state = State::Open {
            until: Instant::now() + self.config.cooldown,
        };
    }
}
