//! Per-gear circuit breaker.
//!
//! Failures are tracked in a sliding window per gear id. The circuit opens
//! when the window fills to the threshold, transitions lazily to half-open
//! once the cooldown elapses (evaluated on read), and closes again after
//! the configured number of probe successes. A failed probe reopens the
//! circuit and resets the window to a single fresh timestamp.
//!
//! State lives in process memory and is lost on restart; recovery rebuilds
//! what it needs from job history.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::config::CircuitBreakerConfig;

/// Observable circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct GearCircuit {
    status: CircuitStatus,
    failures: Vec<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    half_open_successes: u32,
}

impl GearCircuit {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: CircuitStatus::Closed,
            failures: Vec::new(),
            last_state_change: now,
            half_open_successes: 0,
        }
    }
}

/// Circuit breaker over all gear ids.
///
/// Owned by the scheduler and passed into workers; not a global, so tests
/// stay hermetic.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, GearCircuit>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failed execution for a gear.
    pub fn record_failure(&self, gear: &str) {
        self.record_failure_at(gear, Utc::now());
    }

    /// Record a failure at an explicit instant (tests).
    pub fn record_failure_at(&self, gear: &str, now: DateTime<Utc>) {
        let mut circuits = self.circuits.lock().expect("breaker lock");
        let circuit = circuits
            .entry(gear.to_owned())
            .or_insert_with(|| GearCircuit::new(now));

        match circuit.status {
            CircuitStatus::HalfOpen => {
                // A failed probe reopens with a fresh single-entry window.
                circuit.status = CircuitStatus::Open;
                circuit.failures = vec![now];
                circuit.last_state_change = now;
                circuit.half_open_successes = 0;
                tracing::warn!(gear, "circuit probe failed; reopening");
            }
            CircuitStatus::Closed | CircuitStatus::Open => {
                let window = Duration::milliseconds(self.config.window_ms);
                circuit
                    .failures
                    .retain(|t| now.signed_duration_since(*t) < window);
                circuit.failures.push(now);

                if circuit.status == CircuitStatus::Closed
                    && circuit.failures.len() >= self.config.failure_threshold
                {
                    circuit.status = CircuitStatus::Open;
                    circuit.last_state_change = now;
                    tracing::warn!(
                        gear,
                        failures = circuit.failures.len(),
                        "circuit opened"
                    );
                }
            }
        }
    }

    /// Record a successful execution for a gear.
    pub fn record_success(&self, gear: &str) {
        self.record_success_at(gear, Utc::now());
    }

    /// Record a success at an explicit instant (tests).
    pub fn record_success_at(&self, gear: &str, now: DateTime<Utc>) {
        let mut circuits = self.circuits.lock().expect("breaker lock");
        let Some(circuit) = circuits.get_mut(gear) else {
            return;
        };
        Self::lazy_half_open(&self.config, circuit, now);

        match circuit.status {
            CircuitStatus::Closed => {
                circuit.failures.clear();
            }
            CircuitStatus::HalfOpen => {
                circuit.half_open_successes = circuit.half_open_successes.saturating_add(1);
                if circuit.half_open_successes >= self.config.half_open_successes_to_close {
                    circuit.status = CircuitStatus::Closed;
                    circuit.failures.clear();
                    circuit.last_state_change = now;
                    circuit.half_open_successes = 0;
                    tracing::info!(gear, "circuit closed after successful probe");
                }
            }
            CircuitStatus::Open => {}
        }
    }

    /// Current state; `open -> half_open` transitions lazily here once the
    /// cooldown has elapsed.
    pub fn state(&self, gear: &str) -> CircuitStatus {
        self.state_at(gear, Utc::now())
    }

    /// State at an explicit instant (tests).
    pub fn state_at(&self, gear: &str, now: DateTime<Utc>) -> CircuitStatus {
        let mut circuits = self.circuits.lock().expect("breaker lock");
        match circuits.get_mut(gear) {
            Some(circuit) => {
                Self::lazy_half_open(&self.config, circuit, now);
                circuit.status
            }
            None => CircuitStatus::Closed,
        }
    }

    /// Whether executions for this gear should be rejected right now.
    pub fn is_open(&self, gear: &str) -> bool {
        self.is_open_at(gear, Utc::now())
    }

    /// Rejection check at an explicit instant (tests).
    pub fn is_open_at(&self, gear: &str, now: DateTime<Utc>) -> bool {
        self.state_at(gear, now) == CircuitStatus::Open
    }

    /// Failures currently in the window (observability, tests).
    pub fn failure_count(&self, gear: &str) -> usize {
        self.circuits
            .lock()
            .expect("breaker lock")
            .get(gear)
            .map(|c| c.failures.len())
            .unwrap_or(0)
    }

    fn lazy_half_open(
        config: &CircuitBreakerConfig,
        circuit: &mut GearCircuit,
        now: DateTime<Utc>,
    ) {
        if circuit.status == CircuitStatus::Open {
            let cooldown = Duration::milliseconds(config.cooldown_ms);
            if now.signed_duration_since(circuit.last_state_change) >= cooldown {
                circuit.status = CircuitStatus::HalfOpen;
                circuit.half_open_successes = 0;
                circuit.last_state_change = now;
            }
        }
    }
}
