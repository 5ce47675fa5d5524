use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Health of one provider as tracked by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderState {
    pub consecutive_failures: u32,
    pub circuit: CircuitState,
    pub opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            circuit: CircuitState::Closed,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit: full retry budget.
    Allowed,
    /// Open window elapsed: one probing attempt.
    Probe,
    /// Circuit open, or a probe is already running.
    Rejected { remaining: Duration },
}

pub type Transition = (CircuitState, CircuitState);

/// Per-provider breaker. All reads and writes go through one mutex so
/// concurrent callers never race on the counter or the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    open_duration: Duration,
    state: Mutex<ProviderState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_duration: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_duration,
            state: Mutex::new(ProviderState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> ProviderState {
        self.lock().clone()
    }

    pub fn admit(&self, now: Instant) -> (Admission, Option<Transition>) {
        let mut state = self.lock();
        match state.circuit {
            CircuitState::Closed => (Admission::Allowed, None),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened))
                    .unwrap_or(self.open_duration);
                if elapsed >= self.open_duration {
                    state.circuit = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    (
                        Admission::Probe,
                        Some((CircuitState::Open, CircuitState::HalfOpen)),
                    )
                } else {
                    (
                        Admission::Rejected {
                            remaining: self.open_duration - elapsed,
                        },
                        None,
                    )
                }
            }
            CircuitState::HalfOpen if state.probe_in_flight => (
                Admission::Rejected {
                    remaining: Duration::ZERO,
                },
                None,
            ),
            CircuitState::HalfOpen => {
                state.probe_in_flight = true;
                (Admission::Probe, None)
            }
        }
    }

    pub fn record_success(&self) -> Option<Transition> {
        let mut state = self.lock();
        let previous = state.circuit;
        *state = ProviderState::default();
        (previous != CircuitState::Closed).then_some((previous, CircuitState::Closed))
    }

    /// Counts one exhausted or fatal provider failure. A failed probe re-opens
    /// the circuit with a fresh timestamp.
    pub fn record_failure(&self, now: Instant) -> Option<Transition> {
        let mut state = self.lock();
        let previous = state.circuit;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.probe_in_flight = false;

        let open = match previous {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => state.consecutive_failures >= self.threshold,
            CircuitState::Open => false,
        };
        if open {
            state.circuit = CircuitState::Open;
            state.opened_at = Some(now);
            return Some((previous, CircuitState::Open));
        }
        None
    }
}
