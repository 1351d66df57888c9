//! Per-backend circuit breaker.
//!
//! Three states: closed, open, half-open. Failures within one counter
//! window trip the breaker open; after `open_timeout` a probe is admitted
//! and `half_open_successes` consecutive successes close it again.
//! Context cancellation is never recorded, and callers record 4xx
//! responses as successes: a backend that answers, even unhelpfully, is
//! not a failing backend.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use polestar_core::CircuitConfig;

/// What a finished call should count as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone, Copy, Debug)]
enum State {
    Closed { failures: u32, window_start: Instant },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Closed { .. } => "closed",
            State::Open { .. } => "open",
            State::HalfOpen { .. } => "half-open",
        }
    }
}

pub struct CircuitBreaker {
    label: String,
    half_open_successes: u32,
    open_timeout: Duration,
    counter_reset: Duration,
    failure_threshold: u32,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(label: impl Into<String>, cfg: &CircuitConfig) -> Self {
        Self {
            label: label.into(),
            half_open_successes: cfg.half_open_successes.max(1),
            open_timeout: cfg.open_timeout,
            counter_reset: cfg.counter_reset,
            failure_threshold: cfg.failure_threshold.max(1),
            state: Mutex::new(State::Closed {
                failures: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Whether a call may be attempted. An open breaker whose timeout has
    /// elapsed admits the caller as a half-open probe.
    pub fn ready(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            State::Closed { .. } | State::HalfOpen { .. } => true,
            State::Open { since } => {
                if since.elapsed() >= self.open_timeout {
                    self.transition(&mut state, State::HalfOpen { successes: 0 });
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record the outcome of a finished call. Callers skip this entirely
    /// for cancelled calls.
    pub fn record(&self, outcome: Outcome) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match (*state, outcome) {
            (
                State::Closed {
                    mut failures,
                    mut window_start,
                },
                Outcome::Failure,
            ) => {
                if window_start.elapsed() >= self.counter_reset {
                    failures = 0;
                    window_start = Instant::now();
                }
                failures += 1;
                if failures >= self.failure_threshold {
                    self.transition(
                        &mut state,
                        State::Open {
                            since: Instant::now(),
                        },
                    );
                } else {
                    *state = State::Closed {
                        failures,
                        window_start,
                    };
                }
            }
            (State::Closed { .. }, Outcome::Success) => {}
            (State::HalfOpen { successes }, Outcome::Success) => {
                let successes = successes + 1;
                if successes >= self.half_open_successes {
                    self.transition(
                        &mut state,
                        State::Closed {
                            failures: 0,
                            window_start: Instant::now(),
                        },
                    );
                } else {
                    *state = State::HalfOpen { successes };
                }
            }
            (State::HalfOpen { .. }, Outcome::Failure) => {
                self.transition(
                    &mut state,
                    State::Open {
                        since: Instant::now(),
                    },
                );
            }
            // A call that started before the trip can still finish; it
            // must not re-close the breaker.
            (State::Open { .. }, _) => {}
        }
    }

    fn transition(&self, state: &mut State, to: State) {
        tracing::info!(
            backend = %self.label,
            from = state.name(),
            to = to.name(),
            "circuit state changed"
        );
        *state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(cfg: CircuitConfig) -> CircuitBreaker {
        CircuitBreaker::new("test", &cfg)
    }

    #[test]
    fn trips_open_after_threshold_failures() {
        let cb = breaker(CircuitConfig {
            failure_threshold: 3,
            open_timeout: Duration::from_secs(60),
            counter_reset: Duration::from_secs(60),
            ..Default::default()
        });

        assert!(cb.ready());
        cb.record(Outcome::Failure);
        cb.record(Outcome::Failure);
        assert!(cb.ready());
        cb.record(Outcome::Failure);
        assert!(!cb.ready());
    }

    #[test]
    fn successes_do_not_trip() {
        let cb = breaker(CircuitConfig {
            failure_threshold: 2,
            ..Default::default()
        });
        for _ in 0..100 {
            cb.record(Outcome::Success);
        }
        assert!(cb.ready());
    }

    #[test]
    fn open_admits_probe_after_timeout_and_closes_on_successes() {
        let cb = breaker(CircuitConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_millis(10),
            half_open_successes: 2,
            counter_reset: Duration::from_secs(60),
            ..Default::default()
        });

        cb.record(Outcome::Failure);
        assert!(!cb.ready());
        std::thread::sleep(Duration::from_millis(20));
        // Timeout elapsed: the next readiness check is the half-open probe.
        assert!(cb.ready());
        cb.record(Outcome::Success);
        assert!(cb.ready());
        cb.record(Outcome::Success);
        // Fully closed again.
        assert!(cb.ready());
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(CircuitConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_millis(10),
            half_open_successes: 2,
            counter_reset: Duration::from_secs(60),
            ..Default::default()
        });

        cb.record(Outcome::Failure);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.ready()); // half-open probe admitted
        cb.record(Outcome::Failure);
        // Reopened; the fresh open window blocks again.
        assert!(!cb.ready());
    }

    #[test]
    fn failure_counter_resets_after_quiet_window() {
        let cb = breaker(CircuitConfig {
            failure_threshold: 2,
            counter_reset: Duration::from_millis(10),
            open_timeout: Duration::from_secs(60),
            ..Default::default()
        });

        cb.record(Outcome::Failure);
        std::thread::sleep(Duration::from_millis(20));
        // The stale window is discarded, so this is failure one of a new
        // window rather than the tripping second failure.
        cb.record(Outcome::Failure);
        assert!(cb.ready());
    }
}
