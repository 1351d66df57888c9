//! Bounded scatter/gather fan-out.
//!
//! Runs one worker task per target, each bounded by a shared per-target
//! deadline and a request-scoped [`CancellationToken`]. Results flow
//! through a small channel consumed by the gather side; a failing worker
//! is simply absent from the sequence and never poisons it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::breaker::{CircuitBreaker, Outcome};

/// A worker error, classified by how the target's circuit breaker should
/// count it.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Transport-level failure: connect, read, or deadline. Counts
    /// against the breaker.
    #[error("{0}")]
    Fault(String),
    /// Application-level failure (4xx status, malformed body). The
    /// backend answered, so the breaker counts a success.
    #[error("{0}")]
    Benign(String),
}

impl WorkerError {
    fn outcome(&self) -> Outcome {
        match self {
            WorkerError::Fault(_) => Outcome::Failure,
            WorkerError::Benign(_) => Outcome::Success,
        }
    }
}

pub type WorkerResult<R> = Result<Option<R>, WorkerError>;

/// Fan-out over a fixed target set.
pub struct ScatterGather<T, R> {
    targets: Vec<(T, Option<Arc<CircuitBreaker>>)>,
    max_wait: Duration,
    rx: Option<mpsc::Receiver<R>>,
}

impl<T, R> ScatterGather<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new(targets: Vec<(T, Option<Arc<CircuitBreaker>>)>, max_wait: Duration) -> Self {
        Self {
            targets,
            max_wait,
            rx: None,
        }
    }

    /// Spawn one worker per ready target. Targets whose breaker is open
    /// are skipped and never appear in the output sequence.
    ///
    /// Each worker races `for_each` against the per-target deadline and
    /// the cancellation token; emission to the output also races
    /// cancellation, so a worker never blocks on a dead consumer.
    pub fn scatter<F, Fut>(&mut self, cancel: &CancellationToken, for_each: F)
    where
        F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = WorkerResult<R>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let max_wait = self.max_wait;

        for (target, breaker) in self.targets.drain(..) {
            if let Some(cb) = &breaker {
                if !cb.ready() {
                    tracing::debug!("skipping target with open circuit");
                    continue;
                }
            }

            let tx = tx.clone();
            let cancel = cancel.clone();
            let for_each = for_each.clone();
            tokio::spawn(async move {
                if cancel.is_cancelled() {
                    return;
                }

                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = tokio::time::timeout(max_wait, for_each(target)) => match res {
                        Ok(out) => out,
                        Err(_) => Err(WorkerError::Fault(format!(
                            "no result within {max_wait:?}"
                        ))),
                    },
                };

                match result {
                    Ok(out) => {
                        if let Some(cb) = &breaker {
                            cb.record(Outcome::Success);
                        }
                        if let Some(r) = out {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tx.send(r) => {}
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "failed to scatter on target");
                        if let Some(cb) = &breaker {
                            cb.record(err.outcome());
                        }
                    }
                }
            });
        }

        self.rx = Some(rx);
    }

    /// The gathered result sequence. Closes once every worker has
    /// finished; ordering between workers is arbitrary.
    pub fn gather(&mut self) -> mpsc::Receiver<R> {
        self.rx.take().unwrap_or_else(|| {
            let (_, rx) = mpsc::channel(1);
            rx
        })
    }
}
