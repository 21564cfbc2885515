//! Bounded exponential backoff with jitter.
//!
//! Every retried operation walks the same state machine:
//!
//! ```text
//! Attempting ──ok──────────────────────────▶ Success
//!     │
//!     ├─transient, retries left──▶ Backoff ──sleep──▶ Attempting
//!     │
//!     └─permanent, or no retries left──────▶ PermanentFailure
//! ```

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use futures::future::BoxFuture;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IngestionError, Result};

/// Delay parameters shared by all retried operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Add up to a quarter of the capped delay, uniformly at random
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Capped delay before retry number `attempt + 1`, without jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay before retry number `attempt + 1`: capped delay plus jitter in
    /// `[0, capped / 4]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let spread = capped.as_millis() as u64 / 4;
        let extra = rand::thread_rng().gen_range(0..=spread);
        capped + Duration::from_millis(extra)
    }
}

/// State of one retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Attempting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
}

/// A successful result and the retries it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    /// Failed attempts before the one that succeeded
    pub retries: u32,
    /// Backoff delays slept, in order
    pub delays: Vec<Duration>,
}

/// Runs fallible async operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    max_retries: u32,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, max_retries: u32) -> Self {
        Self { policy, max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts
    /// `max_retries` retries (`max_retries + 1` attempts in total).
    ///
    /// `op` receives the zero-based attempt number. Exhaustion is reported as
    /// [`IngestionError::RetriesExhausted`]; permanent errors are returned
    /// unchanged.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<Retried<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delays = Vec::new();
        let mut state = AttemptState::Attempting { attempt: 0 };

        loop {
            state = match state {
                AttemptState::Attempting { attempt } => {
                    match self.settle(operation, attempt, op(attempt).await, &mut delays) {
                        ControlFlow::Break(done) => return done,
                        ControlFlow::Continue(next) => next,
                    }
                }
                AttemptState::Backoff { attempt, delay } => {
                    tokio::time::sleep(delay).await;
                    delays.push(delay);
                    AttemptState::Attempting { attempt: attempt + 1 }
                }
            };
        }
    }

    /// Like [`RetryExecutor::run`], for operations that need mutable access
    /// to `target` on every attempt.
    pub async fn run_on<S, T>(
        &self,
        operation: &str,
        target: &mut S,
        op: for<'a> fn(&'a mut S) -> BoxFuture<'a, Result<T>>,
    ) -> Result<Retried<T>>
    where
        S: ?Sized,
    {
        let mut delays = Vec::new();
        let mut state = AttemptState::Attempting { attempt: 0 };

        loop {
            state = match state {
                AttemptState::Attempting { attempt } => {
                    let outcome = op(&mut *target).await;
                    match self.settle(operation, attempt, outcome, &mut delays) {
                        ControlFlow::Break(done) => return done,
                        ControlFlow::Continue(next) => next,
                    }
                }
                AttemptState::Backoff { attempt, delay } => {
                    tokio::time::sleep(delay).await;
                    delays.push(delay);
                    AttemptState::Attempting { attempt: attempt + 1 }
                }
            };
        }
    }

    /// Decide what follows an attempt.
    fn settle<T>(
        &self,
        operation: &str,
        attempt: u32,
        outcome: Result<T>,
        delays: &mut Vec<Duration>,
    ) -> ControlFlow<Result<Retried<T>>, AttemptState> {
        match outcome {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, retries = attempt, "Operation succeeded after retry");
                }
                ControlFlow::Break(Ok(Retried {
                    value,
                    retries: attempt,
                    delays: std::mem::take(delays),
                }))
            }
            Err(e) if e.is_transient() && attempt < self.max_retries => {
                let delay = self.policy.delay_for(attempt);
                warn!(
                    operation,
                    error = %e,
                    retry = attempt + 1,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                ControlFlow::Continue(AttemptState::Backoff { attempt, delay })
            }
            Err(e) if e.is_transient() => ControlFlow::Break(Err(IngestionError::RetriesExhausted {
                operation: operation.to_string(),
                attempts: attempt + 1,
                last: Box::new(e),
            })),
            Err(e) => ControlFlow::Break(Err(e)),
        }
    }
}
