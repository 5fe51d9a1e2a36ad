//! Retries with exponential backoff and jitter.
//!
//! A [`Retrier`] re-runs an operation while its error is [`Retryable`],
//! sleeping between attempts on the tokio timer. The wait ends early when the
//! caller's [`Context`] ends. An optional [`RetryBudget`], shared between
//! callers, caps how many retries may happen per window so a struggling
//! dependency does not receive a multiple of its normal traffic.
//!
//! # Example
//!
//! ```no_run
//! use neuronip_api::resilience::{
//!     retry::{retry, RetryConfig},
//!     CircuitBreaker, CircuitBreakerConfig,
//! };
//! use neuronip_core::Context;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new("neuron_agent", CircuitBreakerConfig::neuron_agent());
//!
//! let value = retry(&Context::background(), &RetryConfig::exponential(4), || {
//!     breaker.call(|| async { Ok::<_, std::io::Error>(42) })
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use neuronip_core::{system_clock, Context, ContextError, SharedClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::resilience::circuit_breaker::CircuitBreakerError;

/// Fraction of the backoff added or removed at random when jitter is on
const JITTER_FRACTION: f64 = 0.2;

/// Window over which a [`RetryBudget`] counts retries
pub const BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, the first call included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Spread each delay by up to 20% either way
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Short exponential backoff for calls on a request path
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (zero-based), without jitter.
    ///
    /// Grows as `initial_delay * multiplier^retry` and never exceeds
    /// `max_delay`. Multipliers below 1 are treated as 1.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        cap(secs, self.max_delay)
    }

    /// [`backoff`](Self::backoff) with jitter applied when enabled
    pub fn next_delay(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if !self.jitter {
            return delay;
        }

        let spread = rand::random::<f64>() * 2.0 - 1.0;
        cap(delay.as_secs_f64() * (1.0 + JITTER_FRACTION * spread), self.max_delay)
    }
}

fn cap(secs: f64, max: Duration) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    if secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(secs)
}

/// Errors that say whether the failed operation is worth another attempt
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Minimum wait the error asks for before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Only breaker refusals are retried. A failure of the wrapped call has
/// already been counted by the breaker and is returned as is.
impl<E> Retryable for CircuitBreakerError<E> {
    fn is_retryable(&self) -> bool {
        self.is_unavailable()
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CircuitBreakerError::Open { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Why a retried operation gave up
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The operation failed with an error that is not retried
    #[error("operation failed: {error}")]
    NotRetryable { error: E, attempts: u32 },

    /// Every attempt failed
    #[error("retry failed after {attempts} attempts: {error}")]
    Exhausted { error: E, attempts: u32 },

    /// The shared retry budget refused another attempt
    #[error("retry budget exhausted after {attempts} attempts: {error}")]
    BudgetExhausted { error: E, attempts: u32 },

    /// The caller's context ended before the operation succeeded
    #[error("retry interrupted after {attempts} attempts: {reason}")]
    Interrupted {
        reason: ContextError,
        attempts: u32,
        last_error: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Number of times the operation ran
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::NotRetryable { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::BudgetExhausted { attempts, .. }
            | RetryError::Interrupted { attempts, .. } => *attempts,
        }
    }

    /// The error returned by the last attempt, if any attempt ran
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::NotRetryable { error, .. }
            | RetryError::Exhausted { error, .. }
            | RetryError::BudgetExhausted { error, .. } => Some(error),
            RetryError::Interrupted { last_error, .. } => last_error.as_ref(),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::NotRetryable { error, .. }
            | RetryError::Exhausted { error, .. }
            | RetryError::BudgetExhausted { error, .. } => Some(error),
            RetryError::Interrupted { last_error, .. } => last_error,
        }
    }
}

struct BudgetWindow {
    started: Instant,
    spent: u32,
}

/// Caps retries per fixed window across every caller sharing the budget.
/// First attempts never draw on it.
pub struct RetryBudget {
    max_retries: u32,
    window: Duration,
    clock: SharedClock,
    state: Mutex<BudgetWindow>,
}

impl RetryBudget {
    /// Budget of `max_retries` per minute on the system clock
    pub fn per_minute(max_retries: u32) -> Self {
        Self::with_clock(max_retries, BUDGET_WINDOW, system_clock())
    }

    pub fn with_clock(max_retries: u32, window: Duration, clock: SharedClock) -> Self {
        let started = clock.now();
        Self {
            max_retries,
            window,
            clock,
            state: Mutex::new(BudgetWindow { started, spent: 0 }),
        }
    }

    /// Take one retry from the budget. Returns false when the current window
    /// is used up.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if now.saturating_duration_since(state.started) >= self.window {
            state.started = now;
            state.spent = 0;
        }

        if state.spent >= self.max_retries {
            return false;
        }
        state.spent += 1;
        true
    }

    /// Retries left in the current window
    pub fn remaining(&self) -> u32 {
        let now = self.clock.now();
        let state = self.state.lock();
        if now.saturating_duration_since(state.started) >= self.window {
            self.max_retries
        } else {
            self.max_retries.saturating_sub(state.spent)
        }
    }
}

#[derive(Debug, Default)]
struct RetryMetrics {
    attempts: AtomicU64,
    retries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    budget_exhausted: AtomicU64,
}

/// Retry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStats {
    pub attempts: u64,
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub budget_exhausted: u64,
}

/// Runs operations under one retry policy, an optional shared budget, and
/// lifetime counters
pub struct Retrier {
    config: RetryConfig,
    budget: Option<Arc<RetryBudget>>,
    metrics: RetryMetrics,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            budget: None,
            metrics: RetryMetrics::default(),
        }
    }

    pub fn with_budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            attempts: self.metrics.attempts.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            budget_exhausted: self.metrics.budget_exhausted.load(Ordering::Relaxed),
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts or budget, or `ctx` ends.
    pub async fn run<F, Fut, T, E>(&self, ctx: &Context, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        self.drive(ctx, op, E::is_retryable, E::retry_after).await
    }

    /// Like [`run`](Self::run), with the retry decision made by `is_retryable`
    pub async fn run_if<F, Fut, T, E, P>(
        &self,
        ctx: &Context,
        op: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.drive(ctx, op, is_retryable, |_| None).await
    }

    async fn drive<F, Fut, T, E, P, H>(
        &self,
        ctx: &Context,
        mut op: F,
        is_retryable: P,
        retry_after: H,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        H: Fn(&E) -> Option<Duration>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = None;

        loop {
            if let Some(reason) = ctx.err() {
                return Err(self.give_up(RetryError::Interrupted {
                    reason,
                    attempts,
                    last_error: last_error.take(),
                }));
            }

            attempts += 1;
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
            counter!("retry_attempts_total").increment(1);

            let error = match op().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "operation succeeded after retrying");
                    }
                    self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !is_retryable(&error) {
                return Err(self.give_up(RetryError::NotRetryable { error, attempts }));
            }
            if attempts >= max_attempts {
                warn!(attempts, "retry attempts exhausted");
                return Err(self.give_up(RetryError::Exhausted { error, attempts }));
            }
            if let Some(budget) = &self.budget {
                if !budget.try_acquire() {
                    warn!(attempts, "retry budget exhausted");
                    self.metrics.budget_exhausted.fetch_add(1, Ordering::Relaxed);
                    counter!("retry_budget_exhausted_total").increment(1);
                    return Err(self.give_up(RetryError::BudgetExhausted { error, attempts }));
                }
            }

            let delay = self
                .config
                .next_delay(attempts - 1)
                .max(retry_after(&error).unwrap_or_default())
                .min(self.config.max_delay);
            last_error = Some(error);

            debug!(attempt = attempts, ?delay, "retrying after failure");
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            counter!("retries_total").increment(1);

            if let Err(reason) = ctx.run(sleep(delay)).await {
                return Err(self.give_up(RetryError::Interrupted {
                    reason,
                    attempts,
                    last_error: last_error.take(),
                }));
            }
        }
    }

    fn give_up<E>(&self, err: RetryError<E>) -> RetryError<E> {
        self.metrics.failures.fetch_add(1, Ordering::Relaxed);
        err
    }
}

/// Retry `op` under `config` with no budget
pub async fn retry<F, Fut, T, E>(
    ctx: &Context,
    config: &RetryConfig,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    Retrier::new(config.clone()).run(ctx, op).await
}
