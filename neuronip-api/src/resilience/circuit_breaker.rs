//! Circuit Breaker implementation for isolating slow or failing dependencies.
//!
//! A circuit breaker monitors consecutive failures of calls to one downstream
//! dependency and, once they reach a threshold, rejects further calls for a
//! cooldown period so the dependency has time to recover.
//!
//! # States
//!
//! - **Closed**: Normal operation. Each failure increments the consecutive
//!   failure count and each success resets it. When `reset_interval` passes
//!   without a failure, the count decays to zero.
//! - **Open**: Calls are rejected without invoking the wrapped function. The
//!   first call after `timeout` has elapsed moves the breaker to half-open.
//! - **HalfOpen**: Up to `max_requests` trial calls run concurrently. Any
//!   failure reopens the breaker; `success_threshold` consecutive successes
//!   close it.
//!
//! State is guarded by one mutex per breaker. The wrapped call always runs
//! outside the lock. Every transition starts a new generation, and outcomes
//! of calls admitted under an earlier generation are discarded.
//!
//! # Example
//!
//! ```no_run
//! use neuronip_api::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new("neuron_agent", CircuitBreakerConfig::neuron_agent());
//!
//! match breaker.call(|| async { Ok::<_, std::io::Error>(42) }).await {
//!     Ok(result) => println!("Success: {}", result),
//!     Err(e) if e.is_unavailable() => eprintln!("Dependency unavailable: {}", e),
//!     Err(e) => eprintln!("Call failed: {}", e),
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::counter;
use neuronip_core::{system_clock, SharedClock};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Too many failures, requests are rejected
    Open,
    /// Testing if the dependency has recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open state to close circuit
    pub success_threshold: u32,
    /// Time to wait before transitioning from open to half-open
    pub timeout: Duration,
    /// Maximum number of concurrent trial requests in half-open state
    pub max_requests: u32,
    /// Failure-free period after which the closed-state failure count decays
    /// to zero. Zero disables decay.
    pub reset_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            max_requests: 3,
            reset_interval: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Profile for the NeuronAgent service: trips sooner and probes again
    /// sooner.
    pub fn neuron_agent() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            max_requests: 2,
            reset_interval: Duration::from_secs(30),
        }
    }

    /// Profile for the NeuronMCP service: tolerates more failures and needs
    /// more successes to close.
    pub fn neuron_mcp() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(45),
            max_requests: 3,
            reset_interval: Duration::from_secs(45),
        }
    }

    fn normalized(self) -> Self {
        Self {
            failure_threshold: self.failure_threshold.max(1),
            success_threshold: self.success_threshold.max(1),
            max_requests: self.max_requests.max(1),
            ..self
        }
    }
}

/// Circuit breaker errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected
    #[error("Circuit breaker is open for {name}")]
    Open { name: String, retry_after: Duration },

    /// Request rejected (all half-open trial slots are taken)
    #[error("Circuit breaker rejected request for {name}")]
    Rejected { name: String },

    /// The wrapped call failed; the error is passed through unchanged
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// True when the call was refused by the breaker rather than failing in
    /// the dependency. Callers may retry these later.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CircuitBreakerError::Open { .. } | CircuitBreakerError::Rejected { .. }
        )
    }

    /// The wrapped call's error, if that is what this is.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(err) => Some(err),
            _ => None,
        }
    }
}

/// Metrics for circuit breaker
#[derive(Debug, Default)]
struct CircuitBreakerMetrics {
    failures: AtomicU64,
    successes: AtomicU64,
    opened_count: AtomicU64,
    closed_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl CircuitBreakerMetrics {
    fn record_outcome(&self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.successes.fetch_add(1, Ordering::Relaxed),
            Outcome::Failure => self.failures.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_transition(&self, to: CircuitState) {
        match to {
            CircuitState::Open => {
                self.opened_count.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::Closed => {
                self.closed_count.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn record_rejected(&self) {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

type Transition = (CircuitState, CircuitState);

type StateListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Internal state of the circuit breaker
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    half_open_in_flight: u32,
    generation: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_failure_at: None,
            half_open_in_flight: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> Option<Transition> {
        let from = self.state;
        if from == to {
            return None;
        }

        self.state = to;
        self.generation += 1;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        self.opened_at = match to {
            CircuitState::Open => Some(now),
            CircuitState::HalfOpen => self.opened_at,
            CircuitState::Closed => None,
        };

        Some((from, to))
    }

    fn decay(&mut self, now: Instant, reset_interval: Duration) {
        if reset_interval.is_zero() || self.consecutive_failures == 0 {
            return;
        }
        if let Some(last_failure) = self.last_failure_at {
            if now.saturating_duration_since(last_failure) >= reset_interval {
                self.consecutive_failures = 0;
            }
        }
    }
}

/// Admission ticket for one call. Recording an outcome consumes it; dropping
/// it without one (the caller's future was cancelled) only frees its
/// half-open slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    half_open: bool,
    settled: bool,
}

impl Permit<'_> {
    fn record(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.generation, self.half_open, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.half_open {
            self.breaker.release(self.generation);
        }
    }
}

/// Circuit breaker guarding one downstream dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    state: Mutex<BreakerState>,
    metrics: CircuitBreakerMetrics,
    listeners: RwLock<Vec<StateListener>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker on the system clock
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let name = name.into();
        debug!(breaker = %name, ?config, "creating circuit breaker");

        Self {
            name,
            config: config.normalized(),
            clock,
            state: Mutex::new(BreakerState::new()),
            metrics: CircuitBreakerMetrics::default(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker.
    ///
    /// An open breaker whose timeout has elapsed still reports `Open` until
    /// the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Register a callback invoked on every state transition with the
    /// breaker name, the previous state and the new state. Callbacks run
    /// after the state lock is released.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(callback));
    }

    /// Call a function with circuit breaker protection.
    ///
    /// Rejections never invoke `f`. Errors from `f` are recorded and returned
    /// as [`CircuitBreakerError::Inner`].
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire()?;

        match f().await {
            Ok(result) => {
                permit.record(Outcome::Success);
                Ok(result)
            }
            Err(e) => {
                permit.record(Outcome::Failure);
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Decide admission for one call.
    fn acquire<E>(&self) -> Result<Permit<'_>, CircuitBreakerError<E>> {
        let now = self.clock.now();
        let mut transition = None;

        let decision = {
            let mut state = self.state.lock();

            if state.state == CircuitState::Open {
                let opened_at = state.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.timeout {
                    transition = state.transition(CircuitState::HalfOpen, now);
                } else {
                    self.metrics.record_rejected();
                    return Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_after: self.config.timeout - elapsed,
                    });
                }
            }

            match state.state {
                CircuitState::Closed => {
                    state.decay(now, self.config.reset_interval);
                    Ok((state.generation, false))
                }
                CircuitState::HalfOpen if state.half_open_in_flight < self.config.max_requests => {
                    state.half_open_in_flight += 1;
                    Ok((state.generation, true))
                }
                _ => {
                    self.metrics.record_rejected();
                    Err(CircuitBreakerError::Rejected {
                        name: self.name.clone(),
                    })
                }
            }
        };

        self.publish(transition);

        let (generation, half_open) = decision?;
        Ok(Permit {
            breaker: self,
            generation,
            half_open,
            settled: false,
        })
    }

    /// Record the outcome of a call admitted under `generation`.
    fn record(&self, generation: u64, half_open: bool, outcome: Outcome) {
        self.metrics.record_outcome(outcome);
        let now = self.clock.now();

        let transition = {
            let mut state = self.state.lock();
            if state.generation != generation {
                debug!(breaker = %self.name, ?outcome, "discarding outcome from earlier breaker generation");
                return;
            }
            if half_open {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }

            match (state.state, outcome) {
                (CircuitState::Closed, Outcome::Success) => {
                    state.consecutive_failures = 0;
                    None
                }
                (CircuitState::Closed, Outcome::Failure) => {
                    state.decay(now, self.config.reset_interval);
                    state.consecutive_failures += 1;
                    state.last_failure_at = Some(now);
                    if state.consecutive_failures >= self.config.failure_threshold {
                        state.transition(CircuitState::Open, now)
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, Outcome::Success) => {
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= self.config.success_threshold {
                        state.transition(CircuitState::Closed, now)
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, Outcome::Failure) => {
                    state.last_failure_at = Some(now);
                    state.transition(CircuitState::Open, now)
                }
                (CircuitState::Open, _) => None,
            }
        };

        self.publish(transition);
    }

    /// Free a half-open slot whose call ended without an outcome.
    fn release(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let transition = {
            let mut state = self.state.lock();
            let transition = state.transition(CircuitState::Closed, self.clock.now());
            state.consecutive_failures = 0;
            state.last_failure_at = None;
            transition
        };

        info!(breaker = %self.name, "circuit breaker reset");
        self.publish(transition);
    }

    fn publish(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };

        self.metrics.record_transition(to);
        counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);

        match to {
            CircuitState::Open => warn!(breaker = %self.name, %from, "circuit breaker opened"),
            _ => info!(breaker = %self.name, %from, %to, "circuit breaker state changed"),
        }

        let listeners: Vec<StateListener> = self.listeners.read().clone();
        for listener in listeners {
            listener(&self.name, from, to);
        }
    }

    /// Snapshot of the breaker's state and lifetime counters
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            half_open_in_flight: state.half_open_in_flight,
            failures: self.metrics.failures.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            opened_count: self.metrics.opened_count.load(Ordering::Relaxed),
            closed_count: self.metrics.closed_count.load(Ordering::Relaxed),
            rejected_count: self.metrics.rejected_count.load(Ordering::Relaxed),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    pub failures: u64,
    pub successes: u64,
    pub opened_count: u64,
    pub closed_count: u64,
    pub rejected_count: u64,
}

/// Named breakers, one per downstream dependency
pub struct CircuitBreakerRegistry {
    clock: SharedClock,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            breakers: DashMap::new(),
        }
    }

    /// The breaker registered under `name`, created with `config` if absent.
    /// An existing breaker keeps its original configuration.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_clock(name, config, self.clock.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.value().clone())
    }

    /// Stats for every breaker, ordered by name
    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Names of breakers currently open
    pub fn open_breakers(&self) -> Vec<String> {
        let mut open: Vec<_> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().state() == CircuitState::Open)
            .map(|entry| entry.key().clone())
            .collect();
        open.sort();
        open
    }

    /// Return every breaker to closed
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.iter().map(|entry| entry.value().clone()).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
