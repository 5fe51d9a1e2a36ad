//! Resilience patterns for the NeuronIP API.
//!
//! - **Circuit Breaker**: isolates a failing downstream dependency by
//!   rejecting calls to it for a cooldown period
//! - **Timeout**: per-route request deadlines and clamped query deadlines
//! - **Graceful Shutdown**: runs cleanup hooks concurrently under one deadline
//!   and stops admitting requests once shutdown starts
//! - **Drain**: waits for in-flight requests to finish
//! - **Retry**: exponential backoff with jitter under a shared retry budget
//!
//! # Example
//!
//! ```no_run
//! use neuronip_api::resilience::{
//!     circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
//!     timeout::QueryTimeoutManager,
//! };
//! use neuronip_core::Context;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new("neuron_mcp", CircuitBreakerConfig::neuron_mcp());
//! let timeouts = QueryTimeoutManager::default();
//! let (ctx, _cancel) = timeouts.with_timeout(&Context::background(), Duration::from_secs(5));
//!
//! let result = breaker
//!     .call(|| async {
//!         ctx.run(async { 42 }).await
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod drain;
pub mod retry;
pub mod shutdown;
pub mod timeout;

// Re-export commonly used types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState,
};
pub use drain::{ConnectionDrainer, DrainError};
pub use retry::{retry, Retrier, RetryBudget, RetryConfig, RetryError, RetryStats, Retryable};
pub use shutdown::{
    track_requests, HookFailure, RequestGate, RequestGuard, RequestTracker, ShutdownError,
    ShutdownManager, ShutdownSignal,
};
pub use timeout::{
    default_route_rules, route_timeout_middleware, QueryBounds, QueryTimeoutManager,
    RequestDeadline, RouteClass, RouteRule, TimeoutProfiles,
};
