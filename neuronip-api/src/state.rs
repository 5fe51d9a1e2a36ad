//! Composition root wiring every control-plane component together.
//!
//! [`ControlPlane`] owns one instance of each component, registers their
//! cleanup as shutdown hooks, and builds the HTTP router with the admission
//! middleware stack applied in order: shutdown gate, rate limiter, route
//! timeout.

use axum::{middleware::from_fn_with_state, routing::get, Router};
use neuronip_core::Context;
use serde_json::Value;
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    handlers::control::{self, ControlState},
    observability::health::{liveness_handler, readiness_handler, HealthState},
    performance::{CacheConfig, CacheError, TtlCache},
    resilience::{
        drain::DEFAULT_POLL_INTERVAL, route_timeout_middleware, track_requests, CircuitBreaker,
        CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry, ConnectionDrainer,
        QueryTimeoutManager, RequestGate, RequestTracker, Retrier, RetryBudget, RetryConfig,
        RetryError, ShutdownError, ShutdownManager, TimeoutProfiles,
    },
    security::{rate_limit_middleware, RateLimitConfig, RateLimiter},
};

/// Breaker name for the NeuronAgent dependency
pub const NEURON_AGENT: &str = "neuron_agent";
/// Breaker name for the NeuronMCP dependency
pub const NEURON_MCP: &str = "neuron_mcp";

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    /// Breaker profile per dependency name
    pub breakers: BTreeMap<String, CircuitBreakerConfig>,
    /// Profile for dependencies without their own entry
    pub default_breaker: CircuitBreakerConfig,
    pub timeouts: TimeoutProfiles,
    /// Retry policy for dependency calls
    pub retry: RetryConfig,
    /// Retries allowed per minute across all dependency calls
    pub retry_budget: u32,
    pub shutdown_timeout: Duration,
    pub drain_timeout: Duration,
    pub drain_poll_interval: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        let mut breakers = BTreeMap::new();
        breakers.insert(NEURON_AGENT.to_string(), CircuitBreakerConfig::neuron_agent());
        breakers.insert(NEURON_MCP.to_string(), CircuitBreakerConfig::neuron_mcp());

        Self {
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            breakers,
            default_breaker: CircuitBreakerConfig::default(),
            timeouts: TimeoutProfiles::default(),
            retry: RetryConfig::exponential(3),
            retry_budget: 100,
            shutdown_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(25),
            drain_poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Every control-plane component, shared behind `Arc`s
pub struct ControlPlane {
    cache: Arc<TtlCache<Value>>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    breaker_profiles: BTreeMap<String, CircuitBreakerConfig>,
    default_breaker: CircuitBreakerConfig,
    timeouts: Arc<QueryTimeoutManager>,
    retrier: Retrier,
    shutdown: Arc<ShutdownManager>,
    drainer: Arc<ConnectionDrainer>,
    tracker: RequestTracker,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig) -> Result<Self, CacheError> {
        config.cache.validate()?;

        let breakers = Arc::new(CircuitBreakerRegistry::new());
        for (name, profile) in &config.breakers {
            breakers.get_or_create(name, profile.clone());
        }

        let plane = Self {
            cache: Arc::new(TtlCache::new(config.cache)),
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            breakers,
            breaker_profiles: config.breakers,
            default_breaker: config.default_breaker,
            timeouts: Arc::new(QueryTimeoutManager::new(config.timeouts)),
            retrier: Retrier::new(config.retry)
                .with_budget(Arc::new(RetryBudget::per_minute(config.retry_budget))),
            shutdown: Arc::new(ShutdownManager::new(config.shutdown_timeout)),
            drainer: Arc::new(ConnectionDrainer::with_poll_interval(
                config.drain_timeout,
                config.drain_poll_interval,
            )),
            tracker: RequestTracker::new(),
        };
        plane.register_hooks();

        Ok(plane)
    }

    fn register_hooks(&self) {
        let drainer = self.drainer.clone();
        let tracker = self.tracker.clone();
        self.shutdown.register_hook("drain-requests", move |ctx: Context| {
            let drainer = drainer.clone();
            let tracker = tracker.clone();
            async move {
                drainer.drain(&ctx, || tracker.active()).await?;
                Ok(())
            }
        });

        let breakers = self.breakers.clone();
        self.shutdown.register_hook("flush-circuit-breakers", move |_ctx: Context| {
            let breakers = breakers.clone();
            async move {
                breakers.reset_all();
                Ok(())
            }
        });

        let cache = self.cache.clone();
        self.shutdown.register_hook("stop-cache-sweep", move |_ctx: Context| {
            let cache = cache.clone();
            async move {
                cache.stop().await;
                Ok(())
            }
        });

        let limiter = self.limiter.clone();
        self.shutdown.register_hook("stop-rate-limit-cleanup", move |_ctx: Context| {
            let limiter = limiter.clone();
            async move {
                limiter.stop().await;
                Ok(())
            }
        });
    }

    /// Start the background sweeps. They end with `ctx` or at shutdown.
    pub fn start(&self, ctx: &Context) {
        self.cache.start(ctx);
        self.limiter.start(ctx);
        info!(
            breakers = self.breakers.len(),
            hooks = self.shutdown.hook_names().len(),
            "Control plane started"
        );
    }

    pub fn cache(&self) -> &Arc<TtlCache<Value>> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Breaker for `dependency`, created from its configured profile or the
    /// default profile on first use
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        let profile = self
            .breaker_profiles
            .get(dependency)
            .unwrap_or(&self.default_breaker)
            .clone();
        self.breakers.get_or_create(dependency, profile)
    }

    /// Call `dependency` through its breaker, retrying while the breaker
    /// refuses the call. Failures of `op` itself are not retried. Retries
    /// draw on the plane-wide budget and stop when `ctx` ends.
    pub async fn call_dependency<F, Fut, T, E>(
        &self,
        ctx: &Context,
        dependency: &str,
        op: F,
    ) -> Result<T, RetryError<CircuitBreakerError<E>>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker(dependency);
        let breaker = breaker.as_ref();
        let op = &op;
        self.retrier.run(ctx, move || breaker.call(op)).await
    }

    pub fn retrier(&self) -> &Retrier {
        &self.retrier
    }

    pub fn timeouts(&self) -> &Arc<QueryTimeoutManager> {
        &self.timeouts
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    pub fn drainer(&self) -> &Arc<ConnectionDrainer> {
        &self.drainer
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Wrap `router` in the admission stack. The shutdown gate runs first, so
    /// requests refused during shutdown consume no rate-limit quota.
    pub fn protect(&self, router: Router) -> Router {
        router
            .layer(from_fn_with_state(self.timeouts.clone(), route_timeout_middleware))
            .layer(from_fn_with_state(self.limiter.clone(), rate_limit_middleware))
            .layer(from_fn_with_state(
                RequestGate::new(self.shutdown.clone(), self.tracker.clone()),
                track_requests,
            ))
    }

    /// Health probes plus the operator endpoints. Probes bypass the
    /// admission stack so readiness stays observable during shutdown.
    pub fn router(&self) -> Router {
        let health = Router::new()
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .with_state(HealthState::new(self.shutdown.clone(), self.breakers.clone()));

        let operator = self.protect(control::routes(ControlState {
            cache: self.cache.clone(),
            breakers: self.breakers.clone(),
        }));

        Router::new()
            .merge(health)
            .merge(operator)
            .layer(TraceLayer::new_for_http())
    }

    /// Run every shutdown hook once.
    pub async fn shutdown(&self, ctx: &Context) -> Result<(), ShutdownError> {
        info!(in_flight = self.tracker.active(), "Shutting down control plane");
        let result = self.shutdown.shutdown(ctx).await;
        match &result {
            Ok(()) => info!("Control plane shut down cleanly"),
            Err(err) => warn!(error = %err, "Control plane shutdown incomplete"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;

    fn plane() -> ControlPlane {
        ControlPlane::new(ControlPlaneConfig {
            drain_timeout: Duration::from_millis(200),
            drain_poll_interval: Duration::from_millis(10),
            ..ControlPlaneConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_registers_preset_breakers_and_hooks() {
        let plane = plane();

        assert_eq!(plane.breakers().len(), 2);
        assert_eq!(
            plane.breaker(NEURON_AGENT).config(),
            &CircuitBreakerConfig::neuron_agent()
        );
        assert_eq!(
            plane.shutdown_manager().hook_names(),
            vec![
                "drain-requests",
                "flush-circuit-breakers",
                "stop-cache-sweep",
                "stop-rate-limit-cleanup",
            ]
        );
    }

    #[test]
    fn test_unknown_dependency_uses_default_profile() {
        let plane = plane();
        let breaker = plane.breaker("warehouse");
        assert_eq!(breaker.config(), &CircuitBreakerConfig::default());
        assert_eq!(plane.breakers().len(), 3);
    }

    #[test]
    fn test_rejects_invalid_cache_config() {
        let config = ControlPlaneConfig {
            cache: CacheConfig {
                max_size: 0,
                ..CacheConfig::default()
            },
            ..ControlPlaneConfig::default()
        };
        assert!(ControlPlane::new(config).is_err());
    }

    #[tokio::test]
    async fn test_call_dependency_passes_through_results() {
        let plane = plane();
        let ctx = Context::background();

        let value = plane
            .call_dependency(&ctx, NEURON_MCP, || async { Ok::<_, &str>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = plane
            .call_dependency(&ctx, NEURON_MCP, || async { Err::<(), _>("bad input") })
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert!(matches!(err.into_last_error(), Some(CircuitBreakerError::Inner("bad input"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_dependency_waits_out_open_breaker_until_deadline() {
        let plane = plane();
        let breaker = plane.breaker(NEURON_AGENT);
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<(), _>("unreachable") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_secs(1));
        let invoked = std::sync::atomic::AtomicBool::new(false);

        let err = plane
            .call_dependency(&ctx, NEURON_AGENT, || async {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await
            .unwrap_err();

        match err {
            RetryError::Interrupted {
                reason,
                attempts,
                last_error,
            } => {
                assert_eq!(reason, neuronip_core::ContextError::DeadlineExceeded);
                assert_eq!(attempts, 1);
                assert!(matches!(last_error, Some(CircuitBreakerError::Open { .. })));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(plane.retrier().stats().retries, 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_breakers_and_drains() {
        let plane = plane();
        plane.start(&Context::background());

        let breaker = plane.breaker(NEURON_AGENT);
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<(), _>("unreachable") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        plane.shutdown(&Context::background()).await.unwrap();

        assert!(plane.shutdown_manager().is_shutting_down());
        assert!(plane.drainer().is_drained());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_reports_undrained_requests() {
        let plane = plane();
        let _in_flight = plane.tracker().track();

        let err = plane.shutdown(&Context::background()).await.unwrap_err();
        match err {
            ShutdownError::HookFailures(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].hook, "drain-requests");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
