//! Request and query deadlines.
//!
//! Requests are classified by path into one of four [`RouteClass`]es, each
//! with its own [`TimeoutProfiles`] duration. A [`RouteRule`] matches when every
//! one of its markers occurs in the path, anywhere (prefix, suffix, exact, or
//! interior). Rules are checked in order and the first match wins; a path
//! matching no rule gets [`RouteClass::Default`].
//!
//! Deadlines are cooperative: handlers receive a [`RequestDeadline`] extension
//! carrying a [`Context`] and are expected to pass it to downstream work. The
//! middleware drops the handler future in place when the deadline passes, so
//! no detached task outlives the request.
//!
//! # Example
//!
//! ```no_run
//! use neuronip_api::resilience::timeout::{QueryTimeoutManager, RouteClass, TimeoutProfiles};
//!
//! let manager = QueryTimeoutManager::new(TimeoutProfiles::default());
//! assert_eq!(manager.classify("/api/v1/warehouse/query"), RouteClass::Query);
//! assert_eq!(manager.classify("/api/v1/workflows/7/execute"), RouteClass::Workflow);
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use neuronip_core::{contains_marker, CancelHandle, Context, ContextError};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ApiError;

/// Request classes with distinct deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteClass {
    Default,
    Query,
    Workflow,
    Ingestion,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Default => "default",
            RouteClass::Query => "query",
            RouteClass::Workflow => "workflow",
            RouteClass::Ingestion => "ingestion",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deadline per route class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutProfiles {
    pub default: Duration,
    pub query: Duration,
    pub workflow: Duration,
    pub ingestion: Duration,
}

impl Default for TimeoutProfiles {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(30),
            query: Duration::from_secs(5 * 60),
            workflow: Duration::from_secs(60 * 60),
            ingestion: Duration::from_secs(10 * 60),
        }
    }
}

impl TimeoutProfiles {
    pub fn get(&self, class: RouteClass) -> Duration {
        match class {
            RouteClass::Default => self.default,
            RouteClass::Query => self.query,
            RouteClass::Workflow => self.workflow,
            RouteClass::Ingestion => self.ingestion,
        }
    }
}

/// Maps paths containing all of `markers` to `class`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub class: RouteClass,
    pub markers: Vec<String>,
}

impl RouteRule {
    pub fn new<I, S>(class: RouteClass, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            class,
            markers: markers.into_iter().map(Into::into).collect(),
        }
    }

    /// A rule without markers never matches.
    pub fn matches(&self, path: &str) -> bool {
        !self.markers.is_empty()
            && self
                .markers
                .iter()
                .all(|marker| contains_marker(path, marker))
    }
}

/// Route table used by [`QueryTimeoutManager::new`]
pub fn default_route_rules() -> Vec<RouteRule> {
    vec![
        RouteRule::new(RouteClass::Query, ["/warehouse/query"]),
        RouteRule::new(RouteClass::Query, ["/semantic/search"]),
        RouteRule::new(RouteClass::Query, ["/semantic/rag"]),
        RouteRule::new(RouteClass::Workflow, ["/workflows/", "/execute"]),
        RouteRule::new(RouteClass::Ingestion, ["/ingestion/"]),
    ]
}

/// Limits for database query timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryBounds {
    pub min: Duration,
    pub max: Duration,
    /// Queries slower than this are logged
    pub slow_query_threshold: Duration,
}

impl Default for QueryBounds {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(5 * 60),
            slow_query_threshold: Duration::from_secs(1),
        }
    }
}

/// Deadline attached to a request by [`route_timeout_middleware`]
#[derive(Debug, Clone)]
pub struct RequestDeadline {
    pub class: RouteClass,
    pub timeout: Duration,
    pub context: Context,
}

/// Derives deadline contexts for requests and queries
#[derive(Debug, Clone)]
pub struct QueryTimeoutManager {
    profiles: TimeoutProfiles,
    rules: Vec<RouteRule>,
    bounds: QueryBounds,
}

impl Default for QueryTimeoutManager {
    fn default() -> Self {
        Self::new(TimeoutProfiles::default())
    }
}

impl QueryTimeoutManager {
    pub fn new(profiles: TimeoutProfiles) -> Self {
        Self::with_rules(profiles, default_route_rules())
    }

    pub fn with_rules(profiles: TimeoutProfiles, rules: Vec<RouteRule>) -> Self {
        Self {
            profiles,
            rules,
            bounds: QueryBounds::default(),
        }
    }

    pub fn with_query_bounds(mut self, bounds: QueryBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn profiles(&self) -> &TimeoutProfiles {
        &self.profiles
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Child of `ctx` that expires after `timeout`. A zero timeout uses the
    /// default profile.
    pub fn with_timeout(&self, ctx: &Context, timeout: Duration) -> (Context, CancelHandle) {
        let timeout = if timeout.is_zero() {
            self.profiles.default
        } else {
            timeout
        };
        ctx.with_timeout(timeout)
    }

    pub fn classify(&self, path: &str) -> RouteClass {
        self.rules
            .iter()
            .find(|rule| rule.matches(path))
            .map_or(RouteClass::Default, |rule| rule.class)
    }

    pub fn timeout_for(&self, class: RouteClass) -> Duration {
        self.profiles.get(class)
    }

    /// Classify `path` and derive its deadline from `ctx`
    pub fn for_path(&self, ctx: &Context, path: &str) -> (RequestDeadline, CancelHandle) {
        let class = self.classify(path);
        let timeout = self.timeout_for(class);
        let (context, cancel) = self.with_timeout(ctx, timeout);

        (
            RequestDeadline {
                class,
                timeout,
                context,
            },
            cancel,
        )
    }

    /// Clamp a caller-supplied query timeout into the configured bounds.
    /// `None` uses the default profile.
    pub fn query_timeout(&self, requested: Option<Duration>) -> Duration {
        let requested = requested.unwrap_or(self.profiles.default);
        requested.clamp(self.bounds.min, self.bounds.max.max(self.bounds.min))
    }

    /// Child of `ctx` bounded by the clamped query timeout
    pub fn with_query_timeout(&self, ctx: &Context, requested: Option<Duration>) -> (Context, CancelHandle) {
        ctx.with_timeout(self.query_timeout(requested))
    }

    /// Log a query that took longer than the slow-query threshold. Returns
    /// whether it was slow.
    pub fn observe_query(&self, label: &str, elapsed: Duration) -> bool {
        if elapsed <= self.bounds.slow_query_threshold {
            return false;
        }

        counter!("slow_queries_total").increment(1);
        warn!(query = label, ?elapsed, threshold = ?self.bounds.slow_query_threshold, "Slow query detected");
        true
    }

    /// Run `query` under a clamped query deadline, logging it if slow.
    pub async fn run_query<F, Fut, T>(
        &self,
        ctx: &Context,
        requested: Option<Duration>,
        label: &str,
        query: F,
    ) -> Result<T, ContextError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = T>,
    {
        let (query_ctx, _cancel) = self.with_query_timeout(ctx, requested);
        let start = Instant::now();
        let result = query_ctx.run(query(query_ctx.clone())).await;
        self.observe_query(label, start.elapsed());
        result
    }
}

/// Axum middleware applying the route-class deadline to each request.
///
/// Answers 408 with the standard error envelope when the deadline passes
/// before the handler responds.
pub async fn route_timeout_middleware(
    State(manager): State<Arc<QueryTimeoutManager>>,
    mut request: Request,
    next: Next,
) -> Response {
    let (deadline, _cancel) = manager.for_path(&Context::background(), request.uri().path());
    let ctx = deadline.context.clone();
    let class = deadline.class;
    let timeout = deadline.timeout;

    debug!(%class, ?timeout, path = request.uri().path(), "applying request deadline");
    request.extensions_mut().insert(deadline);

    match ctx.run(next.run(request)).await {
        Ok(response) => response,
        Err(reason) => {
            counter!("request_timeouts_total", "class" => class.as_str()).increment(1);
            warn!(%class, ?timeout, %reason, "request deadline exceeded");
            ApiError::Timeout("Request timeout exceeded".to_string()).into_response()
        }
    }
}
