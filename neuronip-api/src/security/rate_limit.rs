//! Per-client fixed-window rate limiting
//!
//! Each client gets a counter that starts with its first request. Requests are
//! admitted until the counter reaches `max_requests`; once more than `window`
//! has passed since the window started, the next request opens a fresh window.
//!
//! The window is reset on expiry rather than slid, so a client can be admitted
//! up to `2 × max_requests` times across a window boundary: a full window's
//! worth just before expiry and another full window's worth just after.
//!
//! A background cleanup pass every `2 × window` drops clients whose window
//! started more than `2 × window` ago, so memory tracks active clients only.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use neuronip_core::{system_clock, Context, PeriodicTask, SharedClock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApiError;

/// Configuration for rate limiting
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// When false the middleware passes every request through untouched
    pub enabled: bool,
    /// Requests admitted per client per window (at least 1)
    pub max_requests: u32,
    /// Length of one window
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 1000,
            window: Duration::from_secs(3600),
        }
    }
}

impl RateLimitConfig {
    /// Create a new rate limit configuration
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            enabled: true,
            max_requests: max_requests.max(1),
            window,
        }
    }

    /// Interval between idle-client cleanup passes, and the idle age beyond
    /// which a client is dropped.
    pub fn cleanup_interval(&self) -> Duration {
        self.window.saturating_mul(2)
    }
}

/// Identity established by an upstream authentication layer.
///
/// Inserted as a request extension; the limiter keys on it in preference to
/// the client address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIdentity {
    User(String),
    ApiKey(String),
}

/// Key a client is rate limited under
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum RateLimitKey {
    /// Authenticated user ID
    User(String),
    /// API key ID
    ApiKey(String),
    /// Forwarded or socket address, or `unknown`
    Ip(String),
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKey::User(id) => write!(f, "user:{}", id),
            RateLimitKey::ApiKey(id) => write!(f, "apikey:{}", id),
            RateLimitKey::Ip(addr) => write!(f, "ip:{}", addr),
        }
    }
}

/// Outcome of one admission check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub allowed: bool,
    /// Requests admitted per window
    pub limit: u32,
    /// Requests left in the current window after this check
    pub remaining: u32,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

/// Counter state for one client
#[derive(Debug, Clone, Copy)]
struct ClientWindow {
    count: u32,
    window_start: Instant,
}

/// Per-client fixed-window rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    clients: Arc<DashMap<String, ClientWindow>>,
    cleaner: parking_lot::Mutex<Option<PeriodicTask>>,
}

impl RateLimiter {
    /// Create a new rate limiter on the system clock
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: RateLimitConfig, clock: SharedClock) -> Self {
        let config = RateLimitConfig {
            max_requests: config.max_requests.max(1),
            ..config
        };
        Self {
            config,
            clock,
            clients: Arc::new(DashMap::new()),
            cleaner: parking_lot::Mutex::new(None),
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or reject one request from `client_id`.
    pub fn allow(&self, client_id: &str) -> bool {
        self.check(client_id).allowed
    }

    /// Admit or reject one request and report the window state in the same
    /// step.
    pub fn check(&self, client_id: &str) -> RateLimitInfo {
        let now = self.clock.now();
        let max = self.config.max_requests;

        let mut window = self
            .clients
            .entry(client_id.to_string())
            .or_insert(ClientWindow {
                count: 0,
                window_start: now,
            });

        let allowed = if window.count == 0 || self.lapsed(&window, now) {
            *window = ClientWindow {
                count: 1,
                window_start: now,
            };
            true
        } else if window.count < max {
            window.count += 1;
            true
        } else {
            false
        };

        let snapshot = *window;
        drop(window);

        if !allowed {
            counter!("rate_limit_rejections_total").increment(1);
            debug!(client = client_id, "rate limit exceeded");
        }

        RateLimitInfo {
            allowed,
            limit: max,
            remaining: max.saturating_sub(snapshot.count),
            reset_at: self.window_end(&snapshot, now),
        }
    }

    /// Requests left for `client_id` in its current window. A client with no
    /// window, or whose window has lapsed, has the full allowance.
    pub fn remaining(&self, client_id: &str) -> u32 {
        let now = self.clock.now();
        match self.clients.get(client_id) {
            Some(window) if !self.lapsed(&window, now) => {
                self.config.max_requests.saturating_sub(window.count)
            }
            _ => self.config.max_requests,
        }
    }

    /// Wall-clock time at which `client_id`'s current window ends, or one
    /// full window from now if it has none.
    pub fn reset_at(&self, client_id: &str) -> DateTime<Utc> {
        let now = self.clock.now();
        match self.clients.get(client_id) {
            Some(window) if !self.lapsed(&window, now) => self.window_end(&window, now),
            _ => wall_clock_after(self.config.window),
        }
    }

    /// Drop clients whose window started more than `2 × window` ago.
    /// Returns the number removed.
    pub fn cleanup_idle(&self) -> usize {
        cleanup(&self.clients, self.clock.now(), self.config.cleanup_interval())
    }

    /// Get the number of tracked clients (for monitoring)
    pub fn active_clients(&self) -> usize {
        self.clients.len()
    }

    /// Start the background idle-client cleanup. No-op if already running.
    pub fn start(&self, ctx: &Context) {
        let mut cleaner = self.cleaner.lock();
        if cleaner.as_ref().is_some_and(PeriodicTask::is_running) {
            return;
        }

        let clients = Arc::clone(&self.clients);
        let clock = self.clock.clone();
        let idle_after = self.config.cleanup_interval();

        *cleaner = Some(PeriodicTask::spawn(
            ctx,
            "rate-limit-cleanup",
            idle_after,
            move || {
                let removed = cleanup(&clients, clock.now(), idle_after);
                debug!(removed, active = clients.len(), "rate limiter cleanup");
                async {}
            },
        ));
    }

    /// Stop the background cleanup and wait for it to exit.
    pub async fn stop(&self) {
        let task = self.cleaner.lock().take();
        if let Some(mut task) = task {
            task.stop().await;
        }
    }

    fn lapsed(&self, window: &ClientWindow, now: Instant) -> bool {
        now.saturating_duration_since(window.window_start) > self.config.window
    }

    fn window_end(&self, window: &ClientWindow, now: Instant) -> DateTime<Utc> {
        let elapsed = now.saturating_duration_since(window.window_start);
        wall_clock_after(self.config.window.saturating_sub(elapsed))
    }
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn cleanup(clients: &DashMap<String, ClientWindow>, now: Instant, idle_after: Duration) -> usize {
    let before = clients.len();
    clients.retain(|_, window| now.saturating_duration_since(window.window_start) <= idle_after);
    before.saturating_sub(clients.len())
}

/// Extract rate limit key from request
///
/// Order: authenticated user, API key, first `X-Forwarded-For` hop, socket
/// address, then `ip:unknown`.
pub fn extract_rate_limit_key(req: &Request) -> RateLimitKey {
    match req.extensions().get::<ClientIdentity>() {
        Some(ClientIdentity::User(id)) => return RateLimitKey::User(id.clone()),
        Some(ClientIdentity::ApiKey(id)) if !id.is_empty() => {
            return RateLimitKey::ApiKey(id.clone())
        }
        _ => {}
    }

    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(hop) = forwarded_str.split(',').next() {
                let hop = hop.trim();
                if !hop.is_empty() {
                    return RateLimitKey::Ip(hop.to_string());
                }
            }
        }
    }

    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return RateLimitKey::Ip(connect_info.0.ip().to_string());
    }

    RateLimitKey::Ip("unknown".to_string())
}

/// Add rate limit headers to response
fn add_rate_limit_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers.insert("X-RateLimit-Limit", HeaderValue::from(info.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(info.remaining));
    headers.insert("X-RateLimit-Reset", HeaderValue::from(info.reset_at.timestamp()));
}

/// Axum middleware function for rate limiting
///
/// Sets the `X-RateLimit-*` headers on every response and answers 429 with
/// the standard error envelope when the client is over its limit.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    if !limiter.config().enabled {
        return next.run(req).await;
    }

    let key = extract_rate_limit_key(&req);
    let info = limiter.check(&key.to_string());

    let mut response = if info.allowed {
        next.run(req).await
    } else {
        ApiError::TooManyRequests("Rate limit exceeded".to_string()).into_response()
    };

    add_rate_limit_headers(response.headers_mut(), &info);
    response
}
