//! Security module for neuronip-api
//!
//! Provides per-client admission control:
//! - Fixed-window rate limiting keyed by user, API key, or client address
//! - Axum middleware that reports `X-RateLimit-*` headers and answers 429

pub mod rate_limit;

pub use rate_limit::{
    extract_rate_limit_key, rate_limit_middleware, ClientIdentity, RateLimitConfig,
    RateLimitInfo, RateLimitKey, RateLimiter,
};
