//! NeuronIP resilience and resource-governance control plane.
//!
//! Components:
//! - [`performance::TtlCache`]: TTL + LRU in-memory cache
//! - [`security::RateLimiter`]: fixed-window per-client admission
//! - [`resilience::CircuitBreaker`]: per-dependency failure isolation
//! - [`resilience::QueryTimeoutManager`]: route and query deadlines
//! - [`resilience::ShutdownManager`] and [`resilience::ConnectionDrainer`]:
//!   bounded graceful shutdown
//!
//! [`state::ControlPlane`] wires them together and builds the router.

pub mod error;
pub mod handlers;
pub mod observability;
pub mod performance;
pub mod resilience;
pub mod security;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{ControlPlane, ControlPlaneConfig, NEURON_AGENT, NEURON_MCP};
