//! Observability for the control plane
//!
//! - Structured logging with JSON, pretty and compact formats
//! - Liveness and readiness probes
//!
//! Components emit `metrics` counters directly; installing an exporter is
//! left to the embedding binary.

pub mod health;
pub mod logging;

pub use logging::{build_filter, init_logging, LogConfig, LogFormat, LoggingError};

pub use health::{
    // Core types
    ComponentHealth, HealthStatus, OverallHealth,
    // State
    HealthState,
    // Handlers
    liveness_handler, readiness_handler,
};
