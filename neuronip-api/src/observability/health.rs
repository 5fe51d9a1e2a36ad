//! Health check endpoints for the control plane.
//!
//! - `/health/live` - Liveness probe: 200 while the process runs
//! - `/health/ready` - Readiness probe: 503 once shutdown has started,
//!   `degraded` while any circuit breaker is open

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::resilience::{CircuitBreakerRegistry, ShutdownManager};

/// Health status of a component or the overall system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component is operational but with reduced functionality
    Degraded,
    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Returns the HTTP status code for this health status
    pub fn http_status(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Combines two health statuses, returning the worst status
    pub fn combine(&self, other: &HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

/// Overall health status including all components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallHealth {
    /// Aggregated health status
    pub status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

impl OverallHealth {
    /// Creates a new overall health status from components
    pub fn new(components: HashMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .fold(HealthStatus::Healthy, |acc, component| {
                acc.combine(&component.status)
            });

        Self {
            status,
            components,
            timestamp: Utc::now(),
            version: None,
            uptime_seconds: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime_seconds = Some(uptime.as_secs());
        self
    }
}

impl IntoResponse for OverallHealth {
    fn into_response(self) -> Response {
        let status_code = self.status.http_status();
        (status_code, Json(self)).into_response()
    }
}

/// State shared by the health handlers
#[derive(Clone)]
pub struct HealthState {
    shutdown: Arc<ShutdownManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    version: String,
    start_time: Instant,
}

impl HealthState {
    pub fn new(shutdown: Arc<ShutdownManager>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            shutdown,
            breakers,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: Instant::now(),
        }
    }

    /// Always healthy while the process is running
    pub fn check_liveness(&self) -> OverallHealth {
        let mut components = HashMap::new();
        components.insert(
            "application".to_string(),
            ComponentHealth::healthy("application"),
        );

        OverallHealth::new(components)
            .with_version(&self.version)
            .with_uptime(self.start_time.elapsed())
    }

    /// Unhealthy once shutdown has started. Open breakers degrade the
    /// service but do not take it out of rotation.
    pub fn check_readiness(&self) -> OverallHealth {
        let mut components = HashMap::new();

        let lifecycle = if self.shutdown.is_shutting_down() {
            ComponentHealth::unhealthy("lifecycle", "Server is shutting down")
        } else {
            ComponentHealth::healthy("lifecycle")
        };
        components.insert(lifecycle.name.clone(), lifecycle);

        let open = self.breakers.open_breakers();
        let breakers = if open.is_empty() {
            ComponentHealth::healthy("circuit_breakers")
        } else {
            ComponentHealth::degraded(
                "circuit_breakers",
                format!("open: {}", open.join(", ")),
            )
        };
        components.insert(breakers.name.clone(), breakers);

        OverallHealth::new(components)
            .with_version(&self.version)
            .with_uptime(self.start_time.elapsed())
    }
}

/// Liveness probe handler
///
/// GET /health/live
pub async fn liveness_handler(State(state): State<HealthState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.check_liveness()))
}

/// Readiness probe handler
///
/// GET /health/ready
pub async fn readiness_handler(State(state): State<HealthState>) -> impl IntoResponse {
    state.check_readiness()
}
