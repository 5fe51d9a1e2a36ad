use anyhow::{Context as _, Result};
use config::{builder::DefaultState, Config as ConfigLoader, ConfigBuilder, Environment, File};
use neuronip_api::{
    observability::LogConfig,
    performance::CacheConfig,
    resilience::{CircuitBreakerConfig, RetryConfig, TimeoutProfiles},
    security::RateLimitConfig,
    ControlPlaneConfig, NEURON_AGENT, NEURON_MCP,
};
use serde::Deserialize;
use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LogConfig,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,
    pub breakers: BreakerSettings,
    pub shutdown: ShutdownSettings,
    pub drain: DrainSettings,
    pub timeouts: TimeoutSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8082,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub default_ttl_secs: u64,
    pub max_size: usize,
    pub cleanup_interval_secs: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let cache = CacheConfig::default();
        Self {
            default_ttl_secs: cache.default_ttl.as_secs(),
            max_size: cache.max_size,
            cleanup_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let limit = RateLimitConfig::default();
        Self {
            enabled: limit.enabled,
            max_requests: limit.max_requests,
            window_secs: limit.window.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerProfile {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
    pub max_requests: u32,
    pub reset_interval_secs: u64,
}

impl Default for BreakerProfile {
    fn default() -> Self {
        CircuitBreakerConfig::default().into()
    }
}

impl From<CircuitBreakerConfig> for BreakerProfile {
    fn from(config: CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            timeout_secs: config.timeout.as_secs(),
            max_requests: config.max_requests,
            reset_interval_secs: config.reset_interval.as_secs(),
        }
    }
}

impl From<&BreakerProfile> for CircuitBreakerConfig {
    fn from(profile: &BreakerProfile) -> Self {
        Self {
            failure_threshold: profile.failure_threshold,
            success_threshold: profile.success_threshold,
            timeout: Duration::from_secs(profile.timeout_secs),
            max_requests: profile.max_requests,
            reset_interval: Duration::from_secs(profile.reset_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub default: BreakerProfile,
    pub neuron_agent: BreakerProfile,
    pub neuron_mcp: BreakerProfile,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            default: CircuitBreakerConfig::default().into(),
            neuron_agent: CircuitBreakerConfig::neuron_agent().into(),
            neuron_mcp: CircuitBreakerConfig::neuron_mcp().into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    pub timeout_secs: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrainSettings {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 25,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub default_secs: u64,
    pub query_secs: u64,
    pub workflow_secs: u64,
    pub ingestion_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let profiles = TimeoutProfiles::default();
        Self {
            default_secs: profiles.default.as_secs(),
            query_secs: profiles.query.as_secs(),
            workflow_secs: profiles.workflow.as_secs(),
            ingestion_secs: profiles.ingestion.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    pub budget_per_minute: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let retry = ControlPlaneConfig::default().retry;
        Self {
            max_attempts: retry.max_attempts,
            initial_delay_ms: duration_ms(retry.initial_delay),
            max_delay_ms: duration_ms(retry.max_delay),
            multiplier: retry.multiplier,
            jitter: retry.jitter,
            budget_per_minute: ControlPlaneConfig::default().retry_budget,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Settings {
    /// Load from `config/default`, `config/local`, the legacy `RATE_LIMIT_*`
    /// variables, then `NEURONIP__SECTION__KEY` variables, later sources
    /// overriding earlier ones.
    pub fn load() -> Result<Self> {
        let builder = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false));

        let builder = legacy_rate_limit_overrides(builder)?.add_source(
            Environment::with_prefix("NEURONIP")
                .separator("__")
                .try_parsing(true),
        );

        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config = builder.build().context("Failed to read configuration")?;
        config
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid listen address {}:{}",
                    self.server.host, self.server.port
                )
            })
    }

    pub fn control_plane(&self) -> ControlPlaneConfig {
        let mut breakers = BTreeMap::new();
        breakers.insert(NEURON_AGENT.to_string(), (&self.breakers.neuron_agent).into());
        breakers.insert(NEURON_MCP.to_string(), (&self.breakers.neuron_mcp).into());

        let rate_limit = RateLimitConfig {
            enabled: self.rate_limit.enabled,
            ..RateLimitConfig::new(
                self.rate_limit.max_requests,
                Duration::from_secs(self.rate_limit.window_secs),
            )
        };

        ControlPlaneConfig {
            cache: CacheConfig {
                default_ttl: Duration::from_secs(self.cache.default_ttl_secs),
                max_size: self.cache.max_size,
                cleanup_interval: self.cache.cleanup_interval_secs.map(Duration::from_secs),
            },
            rate_limit,
            breakers,
            default_breaker: (&self.breakers.default).into(),
            timeouts: TimeoutProfiles {
                default: Duration::from_secs(self.timeouts.default_secs),
                query: Duration::from_secs(self.timeouts.query_secs),
                workflow: Duration::from_secs(self.timeouts.workflow_secs),
                ingestion: Duration::from_secs(self.timeouts.ingestion_secs),
            },
            retry: RetryConfig {
                max_attempts: self.retry.max_attempts,
                initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                multiplier: self.retry.multiplier,
                jitter: self.retry.jitter,
            },
            retry_budget: self.retry.budget_per_minute,
            shutdown_timeout: Duration::from_secs(self.shutdown.timeout_secs),
            drain_timeout: Duration::from_secs(self.drain.timeout_secs),
            drain_poll_interval: Duration::from_millis(self.drain.poll_interval_ms),
        }
    }
}

/// `RATE_LIMIT_ENABLED`, `RATE_LIMIT_MAX_REQUESTS` and
/// `RATE_LIMIT_WINDOW_SECS`, kept for existing deployments.
fn legacy_rate_limit_overrides(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>> {
    let builder = builder
        .set_override_option("rate_limit.enabled", std::env::var("RATE_LIMIT_ENABLED").ok())?
        .set_override_option(
            "rate_limit.max_requests",
            std::env::var("RATE_LIMIT_MAX_REQUESTS").ok(),
        )?
        .set_override_option(
            "rate_limit.window_secs",
            std::env::var("RATE_LIMIT_WINDOW_SECS").ok(),
        )?;
    Ok(builder)
}
