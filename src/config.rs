use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the harvestd daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Backend connection configuration.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Harvest cadence and container limit configuration.
    #[serde(default)]
    pub harvest: HarvestConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Remove applications with no activity for this long. Default: disabled.
    #[serde(default, with = "humantime_serde::option")]
    pub app_inactivity_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            backend: BackendConfig::default(),
            harvest: HarvestConfig::default(),
            health: HealthConfig::default(),
            app_inactivity_timeout: None,
        }
    }
}

/// Backend (ingestion service) connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Default backend host, used until preconnect issues a redirect.
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Per-request timeout. Default: 20s.
    #[serde(default = "default_backend_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum concurrent outbound requests. Default: 8.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// How long a request waits for an admission slot before failing.
    /// Default: 5s.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Minimum wait between connect attempts for one application.
    /// Default: 20s.
    #[serde(default = "default_connect_backoff", with = "humantime_serde")]
    pub connect_backoff: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            timeout: default_backend_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
            acquire_timeout: default_acquire_timeout(),
            connect_backoff: default_connect_backoff(),
        }
    }
}

/// Harvest cadence and per-kind container limits.
#[derive(Debug, Clone, Deserialize)]
pub struct HarvestConfig {
    /// Reporting period when the backend does not override it. Default: 60s.
    #[serde(default = "default_report_period", with = "humantime_serde")]
    pub report_period: Duration,

    /// Per-kind event container capacities advertised to the backend.
    #[serde(default)]
    pub limits: HarvestLimits,

    /// Maximum distinct unforced metric names per harvest. Default: 2000.
    #[serde(default = "default_max_metrics")]
    pub max_metrics: usize,

    /// Maximum retained transaction traces per harvest. Default: 1.
    #[serde(default = "default_max_txn_traces")]
    pub max_txn_traces: usize,

    /// Maximum retained slow query traces per harvest. Default: 10.
    #[serde(default = "default_max_slow_queries")]
    pub max_slow_queries: usize,

    /// Maximum retained error traces per harvest. Default: 20.
    #[serde(default = "default_max_error_traces")]
    pub max_error_traces: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            report_period: default_report_period(),
            limits: HarvestLimits::default(),
            max_metrics: default_max_metrics(),
            max_txn_traces: default_max_txn_traces(),
            max_slow_queries: default_max_slow_queries(),
            max_error_traces: default_max_error_traces(),
        }
    }
}

/// Event reservoir capacities, by data kind.
///
/// These are the local maxima; the backend may lower them at connect time
/// but can never raise them past what is configured here.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HarvestLimits {
    /// Transaction (analytic) event capacity. Default: 10000.
    #[serde(default = "default_analytic_events")]
    pub analytic_events: usize,

    /// Custom event capacity. Default: 30000.
    #[serde(default = "default_custom_events")]
    pub custom_events: usize,

    /// Error event capacity. Default: 100.
    #[serde(default = "default_error_events")]
    pub error_events: usize,

    /// Span event capacity. Default: 2000.
    #[serde(default = "default_span_events")]
    pub span_events: usize,

    /// Log event capacity. Default: 10000.
    #[serde(default = "default_log_events")]
    pub log_events: usize,
}

impl Default for HarvestLimits {
    fn default() -> Self {
        Self {
            analytic_events: default_analytic_events(),
            custom_events: default_custom_events(),
            error_events: default_error_events(),
            span_events: default_span_events(),
            log_events: default_log_events(),
        }
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Enable the health metrics server. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address for /healthz and /metrics. Default: "127.0.0.1:8126".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validates configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.backend.host.is_empty() {
            bail!("backend.host must not be empty");
        }

        if self.backend.timeout.is_zero() {
            bail!("backend.timeout must be > 0");
        }

        if self.backend.max_concurrent_requests == 0 {
            bail!("backend.max_concurrent_requests must be > 0");
        }

        if self.harvest.report_period.is_zero() {
            bail!("harvest.report_period must be > 0");
        }

        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend_host() -> String {
    "collector.ingest.example.com".to_string()
}

fn default_backend_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_max_concurrent_requests() -> usize {
    8
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_backoff() -> Duration {
    Duration::from_secs(20)
}

fn default_report_period() -> Duration {
    Duration::from_secs(60)
}

fn default_max_metrics() -> usize {
    2000
}

fn default_max_txn_traces() -> usize {
    1
}

fn default_max_slow_queries() -> usize {
    10
}

fn default_max_error_traces() -> usize {
    20
}

fn default_analytic_events() -> usize {
    10_000
}

fn default_custom_events() -> usize {
    30_000
}

fn default_error_events() -> usize {
    100
}

fn default_span_events() -> usize {
    2_000
}

fn default_log_events() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    "127.0.0.1:8126".to_string()
}
