//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use messaging::{PublisherConfig, RetryPolicy};
use order::OrderServiceConfig;
use uuid::Uuid;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Process configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: ops endpoint bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `"info"`)
/// - `LOG_FORMAT`: `pretty` or `json`
/// - `INSTANCE_ID`: prefix of outbox lock holder ids (default: random)
/// - `OUTBOX_BATCH_SIZE`, `OUTBOX_POLL_INTERVAL_MS`, `OUTBOX_LEASE_SECS`,
///   `OUTBOX_PUBLISH_TIMEOUT_MS`, `OUTBOX_MAX_RETRIES`, `OUTBOX_BASE_DELAY_MS`,
///   `OUTBOX_MAX_DELAY_MS`
/// - `SAGA_BOOTSTRAP_TIMEOUT_MS`, `SAGA_RECOVERY_INTERVAL_SECS`,
///   `SAGA_RECOVERY_GRACE_SECS`
/// - `RETENTION_SECS`, `RETENTION_INTERVAL_SECS`: how long published outbox
///   and processed inbox rows are kept, and how often they are swept
/// - `ORDERS_PAGE_SIZE`
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub instance_id: String,
    pub outbox_batch_size: usize,
    pub outbox_poll_interval: Duration,
    pub outbox_lease: Duration,
    pub outbox_publish_timeout: Duration,
    pub outbox_max_retries: u32,
    pub outbox_base_delay: Duration,
    pub outbox_max_delay: Duration,
    pub saga_bootstrap_timeout: Duration,
    pub saga_recovery_interval: Duration,
    pub saga_recovery_grace: Duration,
    pub retention: Duration,
    pub retention_interval: Duration,
    pub orders_page_size: u32,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| parse(key).map_or(default, Duration::from_millis);
        let secs = |key: &str, default: Duration| parse(key).map_or(default, Duration::from_secs);

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .and_then(|f| f.parse().ok())
                .unwrap_or(defaults.log_format),
            instance_id: lookup("INSTANCE_ID")
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(defaults.instance_id),
            outbox_batch_size: parse("OUTBOX_BATCH_SIZE")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.outbox_batch_size),
            outbox_poll_interval: millis("OUTBOX_POLL_INTERVAL_MS", defaults.outbox_poll_interval),
            outbox_lease: secs("OUTBOX_LEASE_SECS", defaults.outbox_lease),
            outbox_publish_timeout: millis(
                "OUTBOX_PUBLISH_TIMEOUT_MS",
                defaults.outbox_publish_timeout,
            ),
            outbox_max_retries: parse("OUTBOX_MAX_RETRIES")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.outbox_max_retries),
            outbox_base_delay: millis("OUTBOX_BASE_DELAY_MS", defaults.outbox_base_delay),
            outbox_max_delay: millis("OUTBOX_MAX_DELAY_MS", defaults.outbox_max_delay),
            saga_bootstrap_timeout: millis(
                "SAGA_BOOTSTRAP_TIMEOUT_MS",
                defaults.saga_bootstrap_timeout,
            ),
            saga_recovery_interval: secs(
                "SAGA_RECOVERY_INTERVAL_SECS",
                defaults.saga_recovery_interval,
            ),
            saga_recovery_grace: secs("SAGA_RECOVERY_GRACE_SECS", defaults.saga_recovery_grace),
            retention: secs("RETENTION_SECS", defaults.retention),
            retention_interval: secs("RETENTION_INTERVAL_SECS", defaults.retention_interval)
                .max(Duration::from_secs(1)),
            orders_page_size: parse("ORDERS_PAGE_SIZE")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.orders_page_size),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Backoff shared by outbox publishers and bus consumers.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.outbox_base_delay,
            self.outbox_max_delay,
            self.outbox_max_retries,
        )
    }

    /// Publisher settings for one service's outbox.
    pub fn publisher(&self, service: &str) -> PublisherConfig {
        PublisherConfig::new(format!("{}-{service}", self.instance_id))
            .with_batch_size(self.outbox_batch_size)
            .with_lease(self.outbox_lease)
            .with_publish_timeout(self.outbox_publish_timeout)
            .with_retry(self.retry_policy())
    }

    pub fn order_service(&self) -> OrderServiceConfig {
        OrderServiceConfig::default()
            .with_bootstrap_timeout(self.saga_bootstrap_timeout)
            .with_page_size(self.orders_page_size)
            .with_recovery_grace(self.saga_recovery_grace)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            instance_id: format!("instance-{}", &Uuid::new_v4().simple().to_string()[..8]),
            outbox_batch_size: 50,
            outbox_poll_interval: Duration::from_millis(1000),
            outbox_lease: Duration::from_secs(30),
            outbox_publish_timeout: Duration::from_millis(5000),
            outbox_max_retries: 5,
            outbox_base_delay: Duration::from_millis(1000),
            outbox_max_delay: Duration::from_millis(60_000),
            saga_bootstrap_timeout: Duration::from_millis(3000),
            saga_recovery_interval: Duration::from_secs(30),
            saga_recovery_grace: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            retention_interval: Duration::from_secs(60 * 60),
            orders_page_size: 20,
        }
    }
}
