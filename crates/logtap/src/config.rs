// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use crate::http_poller::HttpPollerConfig;
use crate::pipeline::PipelineConfig;
use crate::rate_limiter::RateLimiterConfig;
use crate::tcp::TcpIngestorConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for the ingestion service and the agent binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub tcp: TcpIngestorConfig,
    /// Port for the TCP listener; `None` leaves TCP ingestion off
    pub tcp_port: Option<u16>,
    /// URLs polled from startup
    pub poll_urls: Vec<String>,
    pub poll_interval: Duration,
    pub poller: HttpPollerConfig,
    pub pipeline: PipelineConfig,
    /// Append-only file receiving every delivered entry as a JSON line
    pub output_file: Option<PathBuf>,
    /// Throttling shared by TCP lines and newly seen HTTP entries
    pub rate_limit: Option<RateLimiterConfig>,
    pub health_interval: Duration,
    pub shutdown_timeout: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            tcp: TcpIngestorConfig::default(),
            tcp_port: None,
            poll_urls: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poller: HttpPollerConfig::default(),
            pipeline: PipelineConfig::default(),
            output_file: None,
            rate_limit: None,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            shutdown_timeout: crate::constants::SHUTDOWN_TIMEOUT,
            log_level: "info".to_string(),
        }
    }
}

impl IngestConfig {
    /// Create configuration from `LOGTAP_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`IngestConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|val| val.trim().to_string())
                .filter(|val| !val.is_empty())
        };
        let mut config = Self::default();

        if let Some(host) = get("LOGTAP_TCP_HOST") {
            config.tcp.host = host;
        }
        config.tcp_port = parse_var(&get, "LOGTAP_TCP_PORT")?;
        if let Some(max) = parse_var(&get, "LOGTAP_MAX_CONNECTIONS")? {
            config.tcp.max_connections = max;
        }
        if let Some(urls) = get("LOGTAP_POLL_URLS") {
            config.poll_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(ms) = parse_var(&get, "LOGTAP_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var(&get, "LOGTAP_PIPELINE_CAPACITY")? {
            config.pipeline.capacity = capacity;
        }
        if let Some(batch_size) = parse_var(&get, "LOGTAP_BATCH_SIZE")? {
            config.pipeline.batch_size = batch_size;
        }
        config.output_file = get("LOGTAP_OUTPUT_FILE").map(PathBuf::from);
        if let Some(raw) = get("LOGTAP_RATE_LIMIT") {
            config.rate_limit = Some(parse_rate_limit(&raw).ok_or(ConfigError::InvalidValue {
                var: "LOGTAP_RATE_LIMIT",
                value: raw,
            })?);
        }
        if let Some(ms) = parse_var(&get, "LOGTAP_HEALTH_INTERVAL_MS")? {
            config.health_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&get, "LOGTAP_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(level) = get("LOGTAP_LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp.host.trim().is_empty() {
            return Err(ConfigError::Invalid("TCP host cannot be empty".to_string()));
        }
        if self.tcp.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max connections must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.capacity == 0 || self.pipeline.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "pipeline capacity and batch size must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.batch_size > self.pipeline.capacity {
            return Err(ConfigError::Invalid(format!(
                "batch size {} exceeds pipeline capacity {}",
                self.pipeline.batch_size, self.pipeline.capacity
            )));
        }
        if self.poll_interval.is_zero() || self.health_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "intervals must be greater than 0".to_string(),
            ));
        }
        if let Some(url) = self
            .poll_urls
            .iter()
            .find(|url| !(url.starts_with("http://") || url.starts_with("https://")))
        {
            return Err(ConfigError::Invalid(format!(
                "poll URL '{url}' must use http or https"
            )));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.max_tokens == 0 || limit.tokens_per_interval == 0 || limit.interval.is_zero()
            {
                return Err(ConfigError::Invalid(
                    "rate limit values must be greater than 0".to_string(),
                ));
            }
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }
}

fn parse_var<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
    }
}

/// Parses `max:per_interval:interval_ms`, e.g. `10000:1000:100`.
fn parse_rate_limit(raw: &str) -> Option<RateLimiterConfig> {
    let mut parts = raw.split(':').map(str::trim);
    let max_tokens = parts.next()?.parse().ok()?;
    let tokens_per_interval = parts.next()?.parse().ok()?;
    let interval_ms: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(RateLimiterConfig {
        max_tokens,
        tokens_per_interval,
        interval: Duration::from_millis(interval_ms),
    })
}
