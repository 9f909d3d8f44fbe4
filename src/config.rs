//! Worker configuration from environment variables.
//!
//! Environment variables:
//! - `REDIS_URL`: Redis connection string (default: redis://127.0.0.1/)
//! - `REDIS_QUEUE_NAME`: job list key (default: mcm:jobs)
//! - `API_BASE_URL`: back-end internal API (default: http://127.0.0.1:8080)
//! - `WEB_APP_URL`: web app root used in email links (default: http://127.0.0.1:3000)
//! - `JOB_TIMEOUT_SECS`: per-job deadline (default: 300)
//! - `QUEUE_POLL_TIMEOUT_SECS`: blocking pop wait (default: 30)
//! - `EXPORT_LOCK_TTL_SECS`: session export lock TTL (default: 3600)
//! - `EXPORT_LOCK_TRIES`: lock acquisition attempts (default: 2)
//! - `EXPORT_CONCURRENCY`: concurrent contribution downloads (default: 8)
//! - `STAGING_DIR`: parent of export staging trees (default: system temp dir)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint (default: http://localhost:4317)
//! - `OTEL_SERVICE_NAME`: telemetry service name (default: mcm-worker)

use crate::export::{ExportSettings, DEFAULT_EXPORT_CONCURRENCY, EXPORT_LOCK_TRIES, EXPORT_LOCK_TTL};
use crate::lock::LockOptions;
use crate::queue::{DEFAULT_POLL_TIMEOUT, DEFAULT_QUEUE_KEY};
use crate::worker::DEFAULT_JOB_TIMEOUT;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub queue_name: String,
    pub api_base_url: String,
    pub web_app_url: String,
    pub job_timeout: Duration,
    pub poll_timeout: Duration,
    pub lock_ttl: Duration,
    pub lock_tries: u32,
    pub export_concurrency: usize,
    pub staging_dir: PathBuf,
    pub otel_endpoint: String,
    pub otel_service_name: String,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; missing or unparsable
    /// values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parse_or(&lookup, key, default.as_secs()))
        };

        Self {
            redis_url: text("REDIS_URL", "redis://127.0.0.1/"),
            queue_name: text("REDIS_QUEUE_NAME", DEFAULT_QUEUE_KEY),
            api_base_url: text("API_BASE_URL", "http://127.0.0.1:8080"),
            web_app_url: text("WEB_APP_URL", "http://127.0.0.1:3000"),
            job_timeout: secs("JOB_TIMEOUT_SECS", DEFAULT_JOB_TIMEOUT),
            poll_timeout: secs("QUEUE_POLL_TIMEOUT_SECS", DEFAULT_POLL_TIMEOUT),
            lock_ttl: secs("EXPORT_LOCK_TTL_SECS", EXPORT_LOCK_TTL),
            lock_tries: parse_or(&lookup, "EXPORT_LOCK_TRIES", EXPORT_LOCK_TRIES),
            export_concurrency: parse_or(&lookup, "EXPORT_CONCURRENCY", DEFAULT_EXPORT_CONCURRENCY)
                .max(1),
            staging_dir: lookup("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            otel_endpoint: text("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4317"),
            otel_service_name: text("OTEL_SERVICE_NAME", "mcm-worker"),
        }
    }

    pub fn export_settings(&self) -> ExportSettings {
        ExportSettings {
            lock: LockOptions::new(self.lock_ttl, self.lock_tries),
            concurrency: self.export_concurrency,
            staging_dir: self.staging_dir.clone(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key = %key, value = %raw, "Ignoring invalid configuration value");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> WorkerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg.redis_url, "redis://127.0.0.1/");
        assert_eq!(cfg.queue_name, "mcm:jobs");
        assert_eq!(cfg.job_timeout, Duration::from_secs(300));
        assert_eq!(cfg.poll_timeout, Duration::from_secs(30));
        assert_eq!(cfg.lock_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.lock_tries, 2);
        assert_eq!(cfg.export_concurrency, 8);
        assert_eq!(cfg.staging_dir, std::env::temp_dir());
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("REDIS_QUEUE_NAME", "mcm:staging"),
            ("JOB_TIMEOUT_SECS", "60"),
            ("EXPORT_LOCK_TRIES", "5"),
            ("EXPORT_CONCURRENCY", "2"),
            ("STAGING_DIR", "/var/tmp/mcm"),
        ]);
        assert_eq!(cfg.queue_name, "mcm:staging");
        assert_eq!(cfg.job_timeout, Duration::from_secs(60));

        let settings = cfg.export_settings();
        assert_eq!(settings.lock.tries, 5);
        assert_eq!(settings.concurrency, 2);
        assert_eq!(settings.staging_dir, PathBuf::from("/var/tmp/mcm"));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = config(&[("JOB_TIMEOUT_SECS", "five minutes"), ("EXPORT_CONCURRENCY", "0")]);
        assert_eq!(cfg.job_timeout, Duration::from_secs(300));
        assert_eq!(cfg.export_concurrency, 1);
    }
}
