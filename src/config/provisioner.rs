//! # Provisioner Configuration
//!
//! Engine settings with defaults from [`crate::constants`], overridable
//! through environment variables:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `COMPLIANCE_LAKE_BACKOFF_START_MS` | 1000 |
//! | `COMPLIANCE_LAKE_BACKOFF_MAX_MS` | 30000 |
//! | `COMPLIANCE_LAKE_MAX_ATTEMPTS` | 5 |
//! | `COMPLIANCE_LAKE_MAX_CONCURRENT_APPLIES` | 4 |
//! | `COMPLIANCE_LAKE_POLL_INTERVAL_MS` | 2000 |
//! | `COMPLIANCE_LAKE_MAX_POLLS` | 900 |
//! | `COMPLIANCE_LAKE_STATE_FILE` | `compliance-lake.state.json` |
//! | `COMPLIANCE_LAKE_METRICS` | `false` |
//! | `RUST_LOG` | `compliance_lake=info` |
//! | `LOG_FORMAT` | `text` |

use crate::constants::{
    DEFAULT_BACKOFF_MAX_MS, DEFAULT_BACKOFF_START_MS, DEFAULT_LOG_FILTER, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_CONCURRENT_APPLIES, DEFAULT_MAX_POLLS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_STATE_FILE,
};
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("unknown log format '{other}', expected 'text' or 'json'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerConfig {
    pub backoff_start_ms: u64,
    pub backoff_max_ms: u64,
    /// Attempts per resource operation, including the first
    pub max_attempts: u32,
    pub max_concurrent_applies: usize,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    pub state_file: PathBuf,
    pub metrics_enabled: bool,
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_concurrent_applies: DEFAULT_MAX_CONCURRENT_APPLIES,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_polls: DEFAULT_MAX_POLLS,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            metrics_enabled: false,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl ProvisionerConfig {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, falling back to defaults for unset keys
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            backoff_start_ms: parse(&lookup, "COMPLIANCE_LAKE_BACKOFF_START_MS", defaults.backoff_start_ms)?,
            backoff_max_ms: parse(&lookup, "COMPLIANCE_LAKE_BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
            max_attempts: parse(&lookup, "COMPLIANCE_LAKE_MAX_ATTEMPTS", defaults.max_attempts)?,
            max_concurrent_applies: parse(
                &lookup,
                "COMPLIANCE_LAKE_MAX_CONCURRENT_APPLIES",
                defaults.max_concurrent_applies,
            )?,
            poll_interval_ms: parse(&lookup, "COMPLIANCE_LAKE_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            max_polls: parse(&lookup, "COMPLIANCE_LAKE_MAX_POLLS", defaults.max_polls)?,
            state_file: lookup("COMPLIANCE_LAKE_STATE_FILE").map_or(defaults.state_file, PathBuf::from),
            metrics_enabled: parse(&lookup, "COMPLIANCE_LAKE_METRICS", defaults.metrics_enabled)?,
            log_filter: lookup("RUST_LOG").unwrap_or(defaults.log_filter),
            log_format: parse(&lookup, "LOG_FORMAT", defaults.log_format)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("COMPLIANCE_LAKE_MAX_ATTEMPTS must be at least 1"));
        }
        if self.max_concurrent_applies == 0 {
            return Err(anyhow!("COMPLIANCE_LAKE_MAX_CONCURRENT_APPLIES must be at least 1"));
        }
        if self.backoff_start_ms > self.backoff_max_ms {
            return Err(anyhow!(
                "backoff start ({}ms) exceeds backoff maximum ({}ms)",
                self.backoff_start_ms,
                self.backoff_max_ms
            ));
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("Invalid value '{raw}' for {key}")),
        _ => Ok(default),
    }
}
