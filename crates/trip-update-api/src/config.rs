use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use trip_update_core::ReferenceResolver;

use crate::resolver::{HttpScheduleResolver, StaticScheduleResolver};

pub const DEFAULT_DATABASE_PATH: &str = "./trip-updates.sqlite3";
pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;

/// Runtime settings, read from a YAML (or JSON) file and overridable from the command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TripUpdateConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default)]
    pub resolver: Option<ResolverConfig>,
    #[serde(default)]
    pub log_filter: Option<String>,
    /// Source name applied to batches that do not carry one.
    #[serde(default)]
    pub default_source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverConfig {
    Static {
        schedule: PathBuf,
    },
    Http {
        base_url: String,
        #[serde(default = "default_http_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        token: Option<String>,
    },
}

impl Default for TripUpdateConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            resolver: None,
            log_filter: None,
            default_source: None,
        }
    }
}

impl TripUpdateConfig {
    /// # Errors
    /// Returns an error when the file cannot be read or does not match the config schema.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when the document does not match the config schema.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).context("failed to parse config")
    }

    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    /// Build the configured reference resolver.
    ///
    /// # Errors
    /// Returns an error when no resolver is configured or the configured one cannot be built.
    pub fn build_resolver(&self) -> Result<Box<dyn ReferenceResolver>> {
        match &self.resolver {
            Some(ResolverConfig::Static { schedule }) => {
                let resolver = StaticScheduleResolver::from_path(schedule)?;
                tracing::info!(
                    schedule = %schedule.display(),
                    trips = resolver.len(),
                    "loaded static schedule"
                );
                Ok(Box::new(resolver))
            }
            Some(ResolverConfig::Http { base_url, timeout_ms, token }) => {
                let resolver = HttpScheduleResolver::new(
                    base_url,
                    Duration::from_millis(*timeout_ms),
                    token.clone(),
                )?;
                tracing::info!(base_url = %base_url, timeout_ms, "using http schedule service");
                Ok(Box::new(resolver))
            }
            None => Err(anyhow::anyhow!(
                "no reference resolver configured; pass --schedule, --resolver-url or set `resolver` in the config file"
            )),
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}
