//! Configuration structures.
//!
//! The root [`Config`] composes per-component sections; every section has a
//! `Default` carrying the kernel's documented constants, so `Config::default()`
//! is a fully working configuration. Overrides load from a JSON file.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::cognition::CognitionConfig;
use crate::kernel::HealthConfig;
use crate::memory::MemoryConfig;
use crate::resilience::{BreakerConfig, RetryConfig};
use crate::types::Result;

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Circuit breaker defaults (pipeline stages and per-agent breakers).
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Retry/backoff defaults.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Memory engine tiers and cleanup schedule.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Health monitor polling and recovery.
    #[serde(default)]
    pub health: HealthConfig,

    /// Cognitive loop bounds.
    #[serde(default)]
    pub cognition: CognitionConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// Missing sections fall back to defaults via `#[serde(default)]`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
