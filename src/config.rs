use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{PreflightError, PreflightResult};

/// Configuration for the preflight sandbox
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sandbox: SandboxConfig,
    pub fetch: FetchConfig,
    pub substitution: SubstitutionConfig,
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
}

/// How `lab.environment.set` treats objects, arrays and functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonPrimitivePolicy {
    /// Store `String(value)`
    #[default]
    Stringify,
    /// Throw a `TypeError` inside the script
    Reject,
}

/// Resource limits for script execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub max_source_len: usize,
    pub memory_limit_mb: usize,
    pub max_stack_kb: usize,
    pub max_log_entries: usize,
    pub non_primitive_values: NonPrimitivePolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_source_len: 5000,
            memory_limit_mb: 64,
            max_stack_kb: 512,
            max_log_entries: 500,
            non_primitive_values: NonPrimitivePolicy::default(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings for the `fetch` global exposed to scripts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Allow loopback and private network hosts (tests only)
    pub allow_private_network: bool,
    pub max_response_bytes: usize,
    pub timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            allow_private_network: false,
            max_response_bytes: 10 * 1024 * 1024,
            timeout_ms: 30_000,
        }
    }
}

/// Rendering of `null` environment values inside `{{key}}` placeholders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullRendering {
    #[default]
    Empty,
    Literal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstitutionConfig {
    pub null_rendering: NullRendering,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 5,
            acquire_timeout_ms: 2000,
            auto_migrate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter used when `RUST_LOG` is unset
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "preflight_sandbox=info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then the optional TOML file, then
    /// `PREFLIGHT_` environment variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> PreflightResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("PREFLIGHT_").split("__"))
            .extract()
            .map_err(|e| PreflightError::Config {
                message: e.to_string(),
            })
    }

    /// Configuration suitable for tests: short timeout and private network
    /// access for local mock servers.
    pub fn test_config() -> Self {
        let mut config = Self::default();
        config.sandbox.timeout_ms = 2000;
        config.fetch.allow_private_network = true;
        config
    }
}
