use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::naming;

/// Prefix for environment overrides (`SVCBEACON_SERVICE__NAME`, ...)
pub const ENV_PREFIX: &str = "SVCBEACON";

/// Smallest accepted health check TTL
pub const MIN_HEALTH_CHECK_TTL: Duration = Duration::from_secs(5);

/// TTL used in place of a configured value below [`MIN_HEALTH_CHECK_TTL`]
pub const FALLBACK_HEALTH_CHECK_TTL: Duration = Duration::from_secs(8);

/// Application configuration, as loaded from file and environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
    /// Forces debug-level logging
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Empty means "derive from the module name"
    pub name: String,
    pub address: String,
    /// Kept wide so out-of-range values can be coerced instead of rejected
    pub port: i64,
    pub tags: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: "localhost".to_string(),
            port: 0,
            tags: default_tags(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub address: String,
    pub scheme: String,
    /// Humantime duration string ("10s", "1m"); a bare integer is read as seconds
    pub health_check_ttl: String,
    pub enable_watch: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_BACKEND_ADDRESS.to_string(),
            scheme: DEFAULT_BACKEND_SCHEME.to_string(),
            health_check_ttl: "10s".to_string(),
            enable_watch: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file_path: None,
        }
    }
}

const DEFAULT_BACKEND_ADDRESS: &str = "127.0.0.1:8500";
const DEFAULT_BACKEND_SCHEME: &str = "http";

fn default_tags() -> Vec<String> {
    vec!["go".to_string(), "service".to_string()]
}

/// Fully resolved settings handed to the discovery layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub service: ServiceSettings,
    pub discovery: DiscoverySettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub backend: DiscoveryBackendConfig,
    pub health_check_ttl: Duration,
    pub enable_watch: bool,
}

/// Connection info for the discovery backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryBackendConfig {
    pub address: String,
    pub scheme: String,
}

impl DiscoveryBackendConfig {
    /// Trims and lower-cases both fields, falling back to the defaults when empty
    #[must_use]
    pub fn normalized(address: &str, scheme: &str) -> Self {
        let address = address.trim().to_lowercase();
        let scheme = scheme.trim().to_lowercase();
        Self {
            address: if address.is_empty() {
                DEFAULT_BACKEND_ADDRESS.to_string()
            } else {
                address
            },
            scheme: if scheme.is_empty() {
                DEFAULT_BACKEND_SCHEME.to_string()
            } else {
                scheme
            },
        }
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.address)
    }
}

impl Default for DiscoveryBackendConfig {
    fn default() -> Self {
        Self::normalized(DEFAULT_BACKEND_ADDRESS, DEFAULT_BACKEND_SCHEME)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided and present)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if path.exists() {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("service.tags")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize().map_err(Error::from)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Logging configuration with the `debug` flag applied
    #[must_use]
    pub fn effective_logging(&self) -> LoggingConfig {
        let mut logging = self.logging.clone();
        if self.debug {
            logging.level = "debug".to_string();
        }
        logging
    }

    /// Normalize every value and apply the fallbacks.
    ///
    /// `module_name` feeds the derived service name when none is configured.
    pub fn resolve(&self, module_name: &str) -> Result<Settings> {
        Ok(Settings {
            service: self.service.resolve(module_name),
            discovery: self.discovery.resolve()?,
        })
    }
}

impl ServiceConfig {
    #[must_use]
    pub fn resolve(&self, module_name: &str) -> ServiceSettings {
        let mut name: String = self.name.chars().filter(|c| !c.is_whitespace()).collect();
        if name.is_empty() {
            name = naming::fallback_service_name(module_name);
            tracing::debug!(service_name = %name, "No service name configured, derived from module name");
        }

        let mut address = self.address.trim().to_lowercase();
        if address.is_empty() {
            address = "localhost".to_string();
            tracing::debug!("Service address not defined, using 'localhost'");
        }

        let tags: Vec<String> = self
            .tags
            .iter()
            .map(|tag| tag.chars().filter(|c| !c.is_whitespace()).collect::<String>())
            .filter(|tag| !tag.is_empty())
            .collect();

        ServiceSettings {
            name,
            address,
            port: coerce_port(self.port),
            tags: if tags.is_empty() { default_tags() } else { tags },
        }
    }
}

impl DiscoveryConfig {
    pub fn resolve(&self) -> Result<DiscoverySettings> {
        Ok(DiscoverySettings {
            backend: DiscoveryBackendConfig::normalized(&self.address, &self.scheme),
            health_check_ttl: resolve_health_check_ttl(&self.health_check_ttl)?,
            enable_watch: self.enable_watch,
        })
    }
}

/// Ports outside `0..=65535` become 0 (OS-assigned)
#[must_use]
pub fn coerce_port(port: i64) -> u16 {
    u16::try_from(port).unwrap_or_else(|_| {
        tracing::warn!(
            port,
            "Service port is out of the valid range (0-65535), using 0 for a random available port"
        );
        0
    })
}

/// Parse a TTL string, replacing sub-minimum values with the fallback TTL
pub fn resolve_health_check_ttl(value: &str) -> Result<Duration> {
    let trimmed = value.trim();
    let ttl = match trimmed.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => humantime::parse_duration(trimmed).map_err(|e| Error::InvalidTtl {
            value: value.to_string(),
            reason: e.to_string(),
        })?,
    };

    if ttl < MIN_HEALTH_CHECK_TTL {
        tracing::warn!(
            configured = ?ttl,
            fallback = ?FALLBACK_HEALTH_CHECK_TTL,
            "Health check TTL is below the 5s minimum, using fallback"
        );
        return Ok(FALLBACK_HEALTH_CHECK_TTL);
    }

    Ok(ttl)
}
