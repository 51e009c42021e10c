use crate::error::{AdapterError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const CONFIG_ENV: &str = "ONVIF_ADAPTER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "onvif-adapter.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub adapter: GeneralConfig,
    pub discovery: DiscoveryConfig,
    pub onvif: OnvifConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Prefix of every id the adapter owns in the state tree
    pub namespace: String,
    pub log_level: String,
    pub database_path: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            namespace: "onvif.0".to_string(),
            log_level: "info".to_string(),
            database_path: PathBuf::from("onvif-adapter.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub on_startup: bool,
    /// 6-field cron expression; empty disables periodic discovery
    pub schedule: String,
    pub probe_timeout_ms: u64,
    pub concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_startup: true,
            schedule: "0 */15 * * * *".to_string(),
            probe_timeout_ms: 2000,
            concurrency: 50,
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn periodic(&self) -> Option<&str> {
        let schedule = self.schedule.trim();
        if self.enabled && !schedule.is_empty() {
            Some(schedule)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OnvifConfig {
    pub request_timeout_secs: u64,
    pub accept_invalid_certs: bool,
    pub default_port: u16,
}

impl Default for OnvifConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 5,
            accept_invalid_certs: true,
            default_port: 80,
        }
    }
}

impl OnvifConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AdapterConfig {
    /// Parse a TOML document; absent sections and keys take their defaults.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| AdapterError::Config(e.to_string()))
    }

    /// Load from `path`. A missing file is not an error and yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Config path from the first CLI argument, then the environment, then the default file name.
    pub fn resolve_path(arg: Option<String>) -> PathBuf {
        arg.or_else(|| std::env::var(CONFIG_ENV).ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = AdapterConfig::from_toml("").unwrap();
        assert_eq!(config.adapter.namespace, "onvif.0");
        assert_eq!(config.discovery.probe_timeout_ms, 2000);
        assert_eq!(config.onvif.default_port, 80);
        assert_eq!(config.discovery.periodic(), Some("0 */15 * * * *"));
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = AdapterConfig::from_toml(
            r#"
            [discovery]
            schedule = ""
            concurrency = 8

            [onvif]
            request_timeout_secs = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.discovery.concurrency, 8);
        assert!(config.discovery.on_startup);
        assert_eq!(config.discovery.periodic(), None);
        assert_eq!(config.onvif.request_timeout(), Duration::from_secs(10));
        assert!(config.onvif.accept_invalid_certs);
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = AdapterConfig::from_toml("[adapter\nnamespace=").unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = AdapterConfig::load(Path::new("/nonexistent/onvif-adapter.toml")).unwrap();
        assert_eq!(config.adapter.log_level, "info");
    }
}
