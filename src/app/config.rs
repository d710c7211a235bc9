//! Application configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Proxy settings
    pub proxy: ProxyConfig,

    /// Certificate authority settings
    pub tls: TlsConfig,

    /// Flow runner settings
    pub flows: FlowsConfig,

    /// Fuzz step settings
    pub fuzzer: FuzzerConfig,

    /// Scripting settings
    pub scripting: ScriptingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory (CA material, flows, logs); platform default if unset
    pub data_dir: Option<PathBuf>,

    /// Maximum items in proxy history
    pub max_history_items: usize,

    /// Capacity of the event channel
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy listen address
    pub listen_addr: String,

    /// Proxy listen port (0 picks a free port)
    pub listen_port: u16,

    /// Interception state at startup
    pub intercept_enabled: bool,

    /// Enable HTTPS interception; when off CONNECT is tunneled untouched
    pub https_intercept: bool,

    /// How long a paused transaction waits for the operator before going out unmodified
    pub intercept_timeout_secs: u64,

    /// How long `stop` lets in-flight connections finish
    pub shutdown_grace_secs: u64,

    /// Timeout for requests to origin servers
    pub upstream_timeout_secs: u64,

    /// Verify origin certificates
    pub verify_upstream_tls: bool,

    /// Maximum redirect depth when a caller asks to follow redirects
    pub max_redirects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// CA certificate path (defaults to `<data_dir>/ca/gleip-ca.pem`)
    pub ca_cert_path: Option<PathBuf>,

    /// CA private key path (defaults to `<data_dir>/ca/gleip-ca.key`)
    pub ca_key_path: Option<PathBuf>,

    /// Identity served to clients that send no SNI
    pub default_hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowsConfig {
    /// Directory holding flow definitions (defaults to `<data_dir>/flows`)
    pub flows_dir: Option<PathBuf>,

    /// Whether replay steps follow redirects
    pub follow_redirects: bool,

    /// Timeout for each replayed request in seconds
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzerConfig {
    /// Default worker pool size for fuzz steps
    pub max_concurrent: usize,

    /// How long a cancelled fuzz step waits for in-flight requests
    pub cancel_grace_secs: u64,

    /// Timeout for each fuzz request in seconds
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptingConfig {
    /// Enable JavaScript scripting
    pub enabled: bool,

    /// Script timeout in milliseconds
    pub timeout_ms: u64,

    /// Loop iteration ceiling inside the engine
    pub loop_iteration_limit: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_history_items: 1000,
            event_buffer: 1024,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 8080,
            intercept_enabled: false,
            https_intercept: true,
            intercept_timeout_secs: 300,
            shutdown_grace_secs: 5,
            upstream_timeout_secs: 30,
            verify_upstream_tls: false,
            max_redirects: 10,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: None,
            ca_key_path: None,
            default_hostname: "localhost".to_string(),
        }
    }
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            flows_dir: None,
            follow_redirects: false,
            request_timeout_secs: 30,
        }
    }
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            cancel_grace_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 5000,
            loop_iteration_limit: 1_000_000,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::ReadError {
                path: config_path.display().to_string(),
                source,
            })?;

            let config: Config =
                toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

            tracing::info!("Loaded configuration from {:?}", config_path);
            Ok(config)
        } else {
            tracing::info!("No configuration file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let io_err = |source| ConfigError::WriteError {
            path: config_path.display().to_string(),
            source,
        };

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let contents = toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(&config_path, contents).map_err(io_err)?;

        tracing::info!("Saved configuration to {:?}", config_path);
        Ok(config_path)
    }

    /// Check values that would only fail later at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::ValidationError {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.proxy.listen_addr.parse::<std::net::IpAddr>().is_err() {
            return Err(invalid("proxy.listen_addr", "must be an IP address"));
        }
        if self.fuzzer.max_concurrent == 0 {
            return Err(invalid("fuzzer.max_concurrent", "must be at least 1"));
        }
        if self.general.event_buffer == 0 {
            return Err(invalid("general.event_buffer", "must be at least 1"));
        }
        if self.tls.default_hostname.trim().is_empty() {
            return Err(invalid("tls.default_hostname", "must not be empty"));
        }
        if self.scripting.timeout_ms == 0 {
            return Err(invalid("scripting.timeout_ms", "must be greater than 0"));
        }
        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let dirs = project_dirs().ok_or(ConfigError::NoDirectory("config"))?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get data directory path
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.general.data_dir {
            return Ok(dir.clone());
        }
        let dirs = project_dirs().ok_or(ConfigError::NoDirectory("data"))?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// CA certificate and key locations
    pub fn ca_paths(&self) -> Result<(PathBuf, PathBuf), ConfigError> {
        let ca_dir = || self.data_dir().map(|d| d.join("ca"));
        let cert = match &self.tls.ca_cert_path {
            Some(p) => p.clone(),
            None => ca_dir()?.join("gleip-ca.pem"),
        };
        let key = match &self.tls.ca_key_path {
            Some(p) => p.clone(),
            None => ca_dir()?.join("gleip-ca.key"),
        };
        Ok((cert, key))
    }

    /// Directory of stored flow definitions
    pub fn flows_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.flows.flows_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.data_dir()?.join("flows")),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("io", "gleip", "gleip")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.proxy.listen_port, 8080);
        assert!(config.proxy.https_intercept);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[proxy]\nlisten_port = 9999\n\n[fuzzer]\nmax_concurrent = 3\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.proxy.listen_port, 9999);
        assert_eq!(config.proxy.listen_addr, "127.0.0.1");
        assert_eq!(config.fuzzer.max_concurrent, 3);
        assert_eq!(config.scripting.timeout_ms, 5000);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.tls.default_hostname = "gleip.local".into();
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.tls.default_hostname, "gleip.local");
    }

    #[test]
    fn test_save_failure_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let err = Config::default().save(Some(&blocker.join("config.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::WriteError { .. }));
        assert!(err.to_string().starts_with("Failed to write"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.fuzzer.max_concurrent = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { ref field, .. }) if field == "fuzzer.max_concurrent"
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[proxy\nlisten_port = ").unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_paths_derive_from_data_dir() {
        let mut config = Config::default();
        config.general.data_dir = Some(PathBuf::from("/srv/gleip"));
        let (cert, key) = config.ca_paths().unwrap();
        assert_eq!(cert, PathBuf::from("/srv/gleip/ca/gleip-ca.pem"));
        assert_eq!(key, PathBuf::from("/srv/gleip/ca/gleip-ca.key"));
        assert_eq!(config.flows_dir().unwrap(), PathBuf::from("/srv/gleip/flows"));
    }
}
