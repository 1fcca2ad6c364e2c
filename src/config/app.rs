//! Application configuration structures.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::connector::ConnectorConfig;
use super::validation::ConfigError;

// =============================================================================
// Constants
// =============================================================================

/// Default probe interval (5 seconds).
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Default metrics port.
pub const DEFAULT_PORT: u16 = 8080;

fn default_probe_interval() -> Duration {
    DEFAULT_PROBE_INTERVAL
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Metrics server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Metrics server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Legacy top-level port; overrides `server.port` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,

    /// Pause between two sweeps (default: 5s).
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub probe_interval: Duration,

    /// Devices to probe, in probe order.
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            metrics_port: None,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            connectors: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Parse configuration from a YAML (or JSON) document.
    ///
    /// Environment variables are expanded, the legacy `metrics_port` is
    /// applied and the result is validated.
    ///
    /// # Errors
    /// Returns `ConfigError` if the document cannot be parsed or validated.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(content)?;

        if let Some(port) = config.metrics_port.take() {
            config.server.port = port;
        }
        for connector in &mut config.connectors {
            connector.expand_env();
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::ValidationError(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;

        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server port must be non-zero".to_string(),
            ));
        }

        if self.probe_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "probe_interval must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for connector in &self.connectors {
            connector.validate().map_err(|e| {
                ConfigError::ValidationError(format!(
                    "connector '{}' ({}): {}",
                    connector.name, connector.url, e
                ))
            })?;
            if !seen.insert((connector.url.as_str(), connector.name.as_str())) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate connector: url '{}' name '{}'",
                    connector.url, connector.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = AppConfig::from_yaml("connectors: []\n").unwrap();
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.probe_interval, DEFAULT_PROBE_INTERVAL);
        assert!(config.connectors.is_empty());
    }

    #[test]
    fn test_full_yaml_config() {
        let yaml = r#"
server:
  bind: 127.0.0.1
  port: 9101
probe_interval: 30s
connectors:
  - url: http://10.0.0.1:12345
    name: primary
    audit_key_id: 6
    audit_key_pin_path: /etc/yubihsm-exporter/audit.pin
    application_key_id: 3
    application_key_pin_path: /etc/yubihsm-exporter/app.pin
    encryption_key_label: vault-hsm-key
  - url: http://10.0.0.2:12345
    name: backup
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 9101);
        assert_eq!(config.probe_interval, Duration::from_secs(30));
        assert_eq!(config.connectors.len(), 2);
        assert_eq!(config.connectors[0].name, "primary");
        assert_eq!(config.connectors[1].audit_key_id, None);
    }

    #[test]
    fn test_json_config_with_legacy_port() {
        let json = r#"{
  "metrics_port": 9200,
  "connectors": [
    {
      "url": "http://127.0.0.1:12345",
      "name": "one",
      "audit_key_id": 6,
      "audit_key_pin_path": "audit.pin"
    },
    {
      "url": "http://127.0.0.1:12346"
    }
  ]
}"#;
        let config = AppConfig::from_yaml(json).unwrap();

        assert_eq!(config.server.port, 9200);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.connectors[1].name, "");
    }

    #[test]
    fn test_env_expansion_in_connectors() {
        let yaml = r#"
connectors:
  - url: http://${NONEXISTENT_HSM_HOST_98765:-10.1.1.1}:12345
    audit_key_id: 6
    audit_key_pin_path: ${NONEXISTENT_PIN_DIR_98765:-/run/pins}/audit.pin
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.connectors[0].url, "http://10.1.1.1:12345");
        assert_eq!(
            config.connectors[0].audit_key_pin_path.as_deref(),
            Some(Path::new("/run/pins/audit.pin"))
        );
    }

    #[test]
    fn test_config_validation_invalid_port() {
        let config = AppConfig {
            server: ServerConfig {
                bind: "0.0.0.0".to_string(),
                port: 0,
            },
            ..AppConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_bind_address() {
        let config = AppConfig {
            server: ServerConfig {
                bind: "not-an-ip".to_string(),
                port: 8080,
            },
            ..AppConfig::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("invalid server bind address")
        );
    }

    #[test]
    fn test_config_validation_zero_interval() {
        let config = AppConfig {
            probe_interval: Duration::ZERO,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_duplicate_connector() {
        let config = AppConfig {
            connectors: vec![
                ConnectorConfig::new("http://127.0.0.1:12345", "a"),
                ConnectorConfig::new("http://127.0.0.1:12345", "b"),
                ConnectorConfig::new("http://127.0.0.1:12345", "a"),
            ],
            ..AppConfig::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate connector"));
    }

    #[test]
    fn test_invalid_connector_configs() {
        let cases = [
            "connectors:\n  - name: no-url\n",
            "connectors:\n  - url: http://127.0.0.1:12345\n    audit_key_id: 6\n",
            "connectors:\n  - url: http://127.0.0.1:12345\n    application_key_id: 3\n",
            "connectors:\n  - url: http://127.0.0.1:12345\n    audit_key_id: hello\n    audit_key_pin_path: a.pin\n",
            "connectors:\n  - url: http://127.0.0.1:12345\n    audit_key_id: 70000\n    audit_key_pin_path: a.pin\n",
            "connectors:\n  - 42\n",
        ];

        for yaml in cases {
            assert!(AppConfig::from_yaml(yaml).is_err(), "accepted: {yaml}");
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "probe_interval: 1m").unwrap();
        writeln!(file, "connectors:").unwrap();
        writeln!(file, "  - url: http://127.0.0.1:12345").unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.probe_interval, Duration::from_secs(60));
        assert_eq!(config.connectors.len(), 1);
    }

    #[test]
    fn test_load_sample_config() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/configs/config.yaml");
        let config = AppConfig::load(path).unwrap();

        assert_eq!(config.connectors.len(), 2);
        assert_eq!(config.connectors[0].audit_key_id, Some(6));
        assert_eq!(config.connectors[1].application_key_id, None);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            AppConfig::load("/nonexistent/config.yaml"),
            Err(ConfigError::IoError(_))
        ));
    }
}
