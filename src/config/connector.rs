//! Per-device connector configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::metrics::DeviceLabels;

use super::validation::{ConfigError, expand_env_vars, load_pin};

/// Default connector request timeout (10 seconds).
pub const DEFAULT_CONNECTOR_TIMEOUT: Duration = Duration::from_secs(10);

fn default_timeout() -> Duration {
    DEFAULT_CONNECTOR_TIMEOUT
}

/// One HSM reached through a connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorConfig {
    /// Connector base URL, e.g. `http://127.0.0.1:12345`.
    pub url: String,

    /// Display name used in metric labels (default: empty).
    #[serde(default)]
    pub name: String,

    /// Authentication key for the audit log session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_key_id: Option<u16>,

    /// File holding the audit key PIN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_key_pin_path: Option<PathBuf>,

    /// Authentication key for the crypto test session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_key_id: Option<u16>,

    /// File holding the application key PIN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_key_pin_path: Option<PathBuf>,

    /// Label of the asymmetric key exercised by the crypto test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_label: Option<String>,

    /// Request timeout (default: 10s).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl ConnectorConfig {
    /// Create a reachability-only connector.
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            audit_key_id: None,
            audit_key_pin_path: None,
            application_key_id: None,
            application_key_pin_path: None,
            encryption_key_label: None,
            timeout: DEFAULT_CONNECTOR_TIMEOUT,
        }
    }

    /// Builder: enable audit log retrieval.
    #[must_use]
    pub fn with_audit_key(mut self, key_id: u16, pin_path: impl Into<PathBuf>) -> Self {
        self.audit_key_id = Some(key_id);
        self.audit_key_pin_path = Some(pin_path.into());
        self
    }

    /// Builder: enable the crypto round trip.
    #[must_use]
    pub fn with_application_key(
        mut self,
        key_id: u16,
        pin_path: impl Into<PathBuf>,
        label: impl Into<String>,
    ) -> Self {
        self.application_key_id = Some(key_id);
        self.application_key_pin_path = Some(pin_path.into());
        self.encryption_key_label = Some(label.into());
        self
    }

    /// Builder: set request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Metric label set of this device.
    pub fn labels(&self) -> DeviceLabels {
        DeviceLabels::new(&self.url, &self.name)
    }

    /// Expand `${VAR}` references in the URL and PIN paths.
    pub(crate) fn expand_env(&mut self) {
        self.url = expand_env_vars(&self.url);
        for path in [&mut self.audit_key_pin_path, &mut self.application_key_pin_path]
            .into_iter()
            .flatten()
        {
            *path = PathBuf::from(expand_env_vars(&path.to_string_lossy()));
        }
    }

    /// Validate this connector.
    ///
    /// # Errors
    /// Returns a message describing the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| format!("invalid URL '{}': {}", self.url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!(
                "URL '{}' must use http or https, got '{}'",
                self.url,
                url.scheme()
            ));
        }

        check_key("audit", self.audit_key_id, self.audit_key_pin_path.as_ref())?;
        check_key(
            "application",
            self.application_key_id,
            self.application_key_pin_path.as_ref(),
        )?;

        if self.timeout.is_zero() {
            return Err("timeout must be positive".to_string());
        }

        Ok(())
    }

    /// Read the configured PIN files.
    ///
    /// # Errors
    /// Returns `ConfigError::PinError` if a configured PIN file is unreadable.
    pub fn load_credentials(&self) -> Result<DeviceCredentials, ConfigError> {
        let resolve = |id: Option<u16>, path: Option<&PathBuf>| -> Result<_, ConfigError> {
            match (id, path) {
                (Some(key_id), Some(path)) => Ok(Some(KeyCredentials {
                    key_id,
                    pin: load_pin(path)?,
                })),
                _ => Ok(None),
            }
        };

        Ok(DeviceCredentials {
            audit: resolve(self.audit_key_id, self.audit_key_pin_path.as_ref())?,
            application: resolve(
                self.application_key_id,
                self.application_key_pin_path.as_ref(),
            )?,
        })
    }
}

fn check_key(role: &str, id: Option<u16>, pin_path: Option<&PathBuf>) -> Result<(), String> {
    match (id, pin_path) {
        (Some(0), _) => Err(format!("{role}_key_id must be non-zero")),
        (Some(_), None) => Err(format!(
            "{role}_key_id is set but {role}_key_pin_path is missing"
        )),
        (None, Some(_)) => Err(format!(
            "{role}_key_pin_path is set but {role}_key_id is missing"
        )),
        _ => Ok(()),
    }
}

/// Authentication key id with its PIN.
#[derive(Clone)]
pub struct KeyCredentials {
    pub key_id: u16,
    pub pin: Zeroizing<String>,
}

impl KeyCredentials {
    pub fn new(key_id: u16, pin: impl Into<String>) -> Self {
        Self {
            key_id,
            pin: Zeroizing::new(pin.into()),
        }
    }
}

impl std::fmt::Debug for KeyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCredentials")
            .field("key_id", &self.key_id)
            .field("pin", &"<redacted>")
            .finish()
    }
}

/// Credentials resolved for one device at startup.
#[derive(Debug, Clone, Default)]
pub struct DeviceCredentials {
    pub audit: Option<KeyCredentials>,
    pub application: Option<KeyCredentials>,
}
