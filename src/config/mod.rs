//! Configuration module for the exporter.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Probe cadence
//! - Connector definitions (URL, name, keys, PIN files, timeout)

mod app;
mod connector;
mod validation;

pub use app::{AppConfig, DEFAULT_PORT, DEFAULT_PROBE_INTERVAL, ServerConfig};
pub use connector::{
    ConnectorConfig, DEFAULT_CONNECTOR_TIMEOUT, DeviceCredentials, KeyCredentials,
};
pub use validation::{ConfigError, expand_env_vars, load_pin, parse_duration};
