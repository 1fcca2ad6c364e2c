//! Prometheus metrics for probed devices.
//!
//! Every series is keyed by the device label set `{url, name}`; writes for
//! one device never touch another device's series. Exposed families:
//!
//! | Metric | Type | Extra labels |
//! |---|---|---|
//! | `yubihsm_device_info` | gauge (always 1) | `version`, `serial` |
//! | `yubihsm_log_size` | gauge | |
//! | `yubihsm_used_log_entries` | gauge | |
//! | `yubihsm_test_connections_total` | counter | |
//! | `yubihsm_test_errors_total` | counter | `error` |

use std::collections::HashMap;
use std::sync::Mutex;

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Metric name prefix.
pub const NAMESPACE: &str = "yubihsm";

const DEVICE_LABELS: [&str; 2] = ["url", "name"];

/// Failure classes counted by `yubihsm_test_errors_total`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Connector unreachable or connection-level failure.
    Connection,
    /// Audit log retrieval failed.
    GetLogs,
    /// Encrypt/decrypt round trip failed.
    CryptoTest,
}

/// Identity of a device in every metric series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceLabels {
    pub url: String,
    pub name: String,
}

impl DeviceLabels {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
        }
    }

    fn values(&self) -> [&str; 2] {
        [&self.url, &self.name]
    }
}

/// Registry of all exporter metrics.
#[derive(Debug)]
pub struct ProbeMetrics {
    registry: Registry,
    device_info: IntGaugeVec,
    log_size: IntGaugeVec,
    used_log_entries: IntGaugeVec,
    test_connections: IntCounterVec,
    test_errors: IntCounterVec,
    published_info: Mutex<HashMap<DeviceLabels, (String, String)>>,
}

impl ProbeMetrics {
    /// Create the metric families and register them in a fresh registry.
    ///
    /// # Errors
    /// Returns `prometheus::Error` if a family cannot be registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let device_info = IntGaugeVec::new(
            Opts::new("device_info", "Information about YubiHSM2 device").namespace(NAMESPACE),
            &["url", "name", "version", "serial"],
        )?;
        let log_size = IntGaugeVec::new(
            Opts::new("log_size", "Number of log entry in YubiHSM").namespace(NAMESPACE),
            &DEVICE_LABELS,
        )?;
        let used_log_entries = IntGaugeVec::new(
            Opts::new("used_log_entries", "Number of used log entries in YubiHSM")
                .namespace(NAMESPACE),
            &DEVICE_LABELS,
        )?;
        let test_connections = IntCounterVec::new(
            Opts::new("test_connections_total", "Number test connections to YubiHSM")
                .namespace(NAMESPACE),
            &DEVICE_LABELS,
        )?;
        let test_errors = IntCounterVec::new(
            Opts::new("test_errors_total", "Number of failed YubiHSM test runs")
                .namespace(NAMESPACE),
            &["url", "name", "error"],
        )?;

        registry.register(Box::new(device_info.clone()))?;
        registry.register(Box::new(log_size.clone()))?;
        registry.register(Box::new(used_log_entries.clone()))?;
        registry.register(Box::new(test_connections.clone()))?;
        registry.register(Box::new(test_errors.clone()))?;

        Ok(Self {
            registry,
            device_info,
            log_size,
            used_log_entries,
            test_connections,
            test_errors,
            published_info: Mutex::new(HashMap::new()),
        })
    }

    /// Count one connection attempt.
    pub fn record_connection_attempt(&self, labels: &DeviceLabels) {
        self.test_connections
            .with_label_values(&labels.values())
            .inc();
    }

    /// Count one failure of class `kind`.
    pub fn record_error(&self, labels: &DeviceLabels, kind: ErrorKind) {
        self.test_errors
            .with_label_values(&[labels.url.as_str(), labels.name.as_str(), kind.as_ref()])
            .inc();
    }

    /// Publish firmware version and serial number.
    ///
    /// A previous info series with different values is removed so each
    /// device exposes exactly one.
    pub fn set_device_info(&self, labels: &DeviceLabels, version: &str, serial: &str) {
        let mut published = self
            .published_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let current = (version.to_string(), serial.to_string());
        if let Some(previous) = published.get(labels) {
            if *previous == current {
                return;
            }
            let _ = self.device_info.remove_label_values(&[
                labels.url.as_str(),
                labels.name.as_str(),
                previous.0.as_str(),
                previous.1.as_str(),
            ]);
        }

        self.device_info
            .with_label_values(&[labels.url.as_str(), labels.name.as_str(), version, serial])
            .set(1);
        published.insert(labels.clone(), current);
    }

    /// Publish audit log capacity and usage.
    pub fn set_log_usage(&self, labels: &DeviceLabels, capacity: u8, used: u8) {
        self.log_size
            .with_label_values(&labels.values())
            .set(i64::from(capacity));
        self.used_log_entries
            .with_label_values(&labels.values())
            .set(i64::from(used));
    }

    /// Render all families in the Prometheus text exposition format.
    ///
    /// # Errors
    /// Returns `prometheus::Error` if encoding fails.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Content type of [`ProbeMetrics::render`] output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

// Read-back helpers for tests and tooling, hidden from the documented API.
// Every lookup gathers the whole registry; the scrape path uses `render`.
impl ProbeMetrics {
    /// Published `(version, serial)` for a device.
    #[doc(hidden)]
    pub fn device_info(&self, labels: &DeviceLabels) -> Option<(String, String)> {
        self.published_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(labels)
            .cloned()
    }

    /// Current value of `yubihsm_test_connections_total`.
    #[doc(hidden)]
    pub fn connection_attempts(&self, labels: &DeviceLabels) -> u64 {
        self.sample("test_connections_total", labels, None)
            .map_or(0, |v| v as u64)
    }

    /// Current value of `yubihsm_test_errors_total` for `kind`.
    #[doc(hidden)]
    pub fn errors(&self, labels: &DeviceLabels, kind: ErrorKind) -> u64 {
        self.sample("test_errors_total", labels, Some(kind))
            .map_or(0, |v| v as u64)
    }

    /// Current `(log_size, used_log_entries)`, if published.
    #[doc(hidden)]
    pub fn log_usage(&self, labels: &DeviceLabels) -> Option<(i64, i64)> {
        let size = self.sample("log_size", labels, None)?;
        let used = self.sample("used_log_entries", labels, None)?;
        Some((size as i64, used as i64))
    }

    /// Look up one sample without creating the series.
    fn sample(&self, metric: &str, labels: &DeviceLabels, error: Option<ErrorKind>) -> Option<f64> {
        let family_name = format!("{NAMESPACE}_{metric}");
        let families = self.registry.gather();
        let family = families.iter().find(|f| f.name() == family_name)?;

        family.get_metric().iter().find_map(|m| {
            let pairs = m.get_label();
            let label = |name: &str| {
                pairs
                    .iter()
                    .find(|p| p.name() == name)
                    .map(|p| p.value())
            };
            let matches = label("url") == Some(labels.url.as_str())
                && label("name") == Some(labels.name.as_str())
                && error.is_none_or(|kind| label("error") == Some(kind.as_ref()));
            if !matches {
                return None;
            }
            if m.get_counter().is_some() {
                Some(m.get_counter().value())
            } else {
                Some(m.get_gauge().value())
            }
        })
    }
}
