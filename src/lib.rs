//! YubiHSM health prober and Prometheus exporter.
//!
//! Periodically connects to one or more YubiHSM devices through their
//! connectors, checks that they answer, drains their audit logs and proves
//! that an encryption key still round-trips data. Results are exposed as
//! Prometheus metrics keyed by `{url, name}`.
//!
//! # Architecture
//!
//! - **Config**: YAML configuration of the server and the probed connectors
//! - **HSM**: connector abstraction with HTTP and in-memory backends
//! - **Probe**: one health check of one device, isolating failures per phase
//! - **Scheduler**: sweeps all probes on a fixed interval until stopped
//! - **Metrics / Server**: Prometheus registry and its scrape endpoint
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use yubihsm_exporter::{
//!     ConnectorConfig, DeviceCredentials, DeviceProbe, ProbeMetrics, ProbeScheduler, StopHandle,
//!     hsm::http::HttpConnector,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let metrics = Arc::new(ProbeMetrics::new()?);
//!     let connector = Arc::new(HttpConnector::new(Duration::from_secs(10))?);
//!     let probe = DeviceProbe::new(
//!         ConnectorConfig::new("http://127.0.0.1:12345", "primary"),
//!         DeviceCredentials::default(),
//!         metrics.clone(),
//!         connector,
//!     );
//!
//!     let (_handle, stop) = StopHandle::channel();
//!     ProbeScheduler::new(vec![probe], Duration::from_secs(5))
//!         .run(stop)
//!         .await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod hsm;
pub mod metrics;
pub mod probe;
pub mod scheduler;
pub mod secret;
pub mod server;

pub use config::{AppConfig, ConfigError, ConnectorConfig, DeviceCredentials, KeyCredentials};
pub use hsm::{Connector, Device, HsmError, Session};
pub use metrics::{DeviceLabels, ErrorKind, ProbeMetrics};
pub use probe::{DeviceProbe, PhaseStatus, ProbeError, ProbeOutcome, ProbeReport};
pub use scheduler::{ProbeScheduler, SchedulerState, StopHandle};
pub use secret::RoundTripSecret;
