//! End-to-end tests: several devices probed by one scheduler, scraped over HTTP.

use std::io::{ErrorKind as IoErrorKind, Write};
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use yubihsm_exporter::hsm::mock::{MockConnector, MockDevice};
use yubihsm_exporter::{
    AppConfig, DeviceProbe, ErrorKind, ProbeMetrics, ProbeOutcome, ProbeScheduler, StopHandle,
    server::create_router,
};

// =============================================================================
// Test Helpers
// =============================================================================

const HEALTHY_URL: &str = "http://10.0.0.1:12345";
const SWAPPED_URL: &str = "http://10.0.0.2:12345";
const UNREACHABLE_URL: &str = "http://10.0.0.3:12345";
const LABEL: &str = "vault-hsm-key";

fn pin_file(pin: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{pin}").unwrap();
    file
}

fn device(serial: u32) -> MockDevice {
    MockDevice::new(serial)
        .with_auth_key(6, "audit-password")
        .with_auth_key(3, "app-password")
        .with_rsa_key(0x200, LABEL)
        .with_log_entries(3)
}

/// Three devices: healthy, with swapped PIN files, and unreachable.
struct Scenario {
    scheduler: ProbeScheduler,
    metrics: Arc<ProbeMetrics>,
    config: AppConfig,
    connector: MockConnector,
    _pins: (NamedTempFile, NamedTempFile),
}

fn scenario() -> Scenario {
    let audit_pin = pin_file("audit-password");
    let app_pin = pin_file("app-password");
    let audit = audit_pin.path().display().to_string();
    let app = app_pin.path().display().to_string();

    let yaml = format!(
        r#"
probe_interval: 5s
connectors:
  - url: {HEALTHY_URL}
    name: healthy
    audit_key_id: 6
    audit_key_pin_path: {audit}
    application_key_id: 3
    application_key_pin_path: {app}
    encryption_key_label: {LABEL}
  - url: {SWAPPED_URL}
    name: swapped
    audit_key_id: 6
    audit_key_pin_path: {app}
    application_key_id: 3
    application_key_pin_path: {audit}
    encryption_key_label: {LABEL}
  - url: {UNREACHABLE_URL}
    name: unreachable
    audit_key_id: 6
    audit_key_pin_path: {audit}
    application_key_id: 3
    application_key_pin_path: {app}
    encryption_key_label: {LABEL}
"#
    );
    let config = AppConfig::from_yaml(&yaml).unwrap();

    let connector = MockConnector::new()
        .with_device(HEALTHY_URL, device(1001))
        .with_device(SWAPPED_URL, device(1002));
    let metrics = Arc::new(ProbeMetrics::new().unwrap());

    let probes = config
        .connectors
        .iter()
        .map(|c| {
            DeviceProbe::new(
                c.clone(),
                c.load_credentials().unwrap(),
                metrics.clone(),
                Arc::new(connector.clone()),
            )
        })
        .collect();

    Scenario {
        scheduler: ProbeScheduler::new(probes, config.probe_interval),
        metrics,
        config,
        connector,
        _pins: (audit_pin, app_pin),
    }
}

// =============================================================================
// Multi-device scenario
// =============================================================================

#[tokio::test]
async fn test_three_device_scenario() {
    let mut scenario = scenario();
    let labels: Vec<_> = scenario.config.connectors.iter().map(|c| c.labels()).collect();
    let (healthy, swapped, unreachable) = (&labels[0], &labels[1], &labels[2]);
    let sweeps = 5u64;

    for _ in 0..sweeps {
        let reports = scenario.scheduler.sweep().await;
        assert!(reports[0].is_success());
        assert_eq!(
            reports[1].failures(),
            vec![
                ProbeOutcome::LogRetrievalFailure,
                ProbeOutcome::CryptoTestFailure
            ]
        );
        assert_eq!(reports[2].outcome(), ProbeOutcome::ConnectionFailure);
    }

    let metrics = &scenario.metrics;
    for labels in &labels {
        assert_eq!(metrics.connection_attempts(labels), sweeps);
    }

    assert_eq!(metrics.errors(healthy, ErrorKind::Connection), 0);
    assert_eq!(metrics.errors(healthy, ErrorKind::GetLogs), 0);
    assert_eq!(metrics.errors(healthy, ErrorKind::CryptoTest), 0);

    assert_eq!(metrics.errors(swapped, ErrorKind::Connection), 0);
    assert_eq!(metrics.errors(swapped, ErrorKind::GetLogs), sweeps);
    assert_eq!(metrics.errors(swapped, ErrorKind::CryptoTest), sweeps);

    assert_eq!(metrics.errors(unreachable, ErrorKind::Connection), sweeps);
    assert_eq!(metrics.errors(unreachable, ErrorKind::GetLogs), 0);
    assert_eq!(metrics.errors(unreachable, ErrorKind::CryptoTest), 0);

    // Healthy device: every sweep adds four audited commands and drains the log,
    // an odd sweep count leaves the secret encrypted.
    let healthy_device = scenario.connector.device(HEALTHY_URL).unwrap();
    assert_eq!(healthy_device.log_index(), 20);
    // Read at connect time, after the previous crypto session added three entries.
    assert_eq!(metrics.log_usage(healthy), Some((62, 3)));
    assert_eq!(healthy_device.sessions_opened(), healthy_device.sessions_closed());
    assert!(scenario.scheduler.probes()[0].secret().is_encrypted());

    // Swapped device: its audit log stays untouched.
    let swapped_device = scenario.connector.device(SWAPPED_URL).unwrap();
    assert_eq!(swapped_device.log_index(), 0);
    assert_eq!(metrics.log_usage(swapped), Some((62, 3)));
    assert_eq!(metrics.log_usage(unreachable), None);
}

#[tokio::test]
async fn test_unreachable_device_recovers() {
    let mut scenario = scenario();
    let unreachable = scenario.config.connectors[2].labels();

    scenario.scheduler.sweep().await;
    scenario.connector.add_device(UNREACHABLE_URL, device(1003));
    let reports = scenario.scheduler.sweep().await;

    assert!(reports[2].is_success());
    assert_eq!(scenario.metrics.errors(&unreachable, ErrorKind::Connection), 1);
    assert_eq!(
        scenario.metrics.device_info(&unreachable),
        Some(("2.4.0".to_string(), "1003".to_string()))
    );
}

// =============================================================================
// Scheduler + metrics server
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_scheduler_runs_until_stopped() {
    let Scenario {
        mut scheduler,
        metrics,
        config,
        _pins,
        ..
    } = scenario();
    let (handle, stop) = StopHandle::channel();

    let task = tokio::spawn(async move {
        scheduler.run(stop).await;
        scheduler
    });

    // Sweeps at t=0s, 5s and 10s.
    tokio::time::sleep(Duration::from_secs(11)).await;
    handle.request_stop();
    handle.request_stop();
    let scheduler = task.await.unwrap();

    assert_eq!(scheduler.sweeps(), 3);
    let swapped = config.connectors[1].labels();
    assert_eq!(metrics.errors(&swapped, ErrorKind::GetLogs), 3);
}

#[tokio::test]
async fn test_scrape_over_http() {
    let mut scenario = scenario();
    scenario.scheduler.sweep().await;

    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) if e.kind() == IoErrorKind::PermissionDenied => return,
        Err(e) => panic!("Failed to bind test listener: {e}"),
    };
    let addr = listener.local_addr().unwrap();
    let router = create_router(scenario.metrics.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .expect("Failed to send metrics request");
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();

    assert!(body.contains("yubihsm_test_connections_total{"));
    assert!(body.contains("name=\"unreachable\""));
    assert!(body.contains("error=\"get_logs\""));
    assert!(body.contains("serial=\"1001\""));

    let resp = client
        .get(format!("http://{addr}/healthz"))
        .send()
        .await
        .expect("Failed to send healthz request");
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
    assert_eq!(body["status"], "ok");
}
