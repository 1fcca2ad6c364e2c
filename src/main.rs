//! yubihsm-exporter binary entry point.
//!
//! Loads the configuration, reads the PIN files, then runs the probe
//! scheduler and the metrics server until SIGINT or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use yubihsm_exporter::{
    config::{AppConfig, parse_duration},
    hsm::http::HttpConnector,
    metrics::ProbeMetrics,
    probe::DeviceProbe,
    scheduler::{ProbeScheduler, StopHandle},
    server::{create_router, serve},
};

/// YubiHSM health prober and Prometheus exporter
#[derive(Parser, Debug)]
#[command(name = "yubihsm-exporter", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "/etc/yubihsm-exporter/config.yaml",
        env = "YUBIHSM_EXPORTER_CONFIG"
    )]
    config: String,

    /// Metrics server bind address (overrides config file)
    #[arg(long, env = "YUBIHSM_EXPORTER_BIND")]
    bind: Option<String>,

    /// Metrics server port (overrides config file)
    #[arg(long, env = "YUBIHSM_EXPORTER_PORT")]
    port: Option<u16>,

    /// Pause between two probe sweeps, e.g. `5s` (overrides config file)
    #[arg(long, env = "YUBIHSM_EXPORTER_INTERVAL", value_parser = parse_duration)]
    interval: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,yubihsm_exporter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tracing::info!(path = %cli.config, "Loading configuration");
    let mut config = AppConfig::load(&cli.config)?;

    // CLI > ENV > config file
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(interval) = cli.interval {
        config.probe_interval = interval;
    }
    config.validate()?;

    let metrics = Arc::new(ProbeMetrics::new()?);

    let mut probes = Vec::with_capacity(config.connectors.len());
    for connector_config in &config.connectors {
        let credentials = connector_config.load_credentials()?;
        let mut connector = HttpConnector::new(connector_config.timeout)?;
        // The client reads device info inside an authenticated session.
        if let Some(key) = credentials.audit.as_ref().or(credentials.application.as_ref()) {
            connector = connector.with_info_key(key.key_id, key.pin.clone());
        }
        let crypto_test = credentials.application.is_some()
            && connector_config.encryption_key_label.is_some();
        tracing::info!(
            url = %connector_config.url,
            name = %connector_config.name,
            audit = credentials.audit.is_some(),
            crypto_test,
            "Configured device"
        );
        probes.push(DeviceProbe::new(
            connector_config.clone(),
            credentials,
            metrics.clone(),
            Arc::new(connector),
        ));
    }
    if probes.is_empty() {
        tracing::warn!("No connectors configured, only the metrics server will run");
    }

    let (stop_handle, stop) = StopHandle::channel();
    tokio::spawn(shutdown_signal(stop_handle.clone()));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let router = create_router(metrics);
    let server = tokio::spawn({
        let stop_handle = stop_handle.clone();
        async move {
            let result = serve(addr, router, stop_handle.subscribe()).await;
            if !stop_handle.is_stop_requested() {
                tracing::error!("Metrics server exited before a stop was requested");
            }
            // Also stops the scheduler when the server fails.
            stop_handle.request_stop();
            result
        }
    });

    let mut scheduler = ProbeScheduler::new(probes, config.probe_interval);
    scheduler.run(stop).await;
    server.await??;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Request a stop on every SIGINT / SIGTERM.
async fn shutdown_signal(stop: StopHandle) {
    #[cfg(unix)]
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                None
            }
        };

    loop {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match sigterm.as_mut() {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {
                tracing::info!("Received Ctrl+C signal");
            }
            () = terminate => {
                tracing::info!("Received terminate signal");
            }
        }

        stop.request_stop();
    }
}
