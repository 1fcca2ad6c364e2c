//! Fixed-cadence probe loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::probe::{DeviceProbe, ProbeReport};

/// Lifecycle of a [`ProbeScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    /// Terminal.
    Stopping,
}

/// Requests a cooperative stop of the scheduler and the metrics server.
///
/// Cheap to clone. Requesting a stop more than once has no further effect.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Create a handle together with a first receiver.
    pub fn channel() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn request_stop(&self) {
        let already = self.tx.send_replace(true);
        if !already {
            tracing::info!("Stop requested");
        }
    }

    /// Whether a stop was requested on any clone of this handle.
    pub fn is_stop_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolves once a stop is requested; never resolves if no stop can come.
pub async fn stopped(mut stop: watch::Receiver<bool>) {
    if stop.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Runs every device probe in declared order, then sleeps.
#[derive(Debug)]
pub struct ProbeScheduler {
    probes: Vec<DeviceProbe>,
    interval: Duration,
    state: SchedulerState,
    sweeps: u64,
}

impl ProbeScheduler {
    pub fn new(probes: Vec<DeviceProbe>, interval: Duration) -> Self {
        Self {
            probes,
            interval,
            state: SchedulerState::Running,
            sweeps: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Number of completed sweeps.
    pub fn sweeps(&self) -> u64 {
        self.sweeps
    }

    pub fn probes(&self) -> &[DeviceProbe] {
        &self.probes
    }

    /// Probe every device once.
    pub async fn sweep(&mut self) -> Vec<ProbeReport> {
        let mut reports = Vec::with_capacity(self.probes.len());
        for probe in &mut self.probes {
            reports.push(probe.probe().await);
        }
        self.sweeps += 1;

        let failed = reports.iter().filter(|r| !r.is_success()).count();
        tracing::debug!(
            sweep = self.sweeps,
            devices = reports.len(),
            failed,
            "Sweep complete"
        );
        reports
    }

    /// Sweep until `stop` turns true.
    ///
    /// The flag is checked before each sweep; a sweep in progress always
    /// completes. A stop during the pause ends the pause at once.
    pub async fn run(&mut self, stop: watch::Receiver<bool>) {
        tracing::info!(
            devices = self.probes.len(),
            interval = ?self.interval,
            "Probe scheduler started"
        );

        while self.state == SchedulerState::Running {
            if *stop.borrow() {
                self.state = SchedulerState::Stopping;
                break;
            }

            self.sweep().await;

            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                () = stopped(stop.clone()) => self.state = SchedulerState::Stopping,
            }
        }

        tracing::info!(sweeps = self.sweeps, "Probe scheduler stopped");
    }
}
