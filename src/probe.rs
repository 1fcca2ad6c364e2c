//! Per-device health probe.
//!
//! One [`DeviceProbe::probe`] call runs a full check of one device:
//!
//! 1. connect and read device info (firmware, serial, audit log usage)
//! 2. fetch and acknowledge audit log entries (audit key)
//! 3. advance the round-trip secret on the device (application key)
//!
//! Only a connection failure ends the check early. Audit log and crypto test
//! failures are counted independently, and no failure escapes `probe()`.

use std::sync::Arc;

use thiserror::Error;

use crate::config::{ConnectorConfig, DeviceCredentials, KeyCredentials};
use crate::hsm::{Connector, Device, DeviceInfo, HsmError, Session};
use crate::metrics::{DeviceLabels, ErrorKind, ProbeMetrics};
use crate::secret::{DEFAULT_PAYLOAD, RoundTripSecret};

/// Errors raised inside a probe phase.
///
/// These never leave [`DeviceProbe::probe`]; they are logged and counted.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The device or connector reported an error.
    #[error(transparent)]
    Hsm(#[from] HsmError),

    /// The encryption key label did not select exactly one key.
    #[error("expected exactly one key labelled '{label}', found {found}")]
    KeyLookup { label: String, found: usize },

    /// Decryption returned something other than the default payload.
    #[error("decryption returned '{actual}', expected '{expected}'")]
    Mismatch { expected: String, actual: String },
}

/// Classification of one probe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    ConnectionFailure,
    LogRetrievalFailure,
    CryptoTestFailure,
}

/// Result of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Passed,
    /// Not configured, or not reached after a connection failure.
    Skipped,
    Failed,
}

/// What happened during one [`DeviceProbe::probe`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub connection: PhaseStatus,
    pub audit_log: PhaseStatus,
    pub crypto_test: PhaseStatus,
    /// Device info, when the device answered and the backend can read it.
    pub device_info: Option<DeviceInfo>,
}

impl ProbeReport {
    fn new() -> Self {
        Self {
            connection: PhaseStatus::Skipped,
            audit_log: PhaseStatus::Skipped,
            crypto_test: PhaseStatus::Skipped,
            device_info: None,
        }
    }

    /// Every failure of this cycle, in phase order.
    pub fn failures(&self) -> Vec<ProbeOutcome> {
        [
            (self.connection, ProbeOutcome::ConnectionFailure),
            (self.audit_log, ProbeOutcome::LogRetrievalFailure),
            (self.crypto_test, ProbeOutcome::CryptoTestFailure),
        ]
        .into_iter()
        .filter(|(status, _)| *status == PhaseStatus::Failed)
        .map(|(_, outcome)| outcome)
        .collect()
    }

    /// First failure in phase order, or `Success`.
    pub fn outcome(&self) -> ProbeOutcome {
        self.failures()
            .first()
            .copied()
            .unwrap_or(ProbeOutcome::Success)
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == ProbeOutcome::Success
    }
}

/// Health probe bound to one device.
pub struct DeviceProbe {
    config: ConnectorConfig,
    labels: DeviceLabels,
    credentials: DeviceCredentials,
    metrics: Arc<ProbeMetrics>,
    connector: Arc<dyn Connector>,
    secret: RoundTripSecret,
}

impl DeviceProbe {
    /// Create a probe for the device described by `config`.
    ///
    /// `credentials` are the PINs resolved at startup.
    pub fn new(
        config: ConnectorConfig,
        credentials: DeviceCredentials,
        metrics: Arc<ProbeMetrics>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let labels = config.labels();
        if credentials.application.is_some() && config.encryption_key_label.is_none() {
            tracing::warn!(
                url = %labels.url,
                name = %labels.name,
                "Application key configured without encryption_key_label, crypto test disabled"
            );
        }

        Self {
            config,
            labels,
            credentials,
            metrics,
            connector,
            secret: RoundTripSecret::default(),
        }
    }

    /// Label set of the probed device.
    pub fn labels(&self) -> &DeviceLabels {
        &self.labels
    }

    /// Current state of the round-trip secret.
    pub fn secret(&self) -> &RoundTripSecret {
        &self.secret
    }

    /// Run one full check. Never fails; the outcome is in the report.
    pub async fn probe(&mut self) -> ProbeReport {
        let mut report = ProbeReport::new();

        self.metrics.record_connection_attempt(&self.labels);
        let device = match self.connect().await {
            Ok((device, info)) => {
                report.device_info = info;
                device
            }
            Err(e) => {
                self.fail(ErrorKind::Connection, &e);
                report.connection = PhaseStatus::Failed;
                return report;
            }
        };
        report.connection = PhaseStatus::Passed;

        if let Some(credentials) = &self.credentials.audit {
            let result = audit_log_phase(device.as_ref(), credentials, &self.labels).await;
            report.audit_log = match result {
                Ok(()) => PhaseStatus::Passed,
                Err(e) => {
                    self.fail(ErrorKind::GetLogs, &e);
                    PhaseStatus::Failed
                }
            };
        }

        if let (Some(credentials), Some(label)) = (
            &self.credentials.application,
            self.config.encryption_key_label.as_deref(),
        ) {
            let result = crypto_test_phase(
                device.as_ref(),
                credentials,
                label,
                &mut self.secret,
                &self.labels,
            )
            .await;
            report.crypto_test = match result {
                Ok(()) => PhaseStatus::Passed,
                Err(e) => {
                    self.fail(ErrorKind::CryptoTest, &e);
                    PhaseStatus::Failed
                }
            };
        }

        report
    }

    async fn connect(&self) -> Result<(Box<dyn Device>, Option<DeviceInfo>), ProbeError> {
        let device = self.connector.connect(&self.config.url).await?;
        let info = match device.device_info().await {
            Ok(info) => info,
            Err(HsmError::Unsupported(reason)) => {
                tracing::debug!(
                    url = %self.labels.url,
                    name = %self.labels.name,
                    reason,
                    "Connected to device, device info not available"
                );
                return Ok((device, None));
            }
            Err(e) => return Err(e.into()),
        };

        let version = info.version.to_string();
        let serial = info.serial.to_string();
        tracing::debug!(
            url = %self.labels.url,
            name = %self.labels.name,
            version = %version,
            serial = %serial,
            log_used = info.log_used,
            log_capacity = info.log_capacity,
            "Connected to device"
        );
        self.metrics.set_device_info(&self.labels, &version, &serial);
        self.metrics
            .set_log_usage(&self.labels, info.log_capacity, info.log_used);

        Ok((device, Some(info)))
    }

    fn fail(&self, phase: ErrorKind, error: &ProbeError) {
        tracing::error!(
            url = %self.labels.url,
            name = %self.labels.name,
            phase = %phase,
            error = %error,
            "Probe phase failed"
        );
        self.metrics.record_error(&self.labels, phase);
    }
}

impl std::fmt::Debug for DeviceProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProbe")
            .field("labels", &self.labels)
            .field("credentials", &self.credentials)
            .field("secret", &self.secret)
            .finish_non_exhaustive()
    }
}

// Phases close their session on every path; a close error fails the phase
// unless it already failed.
async fn open_session(
    device: &dyn Device,
    credentials: &KeyCredentials,
) -> Result<Box<dyn Session>, ProbeError> {
    Ok(device
        .open_session(credentials.key_id, &credentials.pin)
        .await?)
}

async fn audit_log_phase(
    device: &dyn Device,
    credentials: &KeyCredentials,
    labels: &DeviceLabels,
) -> Result<(), ProbeError> {
    let session = open_session(device, credentials).await?;
    let result = retrieve_logs(session.as_ref(), labels).await;
    let closed = session.close().await;
    result?;
    closed?;
    Ok(())
}

async fn retrieve_logs(session: &dyn Session, labels: &DeviceLabels) -> Result<(), ProbeError> {
    let entries = session.log_entries().await?;

    for entry in &entries {
        tracing::info!(
            url = %labels.url,
            name = %labels.name,
            number = entry.number,
            command = entry.command,
            length = entry.length,
            session_key = entry.session_key,
            target_key = entry.target_key,
            second_key = entry.second_key,
            result = entry.result,
            tick = entry.tick,
            digest = %hex::encode(&entry.digest),
            "Audit log entry"
        );
    }

    if let Some(last) = entries.last() {
        match session.set_log_index(last.number).await {
            Ok(()) => {}
            Err(HsmError::LogCursorConflict { requested }) => {
                tracing::debug!(
                    url = %labels.url,
                    name = %labels.name,
                    requested,
                    "Audit log cursor already advanced by another reader"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(
        url = %labels.url,
        name = %labels.name,
        count = entries.len(),
        "Retrieved logs successfully"
    );
    Ok(())
}

async fn crypto_test_phase(
    device: &dyn Device,
    credentials: &KeyCredentials,
    label: &str,
    secret: &mut RoundTripSecret,
    labels: &DeviceLabels,
) -> Result<(), ProbeError> {
    let session = open_session(device, credentials).await?;
    let result = round_trip(session.as_ref(), label, secret, labels).await;
    let closed = session.close().await;
    result?;
    closed?;
    Ok(())
}

async fn round_trip(
    session: &dyn Session,
    label: &str,
    secret: &mut RoundTripSecret,
    labels: &DeviceLabels,
) -> Result<(), ProbeError> {
    let was_encrypted = secret.is_encrypted();
    let key_id = match process_with_key(session, label, secret).await {
        Ok(key_id) => key_id,
        Err(e) => {
            // Ciphertext the device cannot decrypt would stay stuck; start over.
            if was_encrypted {
                secret.reset();
                tracing::warn!(
                    url = %labels.url,
                    name = %labels.name,
                    "Discarded undecryptable ciphertext, round trip restarts"
                );
            }
            return Err(e);
        }
    };

    let (data, encrypted) = secret.current();
    if encrypted {
        tracing::info!(
            url = %labels.url,
            name = %labels.name,
            key_id,
            data = %data,
            "Encrypted data"
        );
        return Ok(());
    }

    tracing::info!(
        url = %labels.url,
        name = %labels.name,
        key_id,
        data = %data,
        "Decrypted data"
    );
    if !secret.is_default() {
        secret.reset();
        return Err(ProbeError::Mismatch {
            expected: DEFAULT_PAYLOAD.to_string(),
            actual: data,
        });
    }
    Ok(())
}

/// Look up the key by label and advance the secret; returns the key id.
async fn process_with_key(
    session: &dyn Session,
    label: &str,
    secret: &mut RoundTripSecret,
) -> Result<u16, ProbeError> {
    let keys = session.find_keys(label).await?;
    let [key] = keys.as_slice() else {
        return Err(ProbeError::KeyLookup {
            label: label.to_string(),
            found: keys.len(),
        });
    };

    secret
        .process(
            |data| async move { session.public_encrypt(key, &data).await },
            |data| async move { session.private_decrypt(key, &data).await },
        )
        .await?;
    Ok(key.id)
}
