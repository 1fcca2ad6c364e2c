//! HSM connector abstraction.
//!
//! The probe engine never speaks the device protocol itself. It drives a
//! device through three async traits that mirror how a YubiHSM is reached:
//!
//! - [`Connector`]: opens a handle to the device behind a connector URL
//! - [`Device`]: unauthenticated device queries and session creation
//! - [`Session`]: authenticated operations (audit log, key lookup, RSA)
//!
//! Backends:
//!
//! - [`http::HttpConnector`]: `yubihsm-connector` daemon, driven by [`yubihsm::Client`]
//! - [`mock::MockConnector`]: in-memory devices for tests and dry runs

mod error;
pub mod http;
pub mod mock;

use std::fmt;

pub use error::{DeviceErrorCode, HsmError};

/// Firmware version of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Identity and audit log usage of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Firmware version triple.
    pub version: FirmwareVersion,
    /// Device serial number.
    pub serial: u32,
    /// Total number of audit log slots.
    pub log_capacity: u8,
    /// Number of audit log slots currently in use.
    pub log_used: u8,
}

/// One audit log record as stored on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Monotonic sequence number of the entry.
    pub number: u16,
    /// Command code that was executed.
    pub command: u8,
    /// Length of the command payload.
    pub length: u16,
    /// Authentication key of the session that issued the command.
    pub session_key: u16,
    /// Primary object the command operated on.
    pub target_key: u16,
    /// Secondary object, if any.
    pub second_key: u16,
    /// Result code returned by the device.
    pub result: u8,
    /// Device tick counter at execution time.
    pub tick: u32,
    /// Chained digest of this entry.
    pub digest: Vec<u8>,
}

/// Reference to an asymmetric key object stored on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    /// Object id.
    pub id: u16,
    /// Object label.
    pub label: String,
}

/// Opens handles to devices behind connector URLs.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the connector at `url`.
    ///
    /// Any failure here is a connection-level failure of the device.
    async fn connect(&self, url: &str) -> Result<Box<dyn Device>, HsmError>;
}

/// A connected device.
#[async_trait::async_trait]
pub trait Device: Send + Sync {
    /// Read firmware version, serial number and audit log usage.
    ///
    /// Backends that cannot read it report [`HsmError::Unsupported`]; the
    /// device then only counts as reachable.
    async fn device_info(&self) -> Result<DeviceInfo, HsmError>;

    /// Open an authenticated session, deriving the session keys from `pin`.
    async fn open_session(&self, key_id: u16, pin: &str) -> Result<Box<dyn Session>, HsmError>;
}

/// An authenticated session on a device.
///
/// Callers must call [`Session::close`] on every exit path. Closing twice is
/// a no-op.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Fetch audit log entries not yet acknowledged on the device.
    async fn log_entries(&self) -> Result<Vec<LogEntry>, HsmError>;

    /// Acknowledge audit entries up to and including `index`.
    ///
    /// Returns [`HsmError::LogCursorConflict`] when another reader already
    /// acknowledged past `index`.
    async fn set_log_index(&self, index: u16) -> Result<(), HsmError>;

    /// List asymmetric key objects carrying `label`.
    async fn find_keys(&self, label: &str) -> Result<Vec<KeyHandle>, HsmError>;

    /// Encrypt `data` with the public half of `key`.
    ///
    /// PKCS#1 v1.5 padding where the backend can decrypt it; each backend
    /// uses the same padding for both halves of the round trip.
    async fn public_encrypt(&self, key: &KeyHandle, data: &[u8]) -> Result<Vec<u8>, HsmError>;

    /// Decrypt `data` with the private half of `key`.
    async fn private_decrypt(&self, key: &KeyHandle, data: &[u8]) -> Result<Vec<u8>, HsmError>;

    /// Close the session.
    async fn close(&self) -> Result<(), HsmError>;
}
