//! HSM-specific error types.
//!
//! Every backend maps its failures onto [`HsmError`]. The probe engine only
//! distinguishes one variant on its own: [`HsmError::LogCursorConflict`], which
//! is tolerated while acknowledging audit entries.

use std::fmt;

use strum_macros::AsRefStr;
use thiserror::Error;

/// Errors reported by a connector, device or session.
#[derive(Debug, Error)]
pub enum HsmError {
    /// Connector unreachable or transport-level failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// The device answered with an error code.
    #[error("device error: {0}")]
    Device(DeviceErrorCode),

    /// Another reader already moved the audit log cursor past the requested index.
    #[error("log index {requested} is behind the device log cursor")]
    LogCursorConflict {
        /// Index the caller tried to acknowledge.
        requested: u16,
    },

    /// The device answered with data that could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Operation not available with this backend.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl From<reqwest::Error> for HsmError {
    fn from(err: reqwest::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Error codes reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceErrorCode {
    InvalidCommand,
    InvalidData,
    InvalidSession,
    AuthenticationFailed,
    SessionsFull,
    SessionFailed,
    StorageFailed,
    WrongLength,
    InsufficientPermissions,
    LogFull,
    ObjectNotFound,
    InvalidId,
    InvalidOtp,
    DemoMode,
    CommandUnexecuted,
    GenericError,
    ObjectExists,
    SshCaConstraintViolation,
    Unknown(u8),
}

impl DeviceErrorCode {
    /// Decode a device error byte.
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x01 => Self::InvalidCommand,
            0x02 => Self::InvalidData,
            0x03 => Self::InvalidSession,
            0x04 => Self::AuthenticationFailed,
            0x05 => Self::SessionsFull,
            0x06 => Self::SessionFailed,
            0x07 => Self::StorageFailed,
            0x08 => Self::WrongLength,
            0x09 => Self::InsufficientPermissions,
            0x0a => Self::LogFull,
            0x0b => Self::ObjectNotFound,
            0x0c => Self::InvalidId,
            0x0d => Self::InvalidOtp,
            0x0e => Self::DemoMode,
            0x0f => Self::CommandUnexecuted,
            0x10 => Self::GenericError,
            0x11 => Self::ObjectExists,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown({code:#04x})"),
            known => f.write_str(known.as_ref()),
        }
    }
}
