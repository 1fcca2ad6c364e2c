//! In-memory HSM backend.
//!
//! Simulates devices well enough to exercise every branch of the probe
//! engine without hardware: authentication keys with PINs, labelled RSA keys,
//! a pending audit log with a device-side cursor, and switches for the failure
//! modes seen in the field (cursor races, broken decryption, unreachable
//! connectors).
//!
//! "Encryption" is a reversible byte transform bound to the key id, so a
//! ciphertext only decrypts with the key that produced it.
//!
//! Like a device with command auditing on, successful session
//! authentications, key listings, public key reads and decryptions append
//! audit entries of their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    Connector, Device, DeviceErrorCode, DeviceInfo, FirmwareVersion, HsmError, KeyHandle,
    LogEntry, Session,
};

const CIPHER_MASK: u8 = 0xa5;

const CMD_AUTHENTICATE_SESSION: u8 = 0x04;
const CMD_LIST_OBJECTS: u8 = 0x48;
const CMD_DECRYPT_PKCS1: u8 = 0x49;
const CMD_GET_LOG_ENTRIES: u8 = 0x4d;
const CMD_GET_PUBLIC_KEY: u8 = 0x54;

/// Audit log capacity reported by simulated devices.
pub const MOCK_LOG_CAPACITY: u8 = 62;

/// Connector resolving URLs to in-memory devices.
///
/// URLs without a registered device behave like unreachable connectors.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device` behind `url`.
    pub fn with_device(self, url: impl Into<String>, device: MockDevice) -> Self {
        self.add_device(url, device);
        self
    }

    /// Register `device` behind `url`, replacing any previous one.
    pub fn add_device(&self, url: impl Into<String>, device: MockDevice) {
        lock(&self.devices).insert(url.into(), device);
    }

    /// Remove the device behind `url`, making the connector unreachable.
    pub fn remove_device(&self, url: &str) -> Option<MockDevice> {
        lock(&self.devices).remove(url)
    }

    /// Handle to the device behind `url`.
    pub fn device(&self, url: &str) -> Option<MockDevice> {
        lock(&self.devices).get(url).cloned()
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Device>, HsmError> {
        let device = self
            .device(url)
            .ok_or_else(|| HsmError::Connection(format!("no connector listening at {url}")))?;
        Ok(Box::new(device))
    }
}

#[derive(Debug)]
struct DeviceState {
    version: FirmwareVersion,
    serial: u32,
    auth_keys: HashMap<u16, String>,
    keys: Vec<KeyHandle>,
    log: Vec<LogEntry>,
    log_index: u16,
    cursor_conflict: bool,
    tampered_decrypt: bool,
    command_audit: bool,
    info_unsupported: bool,
    sessions_opened: usize,
    sessions_closed: usize,
    log_index_writes: Vec<u16>,
}

impl DeviceState {
    fn push_entry(&mut self, command: u8, session_key: u16, target_key: u16) -> u16 {
        let number = self
            .log
            .last()
            .map(|entry| entry.number.wrapping_add(1))
            .unwrap_or(self.log_index.wrapping_add(1));
        let tick = u32::from(number) * 10;
        self.log.push(LogEntry {
            number,
            command,
            length: 3,
            session_key,
            target_key,
            second_key: 0xffff,
            result: command | 0x80,
            tick,
            digest: number.to_be_bytes().repeat(8),
        });
        number
    }

    fn audit(&mut self, command: u8, session_key: u16, target_key: u16) {
        if self.command_audit {
            self.push_entry(command, session_key, target_key);
        }
    }
}

/// Simulated device; clones share state.
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    /// Create a device with the given serial number and an empty audit log.
    pub fn new(serial: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                version: FirmwareVersion {
                    major: 2,
                    minor: 4,
                    build: 0,
                },
                serial,
                auth_keys: HashMap::new(),
                keys: Vec::new(),
                log: Vec::new(),
                log_index: 0,
                cursor_conflict: false,
                tampered_decrypt: false,
                command_audit: true,
                info_unsupported: false,
                sessions_opened: 0,
                sessions_closed: 0,
                log_index_writes: Vec::new(),
            })),
        }
    }

    /// Set the reported firmware version.
    pub fn with_version(self, major: u8, minor: u8, build: u8) -> Self {
        self.state().version = FirmwareVersion {
            major,
            minor,
            build,
        };
        self
    }

    /// Add an authentication key accepting `pin`.
    pub fn with_auth_key(self, key_id: u16, pin: impl Into<String>) -> Self {
        self.state().auth_keys.insert(key_id, pin.into());
        self
    }

    /// Add an RSA key object carrying `label`.
    pub fn with_rsa_key(self, key_id: u16, label: impl Into<String>) -> Self {
        self.state().keys.push(KeyHandle {
            id: key_id,
            label: label.into(),
        });
        self
    }

    /// Remove the key object `key_id`.
    pub fn remove_rsa_key(&self, key_id: u16) {
        self.state().keys.retain(|key| key.id != key_id);
    }

    /// Append `count` audit entries to the log.
    pub fn with_log_entries(self, count: u16) -> Self {
        for _ in 0..count {
            self.record_command(CMD_GET_LOG_ENTRIES);
        }
        self
    }

    /// Report device info as unsupported, like a backend without an info key.
    pub fn without_device_info(self) -> Self {
        self.state().info_unsupported = true;
        self
    }

    /// Stop auditing the device's own session and crypto commands.
    pub fn without_command_audit(self) -> Self {
        self.state().command_audit = false;
        self
    }

    /// Make every cursor advance report a conflict with another reader.
    pub fn with_cursor_conflict(self) -> Self {
        self.state().cursor_conflict = true;
        self
    }

    /// Make decryption return data that differs from what was encrypted.
    pub fn with_tampered_decrypt(self) -> Self {
        self.state().tampered_decrypt = true;
        self
    }

    /// Append an audit entry for `command` and return its number.
    pub fn record_command(&self, command: u8) -> u16 {
        self.state().push_entry(command, 0, 0)
    }

    /// Move the device cursor as if another reader had acknowledged entries.
    pub fn advance_cursor(&self, index: u16) {
        let mut state = self.state();
        state.log_index = index;
        state.log.retain(|entry| entry.number > index);
    }

    /// Current device-side audit cursor.
    pub fn log_index(&self) -> u16 {
        self.state().log_index
    }

    /// Every index passed to a successful or conflicting cursor advance.
    pub fn log_index_writes(&self) -> Vec<u16> {
        self.state().log_index_writes.clone()
    }

    /// Number of sessions successfully opened.
    pub fn sessions_opened(&self) -> usize {
        self.state().sessions_opened
    }

    /// Number of sessions closed.
    pub fn sessions_closed(&self) -> usize {
        self.state().sessions_closed
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.state)
    }
}

#[async_trait::async_trait]
impl Device for MockDevice {
    async fn device_info(&self) -> Result<DeviceInfo, HsmError> {
        let state = self.state();
        if state.info_unsupported {
            return Err(HsmError::Unsupported("device info disabled"));
        }
        let pending = state.log.len().min(usize::from(MOCK_LOG_CAPACITY));
        Ok(DeviceInfo {
            version: state.version,
            serial: state.serial,
            log_capacity: MOCK_LOG_CAPACITY,
            log_used: u8::try_from(pending).unwrap_or(MOCK_LOG_CAPACITY),
        })
    }

    async fn open_session(&self, key_id: u16, pin: &str) -> Result<Box<dyn Session>, HsmError> {
        let mut state = self.state();
        let code = match state.auth_keys.get(&key_id) {
            Some(expected) if expected == pin => None,
            Some(_) => Some(DeviceErrorCode::AuthenticationFailed),
            None => Some(DeviceErrorCode::ObjectNotFound),
        };
        if let Some(code) = code {
            return Err(HsmError::Device(code));
        }
        state.sessions_opened += 1;
        state.audit(CMD_AUTHENTICATE_SESSION, key_id, key_id);
        Ok(Box::new(MockSession {
            device: self.clone(),
            key_id,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockSession {
    device: MockDevice,
    key_id: u16,
    closed: AtomicBool,
}

impl MockSession {
    fn ensure_open(&self) -> Result<(), HsmError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HsmError::Device(DeviceErrorCode::InvalidSession));
        }
        Ok(())
    }

    fn ensure_key(&self, key: &KeyHandle) -> Result<(), HsmError> {
        let state = self.device.state();
        if state.keys.iter().any(|k| k.id == key.id) {
            Ok(())
        } else {
            Err(HsmError::Device(DeviceErrorCode::ObjectNotFound))
        }
    }
}

#[async_trait::async_trait]
impl Session for MockSession {
    async fn log_entries(&self) -> Result<Vec<LogEntry>, HsmError> {
        self.ensure_open()?;
        Ok(self.device.state().log.clone())
    }

    async fn set_log_index(&self, index: u16) -> Result<(), HsmError> {
        self.ensure_open()?;
        let mut state = self.device.state();
        state.log_index_writes.push(index);
        if state.cursor_conflict || index < state.log_index {
            return Err(HsmError::LogCursorConflict { requested: index });
        }
        state.log_index = index;
        state.log.retain(|entry| entry.number > index);
        Ok(())
    }

    async fn find_keys(&self, label: &str) -> Result<Vec<KeyHandle>, HsmError> {
        self.ensure_open()?;
        let mut state = self.device.state();
        state.audit(CMD_LIST_OBJECTS, self.key_id, 0);
        Ok(state
            .keys
            .iter()
            .filter(|key| key.label == label)
            .cloned()
            .collect())
    }

    async fn public_encrypt(&self, key: &KeyHandle, data: &[u8]) -> Result<Vec<u8>, HsmError> {
        self.ensure_open()?;
        self.ensure_key(key)?;
        self.device
            .state()
            .audit(CMD_GET_PUBLIC_KEY, self.key_id, key.id);
        let mut ciphertext = key.id.to_be_bytes().to_vec();
        ciphertext.extend(data.iter().rev().map(|b| b ^ CIPHER_MASK));
        Ok(ciphertext)
    }

    async fn private_decrypt(&self, key: &KeyHandle, data: &[u8]) -> Result<Vec<u8>, HsmError> {
        self.ensure_open()?;
        self.ensure_key(key)?;
        let (prefix, body) = data
            .split_at_checked(2)
            .ok_or(HsmError::Device(DeviceErrorCode::WrongLength))?;
        if prefix != key.id.to_be_bytes() {
            return Err(HsmError::Device(DeviceErrorCode::InvalidData));
        }
        let mut plaintext: Vec<u8> = body.iter().rev().map(|b| b ^ CIPHER_MASK).collect();
        let mut state = self.device.state();
        state.audit(CMD_DECRYPT_PKCS1, self.key_id, key.id);
        if state.tampered_decrypt {
            plaintext.push(b'!');
        }
        Ok(plaintext)
    }

    async fn close(&self) -> Result<(), HsmError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.device.state().sessions_closed += 1;
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(device: &MockDevice, key_id: u16, pin: &str) -> Box<dyn Session> {
        device.open_session(key_id, pin).await.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_url_is_unreachable() {
        let connector = MockConnector::new();
        let result = connector.connect("http://nowhere:1").await;
        assert!(matches!(result, Err(HsmError::Connection(_))));
    }

    #[tokio::test]
    async fn test_open_session_checks_pin() {
        let device = MockDevice::new(1).with_auth_key(6, "audit");

        assert!(matches!(
            device.open_session(6, "wrong").await.err(),
            Some(HsmError::Device(DeviceErrorCode::AuthenticationFailed))
        ));
        assert!(matches!(
            device.open_session(7, "audit").await.err(),
            Some(HsmError::Device(DeviceErrorCode::ObjectNotFound))
        ));
        assert!(device.open_session(6, "audit").await.is_ok());
        assert_eq!(device.sessions_opened(), 1);
        assert_eq!(device.device_info().await.unwrap().log_used, 1);
    }

    #[tokio::test]
    async fn test_log_cursor_advances_and_conflicts() {
        let device = MockDevice::new(1)
            .with_auth_key(6, "audit")
            .with_log_entries(3);
        let session = open(&device, 6, "audit").await;

        // Three recorded entries plus the session authentication.
        let entries = session.log_entries().await.unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[3].number, 4);
        assert_eq!(entries[3].command, CMD_AUTHENTICATE_SESSION);
        assert_eq!(entries[3].session_key, 6);

        session.set_log_index(4).await.unwrap();
        assert_eq!(device.log_index(), 4);
        assert!(session.log_entries().await.unwrap().is_empty());

        assert!(matches!(
            session.set_log_index(2).await,
            Err(HsmError::LogCursorConflict { requested: 2 })
        ));
        assert_eq!(device.log_index_writes(), vec![4, 2]);
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip() {
        let device = MockDevice::new(1)
            .with_auth_key(3, "app")
            .with_rsa_key(0x10, "vault");
        let session = open(&device, 3, "app").await;

        let key = session.find_keys("vault").await.unwrap().remove(0);
        let ciphertext = session.public_encrypt(&key, b"frog").await.unwrap();
        assert_ne!(ciphertext, b"frog");
        let plaintext = session.private_decrypt(&key, &ciphertext).await.unwrap();
        assert_eq!(plaintext, b"frog");
    }

    #[tokio::test]
    async fn test_decrypt_with_other_key_fails() {
        let device = MockDevice::new(1)
            .with_auth_key(3, "app")
            .with_rsa_key(0x10, "a")
            .with_rsa_key(0x11, "b");
        let session = open(&device, 3, "app").await;

        let a = session.find_keys("a").await.unwrap().remove(0);
        let b = session.find_keys("b").await.unwrap().remove(0);
        let ciphertext = session.public_encrypt(&a, b"frog").await.unwrap();
        assert!(session.private_decrypt(&b, &ciphertext).await.is_err());
    }

    #[tokio::test]
    async fn test_session_commands_are_audited() {
        let device = MockDevice::new(1)
            .with_auth_key(3, "app")
            .with_rsa_key(0x10, "vault");
        let session = open(&device, 3, "app").await;

        let key = session.find_keys("vault").await.unwrap().remove(0);
        let ciphertext = session.public_encrypt(&key, b"frog").await.unwrap();
        session.private_decrypt(&key, &ciphertext).await.unwrap();

        let commands: Vec<_> = session
            .log_entries()
            .await
            .unwrap()
            .iter()
            .map(|entry| (entry.command, entry.session_key, entry.target_key))
            .collect();
        assert_eq!(
            commands,
            vec![
                (CMD_AUTHENTICATE_SESSION, 3, 3),
                (CMD_LIST_OBJECTS, 3, 0),
                (CMD_GET_PUBLIC_KEY, 3, 0x10),
                (CMD_DECRYPT_PKCS1, 3, 0x10),
            ]
        );
    }

    #[tokio::test]
    async fn test_without_command_audit_keeps_log_empty() {
        let device = MockDevice::new(1)
            .with_auth_key(3, "app")
            .with_rsa_key(0x10, "vault")
            .without_command_audit();
        let session = open(&device, 3, "app").await;

        session.find_keys("vault").await.unwrap();
        assert!(session.log_entries().await.unwrap().is_empty());
        assert_eq!(device.record_command(0x4d), 1);
    }

    #[tokio::test]
    async fn test_removed_key_is_gone() {
        let device = MockDevice::new(1)
            .with_auth_key(3, "app")
            .with_rsa_key(0x10, "vault");
        let session = open(&device, 3, "app").await;
        let key = session.find_keys("vault").await.unwrap().remove(0);

        device.remove_rsa_key(0x10);
        assert!(session.find_keys("vault").await.unwrap().is_empty());
        assert!(matches!(
            session.public_encrypt(&key, b"frog").await,
            Err(HsmError::Device(DeviceErrorCode::ObjectNotFound))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let device = MockDevice::new(1).with_auth_key(6, "audit");
        let session = open(&device, 6, "audit").await;

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(device.sessions_closed(), 1);
        assert!(session.log_entries().await.is_err());
    }

    #[tokio::test]
    async fn test_device_info_reports_pending_entries() {
        let device = MockDevice::new(42).with_version(2, 2, 0).with_log_entries(5);
        let info = device.device_info().await.unwrap();
        assert_eq!(info.serial, 42);
        assert_eq!(info.version.to_string(), "2.2.0");
        assert_eq!(info.log_capacity, MOCK_LOG_CAPACITY);
        assert_eq!(info.log_used, 5);
    }
}
