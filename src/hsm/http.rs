//! YubiHSM backend behind a `yubihsm-connector` daemon.
//!
//! Reachability is checked on `GET /connector/status`. Everything else goes
//! through [`yubihsm::Client`], which runs the authenticated SCP03 channel
//! over `POST /connector/api`. The client is blocking, so every call runs on
//! the blocking pool and is bounded by the connector timeout.
//!
//! The client exposes RSA decryption with OAEP only, so the round trip pads
//! with OAEP (MGF1 and label hash over SHA-256) on both halves.
//!
//! Device info is an authenticated command for the client. It is read with
//! the key given to [`HttpConnector::with_info_key`]; without one,
//! [`Device::device_info`] reports [`HsmError::Unsupported`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::Client;
use rsa::{BigUint, Oaep, RsaPublicKey};
use sha2::{Digest, Sha256};
use url::Url;
use yubihsm::{Credentials, HttpConfig, asymmetric, client, device, object};
use zeroize::Zeroizing;

use super::{
    Connector, Device, DeviceErrorCode, DeviceInfo, FirmwareVersion, HsmError, KeyHandle,
    LogEntry, Session,
};

/// Default request timeout (10 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const STATUS_PATH: &str = "/connector/status";
const DEFAULT_CONNECTOR_PORT: u16 = 12345;
const RSA_PUBLIC_EXPONENT: u32 = 65_537;

/// Connector talking to `yubihsm-connector` daemons.
#[derive(Clone)]
pub struct HttpConnector {
    http: Client,
    timeout: Duration,
    info_key: Option<Arc<InfoKey>>,
}

struct InfoKey {
    key_id: u16,
    pin: Zeroizing<String>,
}

impl HttpConnector {
    /// Create a connector whose device calls time out after `timeout`.
    ///
    /// # Errors
    /// Returns `HsmError::Connection` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, HsmError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HsmError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            timeout,
            info_key: None,
        })
    }

    /// Authenticate device info reads with `key_id` and `pin`.
    pub fn with_info_key(mut self, key_id: u16, pin: Zeroizing<String>) -> Self {
        self.info_key = Some(Arc::new(InfoKey { key_id, pin }));
        self
    }

    async fn check_status(&self, url: &str) -> Result<(), HsmError> {
        let base = url.trim_end_matches('/');
        let response = self.http.get(format!("{base}{STATUS_PATH}")).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HsmError::Connection(format!(
                "connector status endpoint returned {status}"
            )));
        }

        let body = response.text().await?;
        match parse_status(&body) {
            Some("OK") => Ok(()),
            Some(other) => Err(HsmError::Connection(format!(
                "connector reports status {other}"
            ))),
            None => Err(HsmError::Connection(
                "connector status response has no status field".to_string(),
            )),
        }
    }
}

impl fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnector")
            .field("timeout", &self.timeout)
            .field("info_key", &self.info_key.as_ref().map(|key| key.key_id))
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Device>, HsmError> {
        let config = http_config(url, self.timeout)?;
        self.check_status(url).await?;

        tracing::debug!(url = %url, "Connector is ready");
        Ok(Box::new(HttpDevice {
            connector: yubihsm::Connector::http(&config),
            timeout: self.timeout,
            info_key: self.info_key.clone(),
        }))
    }
}

/// Device reached through a connector daemon.
struct HttpDevice {
    connector: yubihsm::Connector,
    timeout: Duration,
    info_key: Option<Arc<InfoKey>>,
}

impl HttpDevice {
    async fn open_client(&self, key_id: u16, pin: &str) -> Result<yubihsm::Client, HsmError> {
        let connector = self.connector.clone();
        let pin = Zeroizing::new(pin.to_string());
        blocking(self.timeout, move || {
            let credentials = Credentials::from_password(key_id, pin.as_bytes());
            yubihsm::Client::open(connector, credentials, false).map_err(client_error)
        })
        .await
    }
}

#[async_trait::async_trait]
impl Device for HttpDevice {
    async fn device_info(&self) -> Result<DeviceInfo, HsmError> {
        let Some(key) = self.info_key.clone() else {
            return Err(HsmError::Unsupported(
                "device info needs an authentication key",
            ));
        };

        let client = self.open_client(key.key_id, &key.pin).await?;
        let info = blocking(self.timeout, move || {
            client.device_info().map_err(client_error)
        })
        .await?;
        device_info(&info)
    }

    async fn open_session(&self, key_id: u16, pin: &str) -> Result<Box<dyn Session>, HsmError> {
        let client = self.open_client(key_id, pin).await?;
        Ok(Box::new(HttpSession {
            client: Mutex::new(Some(client)),
            timeout: self.timeout,
        }))
    }
}

/// Authenticated session held by a [`yubihsm::Client`].
///
/// The client has no explicit close; closing drops it and wipes the session
/// keys, and the device frees the slot after its inactivity timeout.
struct HttpSession {
    client: Mutex<Option<yubihsm::Client>>,
    timeout: Duration,
}

impl HttpSession {
    fn client(&self) -> Result<yubihsm::Client, HsmError> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| HsmError::Connection("session closed".to_string()))
    }
}

#[async_trait::async_trait]
impl Session for HttpSession {
    async fn log_entries(&self) -> Result<Vec<LogEntry>, HsmError> {
        let client = self.client()?;
        let logs = blocking(self.timeout, move || {
            client.get_log_entries().map_err(client_error)
        })
        .await?;
        // The client's entry type is not nameable, so convert in place.
        Ok(logs
            .entries
            .iter()
            .map(|entry| LogEntry {
                number: entry.item,
                command: entry.cmd.to_u8(),
                length: entry.length,
                session_key: entry.session_key,
                target_key: entry.target_key,
                second_key: entry.second_key,
                result: entry.result.to_u8(),
                tick: entry.tick,
                digest: entry.digest.0.to_vec(),
            })
            .collect())
    }

    async fn set_log_index(&self, index: u16) -> Result<(), HsmError> {
        let client = self.client()?;
        blocking(self.timeout, move || {
            client
                .set_log_index(index)
                .map_err(|e| set_log_index_error(index, e))
        })
        .await
    }

    async fn find_keys(&self, label: &str) -> Result<Vec<KeyHandle>, HsmError> {
        // Labels longer than the device allows cannot match any object.
        let Ok(filter) = object::Label::from_bytes(label.as_bytes()) else {
            return Ok(Vec::new());
        };

        let client = self.client()?;
        let entries = blocking(self.timeout, move || {
            client
                .list_objects(&[
                    object::Filter::Label(filter),
                    object::Filter::Type(object::Type::AsymmetricKey),
                ])
                .map_err(client_error)
        })
        .await?;

        Ok(entries
            .into_iter()
            .map(|entry| KeyHandle {
                id: entry.object_id,
                label: label.to_string(),
            })
            .collect())
    }

    async fn public_encrypt(&self, key: &KeyHandle, data: &[u8]) -> Result<Vec<u8>, HsmError> {
        let client = self.client()?;
        let key_id = key.id;
        let data = data.to_vec();
        blocking(self.timeout, move || {
            let public_key = client.get_public_key(key_id).map_err(client_error)?;
            if !is_rsa(public_key.algorithm) {
                return Err(HsmError::InvalidResponse(format!(
                    "key {key_id:#06x} is not an RSA key ({:?})",
                    public_key.algorithm
                )));
            }
            oaep_encrypt(public_key.as_slice(), &data)
        })
        .await
    }

    async fn private_decrypt(&self, key: &KeyHandle, data: &[u8]) -> Result<Vec<u8>, HsmError> {
        let client = self.client()?;
        let key_id = key.id;
        let data = data.to_vec();
        blocking(self.timeout, move || {
            client
                .decrypt_oaep(
                    key_id,
                    yubihsm::rsa::mgf::Algorithm::Sha256,
                    data,
                    Sha256::digest(b"").to_vec(),
                )
                .map(|plaintext| plaintext.into_vec())
                .map_err(client_error)
        })
        .await
    }

    async fn close(&self) -> Result<(), HsmError> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

/// Run a blocking client call on the blocking pool, bounded by `timeout`.
async fn blocking<T, F>(timeout: Duration, call: F) -> Result<T, HsmError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, HsmError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(call)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(HsmError::Connection(format!("device call aborted: {e}"))),
        Err(_) => Err(HsmError::Connection(format!(
            "device call timed out after {}",
            humantime::format_duration(timeout)
        ))),
    }
}

/// Build the client configuration for a connector URL.
fn http_config(url: &str, timeout: Duration) -> Result<HttpConfig, HsmError> {
    let parsed = Url::parse(url)
        .map_err(|e| HsmError::Connection(format!("invalid connector url '{url}': {e}")))?;
    if parsed.scheme() != "http" {
        return Err(HsmError::Unsupported(
            "the yubihsm client only speaks plain http to the connector",
        ));
    }
    let addr = parsed
        .host_str()
        .ok_or_else(|| HsmError::Connection(format!("connector url '{url}' has no host")))?;

    Ok(HttpConfig {
        addr: addr.to_string(),
        port: parsed.port().unwrap_or(DEFAULT_CONNECTOR_PORT),
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    })
}

/// Extract the `status` value from a connector status document.
fn parse_status(body: &str) -> Option<&str> {
    body.lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == "status")
        .map(|(_, value)| value.trim())
}

fn client_error(err: client::Error) -> HsmError {
    if let Some(kind) = err.device_error() {
        return HsmError::Device(device_code(kind));
    }
    match *err.kind() {
        client::ErrorKind::AuthenticationError => {
            HsmError::Device(DeviceErrorCode::AuthenticationFailed)
        }
        client::ErrorKind::ResponseError => HsmError::InvalidResponse(err.to_string()),
        _ => HsmError::Connection(err.to_string()),
    }
}

/// The device refuses to move the log cursor backwards with `InvalidData`.
fn set_log_index_error(requested: u16, err: client::Error) -> HsmError {
    match err.device_error() {
        Some(device::ErrorKind::InvalidData) => HsmError::LogCursorConflict { requested },
        _ => client_error(err),
    }
}

fn device_code(kind: device::ErrorKind) -> DeviceErrorCode {
    use device::ErrorKind as Kind;

    match kind {
        Kind::InvalidCommand => DeviceErrorCode::InvalidCommand,
        Kind::InvalidData => DeviceErrorCode::InvalidData,
        Kind::InvalidSession => DeviceErrorCode::InvalidSession,
        Kind::AuthenticationFailed => DeviceErrorCode::AuthenticationFailed,
        Kind::SessionsFull => DeviceErrorCode::SessionsFull,
        Kind::SessionFailed => DeviceErrorCode::SessionFailed,
        Kind::StorageFailed => DeviceErrorCode::StorageFailed,
        Kind::WrongLength => DeviceErrorCode::WrongLength,
        Kind::InsufficientPermissions => DeviceErrorCode::InsufficientPermissions,
        Kind::LogFull => DeviceErrorCode::LogFull,
        Kind::ObjectNotFound => DeviceErrorCode::ObjectNotFound,
        Kind::InvalidId => DeviceErrorCode::InvalidId,
        Kind::InvalidOtp => DeviceErrorCode::InvalidOtp,
        Kind::DemoMode => DeviceErrorCode::DemoMode,
        Kind::CommandUnexecuted => DeviceErrorCode::CommandUnexecuted,
        Kind::GenericError => DeviceErrorCode::GenericError,
        Kind::ObjectExists => DeviceErrorCode::ObjectExists,
        Kind::SshCaConstraintViolation => DeviceErrorCode::SshCaConstraintViolation,
        Kind::Unknown { code } => DeviceErrorCode::Unknown(code),
    }
}

fn device_info(info: &device::Info) -> Result<DeviceInfo, HsmError> {
    let serial = info.serial_number.to_string();
    let serial = serial
        .parse()
        .map_err(|_| HsmError::InvalidResponse(format!("invalid serial number '{serial}'")))?;

    Ok(DeviceInfo {
        version: FirmwareVersion {
            major: info.major_version,
            minor: info.minor_version,
            build: info.build_version,
        },
        serial,
        log_capacity: info.log_store_capacity,
        log_used: info.log_store_used,
    })
}

fn is_rsa(algorithm: asymmetric::Algorithm) -> bool {
    matches!(
        algorithm,
        asymmetric::Algorithm::Rsa2048
            | asymmetric::Algorithm::Rsa3072
            | asymmetric::Algorithm::Rsa4096
    )
}

/// Encrypt `data` for the RSA key with big-endian `modulus`.
///
/// Device RSA keys always use the public exponent 65537.
fn oaep_encrypt(modulus: &[u8], data: &[u8]) -> Result<Vec<u8>, HsmError> {
    let public_key = RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from(RSA_PUBLIC_EXPONENT),
    )
    .map_err(|e| HsmError::InvalidResponse(format!("invalid RSA public key: {e}")))?;

    public_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), data)
        .map_err(|e| HsmError::InvalidResponse(format!("RSA encryption failed: {e}")))
}
