//! Round-trip secret used to prove a device key pair works.
//!
//! The secret alternates between plaintext and ciphertext: one probe cycle
//! encrypts it on the device, the next one decrypts it again. After each
//! decrypt the plaintext must match the payload the secret started with.

use std::future::Future;

/// Payload every secret starts from.
pub const DEFAULT_PAYLOAD: &str = "🐸";

/// A payload in one of its two forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundTripSecret {
    /// Decrypted form.
    Plaintext(Vec<u8>),
    /// Encrypted form.
    Ciphertext(Vec<u8>),
}

impl Default for RoundTripSecret {
    fn default() -> Self {
        Self::Plaintext(DEFAULT_PAYLOAD.as_bytes().to_vec())
    }
}

impl RoundTripSecret {
    /// Create a plaintext secret from `payload`.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::Plaintext(payload.into())
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Ciphertext(_))
    }

    /// Human-readable representation and the encrypted flag.
    ///
    /// Plaintext is decoded as UTF-8, ciphertext is rendered as lowercase hex.
    pub fn current(&self) -> (String, bool) {
        match self {
            Self::Plaintext(data) => (String::from_utf8_lossy(data).into_owned(), false),
            Self::Ciphertext(data) => (hex::encode(data), true),
        }
    }

    /// Whether the secret is plaintext equal to `expected`.
    pub fn is_plaintext(&self, expected: &[u8]) -> bool {
        matches!(self, Self::Plaintext(data) if data == expected)
    }

    /// Whether the secret is plaintext equal to [`DEFAULT_PAYLOAD`].
    pub fn is_default(&self) -> bool {
        self.is_plaintext(DEFAULT_PAYLOAD.as_bytes())
    }

    /// Return to the default plaintext payload.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Advance the secret by one half of a round trip.
    ///
    /// Ciphertext is passed to `decrypt`, plaintext to `encrypt`; exactly one
    /// of them runs. On error the secret is left untouched.
    pub async fn process<E, D, FE, FD, Err>(&mut self, encrypt: E, decrypt: D) -> Result<(), Err>
    where
        E: FnOnce(Vec<u8>) -> FE,
        D: FnOnce(Vec<u8>) -> FD,
        FE: Future<Output = Result<Vec<u8>, Err>>,
        FD: Future<Output = Result<Vec<u8>, Err>>,
    {
        let next = match self {
            Self::Ciphertext(data) => Self::Plaintext(decrypt(data.clone()).await?),
            Self::Plaintext(data) => Self::Ciphertext(encrypt(data.clone()).await?),
        };
        *self = next;
        Ok(())
    }
}
