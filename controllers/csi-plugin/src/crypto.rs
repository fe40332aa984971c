//! CHAP credential transport encryption.
//!
//! The controller hands CHAP credentials to the node inside the CSI
//! publish-context map. With an AES key configured each field travels as
//! `base64(nonce || AES-256-GCM ciphertext)`; without one the fields are sent
//! in clear under separate keys and a warning is logged once.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Once;
use storage_core::ChapCredentials;
use thiserror::Error;
use tracing::warn;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub const ENCRYPTED_USERNAME: &str = "encryptedIscsiUsername";
pub const ENCRYPTED_INITIATOR_SECRET: &str = "encryptedIscsiInitiatorSecret";
pub const ENCRYPTED_TARGET_USERNAME: &str = "encryptedIscsiTargetUsername";
pub const ENCRYPTED_TARGET_SECRET: &str = "encryptedIscsiTargetSecret";

pub const USERNAME: &str = "iscsiUsername";
pub const INITIATOR_SECRET: &str = "iscsiInitiatorSecret";
pub const TARGET_USERNAME: &str = "iscsiTargetUsername";
pub const TARGET_SECRET: &str = "iscsiTargetSecret";

/// Every publish-context key that carries a CHAP credential
pub const CHAP_FIELDS: [&str; 8] = [
    ENCRYPTED_USERNAME,
    ENCRYPTED_INITIATOR_SECRET,
    ENCRYPTED_TARGET_USERNAME,
    ENCRYPTED_TARGET_SECRET,
    USERNAME,
    INITIATOR_SECRET,
    TARGET_USERNAME,
    TARGET_SECRET,
];

/// Publish-context flag set when the volume uses CHAP
pub const USE_CHAP: &str = "useCHAP";

static CLEARTEXT_WARNING: Once = Once::new();

/// CHAP encryption errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid AES key: {0}")]
    InvalidKey(String),

    #[error("could not encrypt CHAP field {0}")]
    Encrypt(&'static str),

    #[error("could not decrypt CHAP field {0}")]
    Decrypt(&'static str),

    #[error("could not read AES key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Encrypts and decrypts CHAP fields for the publish context.
#[derive(Clone, Default)]
pub struct ChapCipher {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for ChapCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChapCipher")
            .field("encrypting", &self.cipher.is_some())
            .finish()
    }
}

impl ChapCipher {
    /// A cipher that passes CHAP fields through in clear
    pub fn cleartext() -> Self {
        Self::default()
    }

    /// A cipher for a 32 byte key, given raw or base64 encoded
    pub fn from_key(key: &[u8]) -> Result<Self, CryptoError> {
        let raw = if key.len() == KEY_LEN {
            key.to_vec()
        } else {
            let text = std::str::from_utf8(key).map_err(|_| CryptoError::InvalidKey("key is not 32 bytes".into()))?;
            STANDARD
                .decode(text.trim())
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
        };
        let cipher = Aes256Gcm::new_from_slice(&raw)
            .map_err(|_| CryptoError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", raw.len())))?;
        Ok(Self { cipher: Some(cipher) })
    }

    /// Load the key file once at boot; no path means cleartext
    pub fn load(path: Option<&Path>) -> Result<Self, CryptoError> {
        match path {
            None => Ok(Self::cleartext()),
            Some(path) => {
                let key = std::fs::read(path).map_err(|source| CryptoError::KeyFile {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_key(&key)
            }
        }
    }

    /// True when fields are encrypted
    pub fn is_encrypting(&self) -> bool {
        self.cipher.is_some()
    }

    fn encrypt_field(cipher: &Aes256Gcm, field: &'static str, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt(field))?;
        let mut token = nonce.to_vec();
        token.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(token))
    }

    fn decrypt_field(cipher: &Aes256Gcm, field: &'static str, token: &str) -> Result<String, CryptoError> {
        let bytes = STANDARD.decode(token).map_err(|_| CryptoError::Decrypt(field))?;
        if bytes.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt(field));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt(field))?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt(field))
    }

    /// Write `chap` into the publish context.
    ///
    /// Nothing is written unless every field encrypts.
    pub fn encode(&self, chap: &ChapCredentials, context: &mut HashMap<String, String>) -> Result<(), CryptoError> {
        let fields = [
            (ENCRYPTED_USERNAME, USERNAME, &chap.initiator_user),
            (ENCRYPTED_INITIATOR_SECRET, INITIATOR_SECRET, &chap.initiator_secret),
            (ENCRYPTED_TARGET_USERNAME, TARGET_USERNAME, &chap.target_user),
            (ENCRYPTED_TARGET_SECRET, TARGET_SECRET, &chap.target_secret),
        ];

        let Some(cipher) = &self.cipher else {
            CLEARTEXT_WARNING.call_once(|| {
                warn!("No AES key configured, CHAP credentials are sent to nodes in clear text");
            });
            for (_, plain_key, value) in fields {
                context.insert(plain_key.to_string(), value.clone());
            }
            context.insert(USE_CHAP.to_string(), "true".to_string());
            return Ok(());
        };

        let mut encoded = Vec::with_capacity(fields.len());
        for (encrypted_key, _, value) in fields {
            encoded.push((encrypted_key, Self::encrypt_field(cipher, encrypted_key, value)?));
        }
        context.extend(encoded.into_iter().map(|(k, v)| (k.to_string(), v)));
        context.insert(USE_CHAP.to_string(), "true".to_string());
        Ok(())
    }

    /// Read CHAP credentials back out of the publish context.
    ///
    /// Plaintext fields win; an encrypted field is only decrypted when its
    /// plaintext counterpart is empty. Returns `None` when CHAP is not in use.
    pub fn decode(&self, context: &HashMap<String, String>) -> Result<Option<ChapCredentials>, CryptoError> {
        if context.get(USE_CHAP).map(String::as_str) != Some("true") {
            return Ok(None);
        }

        let field = |encrypted_key: &'static str, plain_key: &str| -> Result<String, CryptoError> {
            let plain = context.get(plain_key).cloned().unwrap_or_default();
            if !plain.is_empty() {
                return Ok(plain);
            }
            match (context.get(encrypted_key), &self.cipher) {
                (Some(token), Some(cipher)) => Self::decrypt_field(cipher, encrypted_key, token),
                (Some(_), None) => Err(CryptoError::InvalidKey(format!(
                    "{encrypted_key} is encrypted but no AES key is configured"
                ))),
                (None, _) => Ok(String::new()),
            }
        };

        Ok(Some(ChapCredentials {
            initiator_user: field(ENCRYPTED_USERNAME, USERNAME)?,
            initiator_secret: field(ENCRYPTED_INITIATOR_SECRET, INITIATOR_SECRET)?,
            target_user: field(ENCRYPTED_TARGET_USERNAME, TARGET_USERNAME)?,
            target_secret: field(ENCRYPTED_TARGET_SECRET, TARGET_SECRET)?,
        }))
    }
}
