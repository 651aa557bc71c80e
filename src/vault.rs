//! Credential vault: AES-256-GCM over stored mailbox credentials.
//!
//! Accounts persist an opaque encrypted blob; only the connection factory
//! ever sees plaintext. The blob layout is `base64(nonce || ciphertext)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};

const NONCE_LEN: usize = 12;

/// Plaintext mailbox credentials. Debug output is redacted.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .finish()
    }
}

pub struct Vault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    /// Build a vault from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> anyhow::Result<Self> {
        let key_bytes = STANDARD
            .decode(key_base64.trim())
            .context("vault key is not valid base64")?;
        if key_bytes.len() != 32 {
            anyhow::bail!(
                "vault key must be 32 bytes, got {} after base64 decoding",
                key_bytes.len()
            );
        }

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Generate a fresh random key, base64-encoded for the config file.
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        STANDARD.encode(key)
    }

    pub fn encrypt(&self, credentials: &Credentials) -> anyhow::Result<String> {
        let plaintext =
            serde_json::to_vec(credentials).context("failed to serialize credentials")?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| anyhow::anyhow!("credential encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> anyhow::Result<Credentials> {
        let bytes = STANDARD
            .decode(blob.trim())
            .context("credential blob is not valid base64")?;
        if bytes.len() <= NONCE_LEN {
            anyhow::bail!("credential blob is truncated");
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow::anyhow!("credential decryption failed (wrong key or corrupt blob)"))?;

        serde_json::from_slice(&plaintext).context("failed to parse decrypted credentials")
    }
}
