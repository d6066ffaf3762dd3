//! Encrypted secret storage and `${secrets.NAME}` substitution.
//!
//! Ported from `secrets.py`: AES-256-GCM with a key sourced from the
//! `MEDIC_SECRETS_KEY` environment variable (32 raw bytes, base64-encoded),
//! a random 12-byte nonce per write, and the GCM tag stored alongside the
//! ciphertext rather than appended to it. Plaintext is never persisted.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use regex::Regex;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

use crate::store::models::SecretRow;
use crate::store::{Store, StoreError};

/// Environment variable carrying the base64-encoded 32-byte encryption key.
pub const SECRETS_KEY_ENV: &str = "MEDIC_SECRETS_KEY";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("valid regex"))
}

fn interpolation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{secrets\.([A-Za-z0-9_]+)\}").expect("valid regex"))
}

/// Errors from secret encryption, storage, or substitution.
#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("MEDIC_SECRETS_KEY is not set")]
    KeyMissing,
    #[error("MEDIC_SECRETS_KEY must decode to exactly 32 bytes")]
    BadKeyLength,
    #[error("MEDIC_SECRETS_KEY is not valid base64: {0}")]
    BadKeyEncoding(String),
    #[error("secret name '{0}' is invalid; must match [A-Za-z_][A-Za-z0-9_]{{0,63}}")]
    BadName(String),
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed (wrong key or corrupted row)")]
    DecryptFailed,
    #[error("secret '{0}' is referenced but not registered")]
    SecretNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Loads the AES-256-GCM key from the environment and performs
/// encrypt/decrypt/substitution operations.
pub struct SecretsManager {
    cipher: Aes256Gcm,
}

impl SecretsManager {
    /// Build a manager from an explicit 32-byte key, bypassing the
    /// environment (used in tests).
    pub fn from_key_bytes(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self { cipher }
    }

    /// Build a manager by reading and decoding `MEDIC_SECRETS_KEY`.
    pub fn from_env(env: impl Fn(&str) -> Option<String>) -> Result<Self, SecretsError> {
        let raw = env(SECRETS_KEY_ENV).ok_or(SecretsError::KeyMissing)?;
        let decoded = BASE64
            .decode(raw.trim())
            .map_err(|e| SecretsError::BadKeyEncoding(e.to_string()))?;
        let key: [u8; 32] = decoded
            .try_into()
            .map_err(|_| SecretsError::BadKeyLength)?;
        Ok(Self::from_key_bytes(&key))
    }

    /// Encrypt `plaintext` under a freshly-generated random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), SecretsError> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut combined = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &[],
                },
            )
            .map_err(|_| SecretsError::EncryptFailed)?;
        // `Aes256Gcm::encrypt` appends the 16-byte tag to the ciphertext;
        // split it back out so the schema can store tag and ciphertext
        // as distinct columns, matching the original's on-disk layout.
        let tag = combined.split_off(combined.len().saturating_sub(16));
        Ok((combined, nonce_bytes.to_vec(), tag))
    }

    /// Decrypt a stored `(ciphertext, nonce, tag)` triple.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8], tag: &[u8]) -> Result<String, SecretsError> {
        if nonce.len() != 12 {
            return Err(SecretsError::DecryptFailed);
        }
        let nonce = Nonce::from_slice(nonce);
        let mut combined = Vec::with_capacity(ciphertext.len() + tag.len());
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);

        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &combined,
                    aad: &[],
                },
            )
            .map_err(|_| SecretsError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| SecretsError::DecryptFailed)
    }

    /// Validate a secret name against `[A-Za-z_][A-Za-z0-9_]{0,63}`.
    pub fn validate_name(name: &str) -> Result<(), SecretsError> {
        if name_pattern().is_match(name) {
            Ok(())
        } else {
            Err(SecretsError::BadName(name.to_owned()))
        }
    }

    /// Encrypt and persist a secret, replacing any existing value.
    pub async fn set_secret(
        &self,
        store: &Store,
        name: &str,
        plaintext: &str,
        description: Option<&str>,
        actor: Option<&str>,
    ) -> Result<(), SecretsError> {
        Self::validate_name(name)?;
        let (ciphertext, nonce, tag) = self.encrypt(plaintext)?;
        let row = SecretRow {
            name: name.to_owned(),
            ciphertext,
            nonce,
            tag,
            description: description.map(str::to_owned),
            actor: actor.map(str::to_owned),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        store.upsert_secret(&row).await?;
        Ok(())
    }

    /// Fetch and decrypt a single secret by name.
    pub async fn get_secret(&self, store: &Store, name: &str) -> Result<String, SecretsError> {
        let row = store
            .get_secret(name)
            .await?
            .ok_or_else(|| SecretsError::SecretNotFound(name.to_owned()))?;
        self.decrypt(&row.ciphertext, &row.nonce, &row.tag)
    }

    /// Replace every `${secrets.NAME}` reference in `input` with its
    /// decrypted value, caching lookups for the duration of the call.
    pub async fn interpolate(&self, store: &Store, input: &str) -> Result<String, SecretsError> {
        let mut cache: HashMap<String, String> = HashMap::new();
        self.interpolate_with_cache(store, input, &mut cache).await
    }

    /// Replace every `${secrets.NAME}` reference in `input`, reusing and
    /// populating `cache` so a whole playbook execution decrypts each
    /// referenced secret at most once regardless of how many steps (or
    /// how many fields within a step) reference it.
    pub async fn interpolate_with_cache(
        &self,
        store: &Store,
        input: &str,
        cache: &mut HashMap<String, String>,
    ) -> Result<String, SecretsError> {
        let names: Vec<String> = interpolation_pattern()
            .captures_iter(input)
            .map(|c| c[1].to_owned())
            .collect();

        for name in names {
            if cache.contains_key(&name) {
                continue;
            }
            let value = self.get_secret(store, &name).await?;
            cache.insert(name, value);
        }

        let result = interpolation_pattern().replace_all(input, |caps: &regex::Captures| {
            cache.get(&caps[1]).cloned().unwrap_or_default()
        });
        Ok(result.into_owned())
    }

    /// Recursively substitute `${secrets.NAME}` references through a JSON
    /// value's string leaves; mappings and sequences are walked, non-string
    /// leaves (numbers, bools, null) pass through unchanged.
    pub async fn interpolate_json(
        &self,
        store: &Store,
        value: &Json,
        cache: &mut HashMap<String, String>,
    ) -> Result<Json, SecretsError> {
        match value {
            Json::String(s) => Ok(Json::String(self.interpolate_with_cache(store, s, cache).await?)),
            Json::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Box::pin(self.interpolate_json(store, item, cache)).await?);
                }
                Ok(Json::Array(out))
            }
            Json::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), Box::pin(self.interpolate_json(store, v, cache)).await?);
                }
                Ok(Json::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SecretsManager {
        SecretsManager::from_key_bytes(&[7u8; 32])
    }

    #[test]
    fn round_trips_plaintext() {
        let mgr = manager();
        let (ciphertext, nonce, tag) = mgr.encrypt("hunter2").expect("encrypt");
        let decrypted = mgr.decrypt(&ciphertext, &nonce, &tag).expect("decrypt");
        assert_eq!(decrypted, "hunter2");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let mgr = manager();
        let other = SecretsManager::from_key_bytes(&[9u8; 32]);
        let (ciphertext, nonce, tag) = mgr.encrypt("hunter2").expect("encrypt");
        assert!(other.decrypt(&ciphertext, &nonce, &tag).is_err());
    }

    #[test]
    fn validates_name_pattern() {
        assert!(SecretsManager::validate_name("API_KEY").is_ok());
        assert!(SecretsManager::validate_name("_PRIVATE_KEY").is_ok());
        assert!(SecretsManager::validate_name("1_bad").is_err());
        assert!(SecretsManager::validate_name("has space").is_err());
    }
}
