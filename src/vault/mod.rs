//! Credential vault: per-user session material sealed at rest.
//!
//! Blobs are `salt (16) || nonce (12) || AES-256-GCM ciphertext`. The key is
//! derived from the operator's master key with Argon2id, once per salt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
use chrono::{DateTime, Utc};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;
use crate::store::SessionStore;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Session material a platform client authenticates with.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Session string or token.
    pub session: SecretString,
    /// Application id, for platforms that require one next to the session.
    pub api_id: Option<i32>,
}

impl Credentials {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: SecretString::from(session.into()),
            api_id: None,
        }
    }
}

/// Plaintext layout inside a sealed blob.
#[derive(Serialize, Deserialize)]
struct CredentialsRecord {
    session: String,
    #[serde(default)]
    api_id: Option<i32>,
}

/// Seals and unseals opaque byte strings.
pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError>;
    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, VaultError>;
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy)]
pub struct KdfCost {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for KdfCost {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
        }
    }
}

/// AES-256-GCM sealer keyed from a master secret.
pub struct AesGcmSealer {
    master_key: SecretString,
    cost: KdfCost,
    /// Salt used for new blobs.
    salt: [u8; SALT_LEN],
    ciphers: Mutex<HashMap<[u8; SALT_LEN], Aes256Gcm>>,
}

impl AesGcmSealer {
    pub fn new(master_key: SecretString) -> Result<Self, VaultError> {
        Self::with_cost(master_key, KdfCost::default())
    }

    pub fn with_cost(master_key: SecretString, cost: KdfCost) -> Result<Self, VaultError> {
        if master_key.expose_secret().is_empty() {
            return Err(VaultError::Locked);
        }
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let sealer = Self {
            master_key,
            cost,
            salt,
            ciphers: Mutex::new(HashMap::new()),
        };
        // Derive eagerly so a bad cost setting fails at startup.
        sealer.cipher(&salt)?;
        Ok(sealer)
    }

    fn cipher(&self, salt: &[u8; SALT_LEN]) -> Result<Aes256Gcm, VaultError> {
        let mut ciphers = self.ciphers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cipher) = ciphers.get(salt) {
            return Ok(cipher.clone());
        }
        let cipher = derive_cipher(self.master_key.expose_secret().as_bytes(), salt, self.cost)?;
        ciphers.insert(*salt, cipher.clone());
        Ok(cipher)
    }
}

impl Sealer for AesGcmSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let cipher = self.cipher(&self.salt)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| VaultError::SealFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&self.salt);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, VaultError> {
        if sealed.len() < SALT_LEN + NONCE_LEN {
            return Err(VaultError::UnsealFailed(
                "sealed value too short for salt and nonce".to_string(),
            ));
        }
        let (salt, rest) = sealed.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let salt: [u8; SALT_LEN] = salt
            .try_into()
            .map_err(|_| VaultError::UnsealFailed("bad salt".to_string()))?;

        self.cipher(&salt)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| VaultError::UnsealFailed(e.to_string()))
    }
}

/// Derive an AES-256-GCM cipher from the master key using Argon2id.
fn derive_cipher(
    master_key: &[u8],
    salt: &[u8; SALT_LEN],
    cost: KdfCost,
) -> Result<Aes256Gcm, VaultError> {
    let params = argon2::Params::new(cost.memory_kib, cost.iterations, 1, Some(32))
        .map_err(|e| VaultError::SealFailed(format!("argon2 params: {e}")))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut derived_key = [0u8; 32];
    argon2
        .hash_password_into(master_key, salt, &mut derived_key)
        .map_err(|e| VaultError::SealFailed(format!("argon2 key derivation: {e}")))?;

    Aes256Gcm::new_from_slice(&derived_key).map_err(|e| VaultError::SealFailed(e.to_string()))
}

/// Per-user sealed sessions on top of a [`SessionStore`].
///
/// Without a sealer the vault is locked: every read and write fails with
/// [`VaultError::Locked`], and the rest of the bot keeps running with
/// public-link downloads only.
#[derive(Clone)]
pub struct CredentialVault {
    store: Arc<dyn SessionStore>,
    sealer: Option<Arc<dyn Sealer>>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn SessionStore>, sealer: Option<Arc<dyn Sealer>>) -> Self {
        Self { store, sealer }
    }

    pub fn is_locked(&self) -> bool {
        self.sealer.is_none()
    }

    fn sealer(&self) -> Result<&Arc<dyn Sealer>, VaultError> {
        self.sealer.as_ref().ok_or(VaultError::Locked)
    }

    /// The stored blob for `user_id`.
    pub async fn sealed_get(&self, user_id: i64) -> Result<Vec<u8>, VaultError> {
        self.store
            .get_sealed(user_id)
            .await?
            .ok_or(VaultError::NotFound { user_id })
    }

    pub fn unseal(&self, sealed: &[u8]) -> Result<Credentials, VaultError> {
        let plaintext = self.sealer()?.unseal(sealed)?;
        let record: CredentialsRecord = serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::UnsealFailed(format!("credential record: {e}")))?;
        Ok(Credentials {
            session: SecretString::from(record.session),
            api_id: record.api_id,
        })
    }

    /// Load and unseal the credentials of `user_id`.
    pub async fn credentials(&self, user_id: i64) -> Result<Credentials, VaultError> {
        self.sealer()?;
        let sealed = self.sealed_get(user_id).await?;
        self.unseal(&sealed)
    }

    /// Whether a session is stored, without unsealing it.
    pub async fn has_session(&self, user_id: i64) -> Result<bool, VaultError> {
        Ok(self.store.get_sealed(user_id).await?.is_some())
    }

    /// Seal and store credentials, replacing any previous session.
    pub async fn login(
        &self,
        user_id: i64,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> Result<(), VaultError> {
        let record = CredentialsRecord {
            session: credentials.session.expose_secret().to_string(),
            api_id: credentials.api_id,
        };
        let plaintext =
            serde_json::to_vec(&record).map_err(|e| VaultError::SealFailed(e.to_string()))?;
        let sealed = self.sealer()?.seal(&plaintext)?;
        self.store.put_sealed(user_id, &sealed, now).await?;
        tracing::info!(user_id, "Session stored");
        Ok(())
    }

    /// Revoke the stored session. Returns whether one existed.
    pub async fn logout(&self, user_id: i64) -> Result<bool, VaultError> {
        let removed = self.store.delete_sealed(user_id).await?;
        if removed {
            tracing::info!(user_id, "Session revoked");
        }
        Ok(removed)
    }

    pub async fn session_count(&self) -> Result<u64, VaultError> {
        Ok(self.store.count_sessions().await?)
    }
}
