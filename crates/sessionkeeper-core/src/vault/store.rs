use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::cipher::CredentialCipher;
use super::envelope::{storage_key, StorageEnvelope};
use super::storage::StorageMedium;
use crate::auth::{Credential, CredentialValidator};
use crate::config::SessionConfig;
use crate::error::StorageError;

/// Encrypted, versioned persistence for the session credential.
///
/// Only the current envelope version is ever written. Anything read back that
/// cannot be opened, parsed, or structurally validated is deleted and reported
/// as absent. A clear that could not reach the medium is remembered and
/// finished before the next read or write.
pub struct CredentialVault {
    medium: Arc<dyn StorageMedium>,
    cipher: Arc<dyn CredentialCipher>,
    prefix: String,
    version: String,
    legacy_versions: Vec<String>,
    logical_key: String,
    max_payload_bytes: usize,
    purge_pending: AtomicBool,
}

impl CredentialVault {
    pub fn new(
        config: &SessionConfig,
        medium: Arc<dyn StorageMedium>,
        cipher: Arc<dyn CredentialCipher>,
    ) -> Self {
        Self {
            medium,
            cipher,
            prefix: config.storage_prefix.clone(),
            version: config.storage_version.clone(),
            legacy_versions: config.legacy_versions.clone(),
            logical_key: config.logical_key.clone(),
            max_payload_bytes: config.max_payload_bytes,
            purge_pending: AtomicBool::new(false),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn current_key(&self) -> String {
        self.key_for(&self.version)
    }

    fn key_for(&self, version: &str) -> String {
        storage_key(&self.prefix, version, &self.logical_key)
    }

    /// Availability check before, access record after, every public operation.
    fn guarded<T>(
        &self,
        op: &'static str,
        f: impl FnOnce() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let started = Instant::now();
        let result = if self.medium.is_available() {
            f()
        } else {
            Err(StorageError::StorageUnavailable(
                "storage medium is not accessible".to_string(),
            ))
        };
        let elapsed_us = started.elapsed().as_micros() as u64;
        match &result {
            Ok(_) => debug!(op, elapsed_us, outcome = "ok", "Vault access"),
            Err(e) => warn!(op, elapsed_us, outcome = "error", error = %e, "Vault access"),
        }
        result
    }

    /// Encrypt and persist `credential` under the current version.
    pub fn store(&self, credential: &Credential) -> Result<(), StorageError> {
        self.guarded("store", || {
            self.finish_pending_purge()?;
            let raw = self.seal(credential)?;
            self.medium.set(&self.current_key(), &raw)
        })
    }

    /// Read back the stored credential, migrating a legacy envelope first if
    /// that is all there is.
    pub fn retrieve(&self) -> Result<Option<Credential>, StorageError> {
        self.guarded("retrieve", || {
            if self.finish_pending_purge()? {
                return Ok(None);
            }
            let raw = match self.medium.get(&self.current_key())? {
                Some(raw) => raw,
                None => {
                    let Some(legacy) = self.find_legacy_version()? else {
                        return Ok(None);
                    };
                    self.migrate_envelope(&legacy, &self.version)?;
                    match self.medium.get(&self.current_key())? {
                        Some(raw) => raw,
                        None => return Ok(None),
                    }
                }
            };

            let credential = match self.open(&raw, &self.version) {
                Ok(credential) => credential,
                Err(reason) => {
                    warn!(reason, "Discarding unreadable credential envelope");
                    let _ = self.purge();
                    return Ok(None);
                }
            };

            if !CredentialValidator::is_structurally_valid(&credential) {
                warn!("Discarding structurally invalid credential");
                let _ = self.purge();
                return Ok(None);
            }

            Ok(Some(credential))
        })
    }

    /// Remove the current and every legacy envelope. Never fails; if the
    /// medium is unreachable the purge is retried on the next access.
    pub fn clear(&self) {
        if let Err(e) = self.guarded("clear", || self.purge()) {
            self.purge_pending.store(true, Ordering::SeqCst);
            error!(error = %e, "Could not clear credential vault, purge deferred");
        }
    }

    /// Whether a failed clear is still waiting for the medium.
    pub fn purge_pending(&self) -> bool {
        self.purge_pending.load(Ordering::SeqCst)
    }

    /// Re-encrypt the envelope stored under `from` as version `to`, then delete
    /// the old key. Returns whether anything was written; an envelope already
    /// present under `to` is newer and is kept as is.
    pub fn migrate(&self, from: &str, to: &str) -> Result<bool, StorageError> {
        self.guarded("migrate", || self.migrate_envelope(from, to))
    }

    fn purge(&self) -> Result<(), StorageError> {
        let result = self.clear_all();
        self.purge_pending.store(result.is_err(), Ordering::SeqCst);
        result
    }

    /// Returns true if a deferred purge ran now.
    fn finish_pending_purge(&self) -> Result<bool, StorageError> {
        if !self.purge_pending() {
            return Ok(false);
        }
        self.purge()?;
        info!("Completed deferred credential purge");
        Ok(true)
    }

    fn find_legacy_version(&self) -> Result<Option<String>, StorageError> {
        for version in &self.legacy_versions {
            if self.medium.get(&self.key_for(version))?.is_some() {
                return Ok(Some(version.clone()));
            }
        }
        Ok(None)
    }

    fn migrate_envelope(&self, from: &str, to: &str) -> Result<bool, StorageError> {
        if to != self.version {
            return Err(StorageError::Encoding(format!(
                "can only migrate to current version {}, not {}",
                self.version, to
            )));
        }
        if from == to {
            return Ok(false);
        }

        let from_key = self.key_for(from);
        let Some(raw) = self.medium.get(&from_key)? else {
            return Ok(false);
        };

        let to_key = self.key_for(to);
        if self.medium.get(&to_key)?.is_some() {
            info!(from, to, "Current envelope already present, discarding legacy one");
            self.medium.remove(&from_key)?;
            return Ok(false);
        }

        let migrated = match self.open(&raw, from) {
            Ok(credential) => {
                let sealed = self.seal(&credential)?;
                self.medium.set(&to_key, &sealed)?;
                info!(from, to, "Migrated credential envelope");
                true
            }
            Err(reason) => {
                warn!(from, reason, "Dropping unreadable legacy envelope");
                false
            }
        };
        self.medium.remove(&from_key)?;
        Ok(migrated)
    }

    fn seal(&self, credential: &Credential) -> Result<String, StorageError> {
        let plaintext =
            serde_json::to_vec(credential).map_err(|e| StorageError::Encoding(e.to_string()))?;
        let ciphertext = self
            .cipher
            .seal(&plaintext)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;
        let envelope = StorageEnvelope {
            version: self.version.clone(),
            ciphertext,
        };
        let raw =
            serde_json::to_string(&envelope).map_err(|e| StorageError::Encoding(e.to_string()))?;

        if raw.len() > self.max_payload_bytes {
            return Err(StorageError::PayloadTooLarge {
                size: raw.len(),
                limit: self.max_payload_bytes,
            });
        }
        Ok(raw)
    }

    fn open(&self, raw: &str, expected_version: &str) -> Result<Credential, &'static str> {
        let envelope: StorageEnvelope =
            serde_json::from_str(raw).map_err(|_| "envelope is not valid JSON")?;
        if envelope.version != expected_version {
            return Err("envelope version does not match its key");
        }
        let plaintext = self
            .cipher
            .open(&envelope.ciphertext)
            .map_err(|_| "decryption failed")?;
        serde_json::from_slice(&plaintext).map_err(|_| "plaintext is not a credential")
    }

    /// Attempts every key; reports the last failure.
    fn clear_all(&self) -> Result<(), StorageError> {
        let mut result = Ok(());
        let versions = std::iter::once(&self.version).chain(self.legacy_versions.iter());
        for version in versions {
            if let Err(e) = self.medium.remove(&self.key_for(version)) {
                warn!(version = %version, error = %e, "Failed to remove credential envelope");
                result = Err(e);
            }
        }
        result
    }
}
