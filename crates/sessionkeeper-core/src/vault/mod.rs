//! Encrypted local persistence for the session credential.
//!
//! This module provides:
//! - `CredentialVault`: versioned, encrypted envelope storage with migration
//! - `CredentialCipher` / `ChaChaCipher`: the symmetric cipher for envelopes
//! - `StorageMedium`: the key-value capability underneath, with memory, file
//!   and OS keychain implementations
//!
//! The vault never performs network I/O.

pub mod cipher;
pub mod envelope;
pub mod storage;
pub mod store;

pub use cipher::{ChaChaCipher, CredentialCipher};
pub use envelope::StorageEnvelope;
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, StorageMedium};
pub use store::CredentialVault;
