use serde::{Deserialize, Serialize};

/// What actually lands in storage: the scheme version plus the sealed credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEnvelope {
    pub version: String,
    pub ciphertext: String,
}

/// Namespaced storage key: `prefix + version + "." + logical_key`.
pub fn storage_key(prefix: &str, version: &str, logical_key: &str) -> String {
    format!("{}{}.{}", prefix, version, logical_key)
}
