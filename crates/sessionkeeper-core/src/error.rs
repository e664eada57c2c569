use thiserror::Error;

/// Failures of the local storage medium or of the vault writing to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Failed to encode credential envelope: {0}")]
    Encoding(String),
}

/// Failures of the symmetric cipher protecting stored envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed")]
    Seal,

    #[error("Decryption failed (wrong key, corrupted or tampered data)")]
    Open,

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),
}

/// Failures decoding claims from an access token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimsError {
    #[error("Token is not a compact signed token")]
    Shape,

    #[error("Token payload is not valid base64url")]
    Encoding,

    #[error("Token payload is not a JSON claims object: {0}")]
    Payload(String),
}

/// Outcome of a single exchange against the refresh endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The issuer explicitly denied the refresh. Retrying cannot help.
    #[error("Refresh denied: {0}")]
    Rejected(String),

    /// Network, timeout, or temporary server failure.
    #[error("Transient refresh failure: {0}")]
    Transient(String),
}

/// Terminal outcome of a refresh, shared by every single-flight waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Refresh rejected: {0}")]
    RefreshRejected(String),

    #[error("Refresh failed after {attempts} attempts: {last_error}")]
    RefreshExhausted { attempts: u32, last_error: String },

    #[error("Session ended before refresh completed")]
    SessionEnded,

    #[error("No active session to refresh")]
    NoSession,
}

impl RefreshError {
    /// Whether this failure means the session must be torn down.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RefreshError::RefreshRejected(_) | RefreshError::RefreshExhausted { .. }
        )
    }
}

/// Errors surfaced across the session manager boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Credential is malformed")]
    Structural,

    #[error("Credential is already expired")]
    Expired,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("refresh_window_secs ({window}) must be less than min_issued_lifetime_secs ({lifetime})")]
    RefreshWindowTooLarge { window: u64, lifetime: u64 },

    #[error("warning_lead_secs ({lead}) must be less than min_issued_lifetime_secs ({lifetime})")]
    WarningLeadTooLarge { lead: u64, lifetime: u64 },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Current storage version {0} is also listed as a legacy version")]
    VersionConflict(String),
}
