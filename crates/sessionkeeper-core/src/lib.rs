//! Client-side session and credential lifecycle.
//!
//! Holds an access/refresh token pair for one signed-in user, keeps it
//! encrypted at rest, refreshes it before it lapses, and tells the rest of the
//! application when the session is gone.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use sessionkeeper_core::{
//!     ChaChaCipher, CredentialRefresher, CredentialValidator, CredentialVault,
//!     HttpRefreshTransport, MemoryStorage, SessionConfig, SessionEventBus, SessionManager,
//!     SystemClock,
//! };
//!
//! let config = SessionConfig::default();
//! let cipher = Arc::new(ChaChaCipher::from_passphrase("correct horse", config.key_salt.as_bytes())?);
//! let vault = CredentialVault::new(&config, Arc::new(MemoryStorage::new()), cipher);
//! let refresher =
//!     CredentialRefresher::new(&config, Arc::new(HttpRefreshTransport::new(&config)?));
//! let manager = SessionManager::new(
//!     config,
//!     vault,
//!     refresher,
//!     CredentialValidator::default(),
//!     SessionEventBus::new(),
//!     Arc::new(SystemClock),
//! )?;
//!
//! if manager.bootstrap().await {
//!     let credential = manager.current_credential().await;
//!     println!("signed in: {}", credential.is_some());
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod refresh;
pub mod session;
pub mod vault;

#[cfg(test)]
mod testing;

pub use auth::{Claims, ClaimsDecoder, Credential, CredentialValidator, JwtClaimsDecoder};
pub use clock::{Clock, InstantClock, SystemClock};
pub use config::SessionConfig;
pub use error::{
    CipherError, ClaimsError, ConfigError, ExchangeError, RefreshError, SessionError, StorageError,
};
pub use events::{ExpiryReason, SessionEvent, SessionEventBus, SessionEventKind, Subscription};
pub use monitor::{MonitorState, SessionMonitor};
pub use refresh::{CredentialRefresher, HttpRefreshTransport, RefreshTransport};
pub use session::SessionManager;
pub use vault::{
    ChaChaCipher, CredentialCipher, CredentialVault, FileStorage, KeyringStorage, MemoryStorage,
    StorageMedium,
};
