//! Credential refresh against the issuer's refresh endpoint.
//!
//! `RefreshTransport` performs one exchange; `CredentialRefresher` adds the
//! bounded retry with exponential backoff and decides which failures are
//! terminal.

pub mod refresher;
pub mod transport;

pub use refresher::CredentialRefresher;
pub use transport::{HttpRefreshTransport, RefreshTransport};
