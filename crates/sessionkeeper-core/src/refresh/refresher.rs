use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::transport::RefreshTransport;
use crate::auth::{Credential, CredentialValidator};
use crate::config::SessionConfig;
use crate::error::{ExchangeError, RefreshError};

/// Exchanges a refresh token for a new credential, retrying transient failures
/// with exponential backoff.
///
/// This is the only component that talks to the network. De-duplication of
/// concurrent refreshes lives in the session manager, which owns the session
/// state the in-flight guard belongs to.
#[derive(Clone)]
pub struct CredentialRefresher {
    transport: Arc<dyn RefreshTransport>,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl CredentialRefresher {
    pub fn new(config: &SessionConfig, transport: Arc<dyn RefreshTransport>) -> Self {
        Self {
            transport,
            max_attempts: config.max_refresh_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    pub async fn refresh(&self, current: &Credential) -> Result<Credential, RefreshError> {
        if !current.has_refresh_token() {
            return Err(RefreshError::RefreshRejected(
                "no refresh token available".to_string(),
            ));
        }

        let mut backoff = self.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.transport.exchange(&current.refresh_token).await {
                Ok(credential) if CredentialValidator::is_structurally_valid(&credential) => {
                    info!(attempt, "Credential refreshed");
                    return Ok(credential);
                }
                Ok(_) => {
                    warn!(attempt, "Issuer returned a malformed credential");
                    return Err(RefreshError::RefreshRejected(
                        "issuer returned a malformed credential".to_string(),
                    ));
                }
                Err(ExchangeError::Rejected(msg)) => {
                    warn!(attempt, error = %msg, "Refresh rejected by issuer");
                    return Err(RefreshError::RefreshRejected(msg));
                }
                Err(ExchangeError::Transient(msg)) => {
                    warn!(
                        attempt,
                        max = self.max_attempts,
                        error = %msg,
                        "Refresh failed, retrying"
                    );
                    last_error = msg;
                    if attempt < self.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.max_backoff);
                    }
                }
            }
        }

        error!(attempts = self.max_attempts, "Refresh failed after all attempts");
        Err(RefreshError::RefreshExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}
