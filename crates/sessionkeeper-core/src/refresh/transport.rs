//! Network exchange of a refresh token for a new credential.

use futures::future::BoxFuture;
use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use tracing::debug;

use crate::auth::{Credential, TokenResponse};
use crate::config::SessionConfig;
use crate::error::ExchangeError;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// One round trip to the issuer. Retrying is the caller's business.
pub trait RefreshTransport: Send + Sync {
    fn exchange<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<Credential, ExchangeError>>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

/// JSON-over-HTTP refresh endpoint.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRefreshTransport {
    client: Client,
    url: String,
}

impl HttpRefreshTransport {
    pub fn new(config: &SessionConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        Ok(Self::with_client(client, config.refresh_url.clone()))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, url: String) -> Self {
        Self { client, url }
    }

    async fn send(&self, refresh_token: &str) -> Result<Credential, ExchangeError> {
        let response = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, "application/json")
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        // The issuer answered; a body we cannot use is a denial, not a blip.
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transient(format!("failed to read body: {}", e)))?;
        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            ExchangeError::Rejected(format!("unusable token response: {}", e))
        })?;
        debug!(status = status.as_u16(), "Refresh endpoint issued a new credential");
        Ok(parsed.into())
    }
}

impl RefreshTransport for HttpRefreshTransport {
    fn exchange<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<Credential, ExchangeError>> {
        Box::pin(self.send(refresh_token))
    }
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

/// Map a non-2xx status onto retryable vs. terminal.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> ExchangeError {
    let truncated = truncate_body(body);
    match status.as_u16() {
        408 | 429 | 502 | 503 | 504 => {
            ExchangeError::Transient(format!("status {}: {}", status, truncated))
        }
        _ => ExchangeError::Rejected(format!("status {}: {}", status, truncated)),
    }
}
