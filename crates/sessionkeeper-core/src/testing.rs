//! Helpers shared by unit tests: synthetic tokens, credentials, and a
//! scripted refresh transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::auth::Credential;
use crate::error::ExchangeError;
use crate::refresh::RefreshTransport;

/// Unsigned compact token carrying `claims` as its payload.
pub fn mint_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.c2lnbmF0dXJl", header, payload)
}

pub fn credential_for(subject: &str, exp: i64, expires_in: u64) -> Credential {
    Credential {
        access_token: mint_token(&json!({
            "sub": subject,
            "iss": "web_scraping_platform",
            "exp": exp,
            "role": "analyst",
            "permissions": ["tasks:read"],
        })),
        refresh_token: mint_token(&json!({
            "sub": subject,
            "typ": "refresh",
            "exp": exp + 86_400,
        })),
        expires_in_seconds: expires_in,
        token_type: "Bearer".to_string(),
        scope: "tasks:read".to_string(),
    }
}

pub fn credential_expiring_at(exp: i64, expires_in: u64) -> Credential {
    credential_for("user-1", exp, expires_in)
}

/// Transport that replays a fixed script of outcomes and counts calls.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<Credential, ExchangeError>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<Credential, ExchangeError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Each exchange sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RefreshTransport for ScriptedTransport {
    fn exchange<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<Credential, ExchangeError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ExchangeError::Transient("script exhausted".into())))
        })
    }
}
