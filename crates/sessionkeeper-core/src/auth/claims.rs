//! Client-side claims decoding.
//!
//! Claims are read from the access token without verifying its signature. They
//! drive UX decisions (expiry timers, role-dependent views) only; the server
//! remains the authority on whether a token is valid.

use std::collections::BTreeSet;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ClaimsError;

/// Assertions carried in an access token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Claims {
    #[serde(rename = "sub", default)]
    pub subject: Option<String>,
    #[serde(rename = "iss", default)]
    pub issuer: Option<String>,
    #[serde(rename = "exp", default)]
    pub expiry_epoch_seconds: Option<i64>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub mfa_required: bool,
}

impl Claims {
    /// `sub`, `iss`, `exp` and `role` are all present and non-empty.
    pub fn has_required(&self) -> bool {
        let non_empty = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        non_empty(&self.subject)
            && non_empty(&self.issuer)
            && non_empty(&self.role)
            && self.expiry_epoch_seconds.is_some()
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// Turns an opaque token into claims.
pub trait ClaimsDecoder: Send + Sync {
    fn decode(&self, token: &str) -> Result<Claims, ClaimsError>;
}

/// Decodes the payload segment of a compact JWS (`header.payload.signature`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JwtClaimsDecoder;

impl ClaimsDecoder for JwtClaimsDecoder {
    fn decode(&self, token: &str) -> Result<Claims, ClaimsError> {
        let mut parts = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ClaimsError::Shape);
        };
        if payload.is_empty() {
            return Err(ClaimsError::Shape);
        }

        // Some issuers pad their segments; tolerate it.
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|_| ClaimsError::Encoding)?;

        serde_json::from_slice(&bytes).map_err(|e| ClaimsError::Payload(e.to_string()))
    }
}
