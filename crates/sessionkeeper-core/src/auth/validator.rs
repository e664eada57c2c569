use std::sync::Arc;

use super::claims::{ClaimsDecoder, JwtClaimsDecoder};
use super::credential::Credential;

/// Structural and temporal checks over a credential.
///
/// Holds no state besides the decoder, so every answer depends only on the
/// credential and the `now` passed in. Any ambiguity is answered fail-closed.
#[derive(Clone)]
pub struct CredentialValidator {
    decoder: Arc<dyn ClaimsDecoder>,
}

impl Default for CredentialValidator {
    fn default() -> Self {
        Self::new(Arc::new(JwtClaimsDecoder))
    }
}

impl CredentialValidator {
    pub fn new(decoder: Arc<dyn ClaimsDecoder>) -> Self {
        Self { decoder }
    }

    pub fn decoder(&self) -> &Arc<dyn ClaimsDecoder> {
        &self.decoder
    }

    /// Both tokens look like compact signed tokens and the metadata is usable.
    pub fn is_structurally_valid(credential: &Credential) -> bool {
        is_signed_token_shape(&credential.access_token)
            && is_signed_token_shape(&credential.refresh_token)
            && !credential.token_type.trim().is_empty()
            && credential.expires_in_seconds > 0
    }

    /// Expired when claims are unreadable, incomplete, or `exp <= now`.
    pub fn is_expired(&self, credential: &Credential, now: i64) -> bool {
        match self.decoder.decode(&credential.access_token) {
            Ok(claims) if claims.has_required() => match claims.expiry_epoch_seconds {
                Some(exp) => exp <= now,
                None => true,
            },
            _ => true,
        }
    }

    /// True once `exp - now <= window_seconds`.
    pub fn is_within_refresh_window(
        &self,
        credential: &Credential,
        now: i64,
        window_seconds: u64,
    ) -> bool {
        match self.seconds_until_expiry(credential, now) {
            Some(remaining) => remaining <= window_seconds as i64,
            None => true,
        }
    }

    /// Seconds left before expiry (negative once past), or `None` if unknown.
    pub fn seconds_until_expiry(&self, credential: &Credential, now: i64) -> Option<i64> {
        self.decoder
            .decode(&credential.access_token)
            .ok()
            .and_then(|claims| claims.expiry_epoch_seconds)
            .map(|exp| exp - now)
    }
}

/// Three dot-separated base64url segments; header and payload non-empty.
fn is_signed_token_shape(token: &str) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 || segments[0].is_empty() || segments[1].is_empty() {
        return false;
    }
    segments.iter().all(|segment| {
        segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
    })
}
