//! Credential model and the checks applied before a credential is trusted.
//!
//! This module provides:
//! - `Credential`: the access/refresh token pair
//! - `Claims` / `ClaimsDecoder`: client-side, unverified claim decoding
//! - `CredentialValidator`: structural, expiry, and refresh-window checks

pub mod claims;
pub mod credential;
pub mod validator;

pub use claims::{Claims, ClaimsDecoder, JwtClaimsDecoder};
pub use credential::Credential;
pub(crate) use credential::TokenResponse;
pub use validator::CredentialValidator;
