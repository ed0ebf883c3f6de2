//! OAuth `state` parameter encoding.
//!
//! The state carries two things through the authorization server: a random
//! CSRF token and a structured "return state" the callback uses to rebuild
//! the browser redirect. Both are wrapped in one JSON object and
//! base64url-encoded; the authorization server treats it as opaque.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Decoded `state` parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    /// 32 random bytes, hex-encoded (64 chars)
    pub csrf: String,
    /// Opaque return state re-attached to the browser redirect
    #[serde(rename = "return")]
    pub return_state: Value,
}

/// Encode a fresh state for an authorization redirect.
#[must_use]
pub fn encode_state(return_state: Value) -> String {
    let csrf_bytes: [u8; 32] = rand::rng().random();
    let state = OAuthState {
        csrf: hex::encode(csrf_bytes),
        return_state,
    };
    // Serialization of a Value cannot fail
    let json = serde_json::to_vec(&state).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode a `state` parameter received on the callback.
///
/// # Errors
///
/// Returns `Error::Validation` on malformed base64, malformed JSON, or a
/// CSRF token of the wrong shape.
pub fn decode_state(state: &str) -> Result<OAuthState> {
    let bytes = URL_SAFE_NO_PAD
        .decode(state)
        .map_err(|_| Error::Validation("Malformed state parameter".to_string()))?;

    let decoded: OAuthState = serde_json::from_slice(&bytes)
        .map_err(|_| Error::Validation("Malformed state parameter".to_string()))?;

    if decoded.csrf.len() != 64 || !decoded.csrf.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Validation("Malformed state parameter".to_string()));
    }

    Ok(decoded)
}
