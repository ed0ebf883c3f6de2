//! Gateway token issuance and verification.
//!
//! Tokens are RS256 JWTs signed with a single private JWK and verified
//! against a (possibly multi-key) JWKS resolved by `kid`. The same token
//! doubles as the bearer for the external LLM proxy, which consumes the
//! pass-through claims verbatim.
//!
//! When no key pair is configured the service falls back to opaque
//! process-lifetime session tokens; verification accepts either form.

use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use jsonwebtoken::{
    jwk::{AlgorithmParameters, JwkSet},
    Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use rand::RngExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::config::{AuthConfig, PassthroughClaims};
use crate::{Error, Result};

/// Strict RFC 4122 v4 grammar: hyphenated, version nibble `4`, variant `[89ab]`.
static UUID_V4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
    )
    .expect("static regex")
});

/// Claims carried by every issued gateway token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Tenant id (UUID v4)
    pub sub: String,
    /// Synthetic log key: `<sub>@hoot.local`
    pub email_id: String,
    /// Pass-through for the LLM proxy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portkey_oid: Option<String>,
    /// Pass-through for the LLM proxy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portkey_workspace: Option<String>,
    /// Pass-through for the LLM proxy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Expiry (Unix seconds)
    pub exp: u64,
    /// Issued-at (Unix seconds)
    pub iat: u64,
}

/// An issued token plus its wire form
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// The bearer value
    pub token: String,
    /// `"jwt"` or `"session"`
    pub token_type: &'static str,
}

/// Opaque fallback session token state
struct Session {
    tenant: String,
    digest: [u8; 32],
    expires_at: u64,
}

/// Token issuer/verifier shared by the façade and the middleware.
pub struct TokenService {
    /// RS256 signing key and its `kid`; `None` activates the fallback
    signing: Option<(EncodingKey, String)>,
    /// Verification key set
    jwks: Option<JwkSet>,
    /// Public JWKS served on `/.well-known/jwks.json`
    jwks_public: serde_json::Value,
    /// Opaque fallback sessions keyed by token digest (hex)
    sessions: DashMap<String, Session>,
    ttl: Duration,
    passthrough: PassthroughClaims,
}

impl TokenService {
    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a private key or JWKS is present but
    /// malformed. A missing key pair is not an error; it selects the
    /// opaque-session fallback.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let signing = match config.resolve_private_key() {
            Some(pem) => {
                let key = EncodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| Error::Config(format!("Invalid RS256 private key: {e}")))?;
                Some((key, config.kid.clone()))
            }
            None => None,
        };

        let (jwks, jwks_public) = match config.resolve_jwks() {
            Some(json) => {
                let set: JwkSet = serde_json::from_str(&json)
                    .map_err(|e| Error::Config(format!("Invalid JWKS: {e}")))?;
                let value = serde_json::from_str(&json)
                    .map_err(|e| Error::Config(format!("Invalid JWKS: {e}")))?;
                (Some(set), value)
            }
            None => (None, serde_json::json!({ "keys": [] })),
        };

        if signing.is_some() && jwks.is_none() {
            return Err(Error::Config(
                "A signing key requires a JWKS for verification".to_string(),
            ));
        }

        if signing.is_none() {
            info!("No signing key configured, using opaque session tokens");
        }

        Ok(Self {
            signing,
            jwks,
            jwks_public,
            sessions: DashMap::new(),
            ttl: config.token_ttl,
            passthrough: config.passthrough.clone(),
        })
    }

    /// Issue a token for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` unless `user_id` matches the RFC 4122 v4
    /// grammar exactly.
    pub fn issue(&self, user_id: &str) -> Result<IssuedToken> {
        if !is_uuid_v4(user_id) {
            return Err(Error::Validation(format!(
                "userId must be a UUID v4, got {user_id:?}"
            )));
        }

        let now = unix_now();
        match &self.signing {
            Some((key, kid)) => {
                let claims = Claims {
                    sub: user_id.to_string(),
                    email_id: format!("{user_id}@hoot.local"),
                    portkey_oid: self.passthrough.portkey_oid.clone(),
                    portkey_workspace: self.passthrough.portkey_workspace.clone(),
                    scope: self.passthrough.scope.clone(),
                    exp: now + self.ttl.as_secs(),
                    iat: now,
                };
                let mut header = Header::new(Algorithm::RS256);
                header.kid = Some(kid.clone());
                let token = jsonwebtoken::encode(&header, &claims, key)
                    .map_err(|e| Error::Internal(format!("Token signing failed: {e}")))?;
                Ok(IssuedToken {
                    token,
                    token_type: "jwt",
                })
            }
            None => {
                let raw: [u8; 32] = rand::rng().random();
                let token = format!("hoot_sess_{}", URL_SAFE_NO_PAD.encode(raw));
                let digest = token_digest(&token);
                self.sessions.insert(
                    hex::encode(digest),
                    Session {
                        tenant: user_id.to_string(),
                        digest,
                        expires_at: now + self.ttl.as_secs(),
                    },
                );
                debug!(tenant = %user_id, "Issued opaque session token");
                Ok(IssuedToken {
                    token,
                    token_type: "session",
                })
            }
        }
    }

    /// Verify a bearer and return the tenant id from its subject.
    ///
    /// # Errors
    ///
    /// `TokenExpired` only when the signature is valid and `exp` has passed;
    /// `TokenInvalid` for any structural or signature failure.
    pub fn verify(&self, token: &str) -> Result<String> {
        if token.starts_with("hoot_sess_") {
            return self.verify_session(token);
        }
        match &self.jwks {
            Some(jwks) => self.verify_jwt(token, jwks).map(|c| c.sub),
            None => self.verify_session(token),
        }
    }

    fn verify_jwt(&self, token: &str, jwks: &JwkSet) -> Result<Claims> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::TokenInvalid(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| Error::TokenInvalid("missing kid".to_string()))?;

        let key = find_key(jwks, &kid)
            .ok_or_else(|| Error::TokenInvalid(format!("unknown kid {kid}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 60;
        validation.validate_aud = false;

        match jsonwebtoken::decode::<Claims>(token, &key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(Error::TokenExpired),
                _ => Err(Error::TokenInvalid(e.to_string())),
            },
        }
    }

    fn verify_session(&self, token: &str) -> Result<String> {
        let digest = token_digest(token);
        let key = hex::encode(digest);

        let expired = match self.sessions.get(&key) {
            Some(session) => {
                if session.digest.as_ref().ct_eq(digest.as_ref()).unwrap_u8() != 1 {
                    return Err(Error::TokenInvalid("unknown session token".to_string()));
                }
                if unix_now() >= session.expires_at {
                    true
                } else {
                    return Ok(session.tenant.clone());
                }
            }
            None => return Err(Error::TokenInvalid("unknown session token".to_string())),
        };

        if expired {
            self.sessions.remove(&key);
        }
        Err(Error::TokenExpired)
    }

    /// Public JWKS document (public keys only).
    #[must_use]
    pub fn public_jwks(&self) -> serde_json::Value {
        self.jwks_public.clone()
    }
}

/// Resolve a JWK by `kid` into a decoding key.
fn find_key(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        if jwk.common.key_id.as_deref() != Some(kid) {
            continue;
        }
        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            _ => None,
        };
    }
    None
}

fn token_digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Whether `value` matches the strict RFC 4122 v4 grammar.
#[must_use]
pub fn is_uuid_v4(value: &str) -> bool {
    UUID_V4.is_match(value)
        && uuid::Uuid::parse_str(value).is_ok_and(|u| u.get_version_num() == 4)
}
