//! Token verification at the upgrade boundary.
//!
//! Token issuance lives with the platform's auth service; the gateway
//! only verifies. The [`TokenVerifier`] trait is the seam; the shipped
//! verifier checks an HMAC-SHA256 tag over `principal:expiry` with a
//! symmetric secret (inline in config, or loaded from a key file).
//!
//! Token wire format: `{principal}:{expiry_unix}:{hex_mac}`.

use chrono::Utc;
use hmac::{Hmac, Mac as _};
use sha2::Sha256;
use vellum_core::PrincipalId;

use crate::error::{GatewayError, GatewayResult};

type HmacSha256 = Hmac<Sha256>;

/// Identity established by a verified token.
#[derive(Debug, Clone)]
pub struct AuthClaims {
    /// The authenticated principal.
    pub principal: PrincipalId,
    /// Display name (defaults to the principal id).
    pub username: String,
}

/// Verifies bearer tokens presented at the handshake.
pub trait TokenVerifier: Send + Sync + 'static {
    /// Verify a token and extract its claims.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Unauthorized`] for any malformed, mis-signed, or
    /// expired token.
    fn verify(&self, token: &str) -> GatewayResult<AuthClaims>;
}

/// HMAC-SHA256 token verifier over a symmetric secret.
pub struct HmacTokenVerifier {
    key: Vec<u8>,
}

impl HmacTokenVerifier {
    /// Build a verifier from an inline secret.
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    /// Build a verifier from key material on disk.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Io`] if the file cannot be read.
    pub fn from_key_file(path: &std::path::Path) -> GatewayResult<Self> {
        let key = std::fs::read(path)?;
        Ok(Self { key })
    }

    /// Mint a token for `principal` valid for `ttl` (tooling and tests;
    /// production issuance is the auth service's job).
    #[must_use]
    pub fn issue(&self, principal: &PrincipalId, ttl: std::time::Duration) -> String {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expiry = Utc::now().timestamp().saturating_add(ttl);
        let tag = self.tag(principal.as_str(), expiry);
        format!("{}:{expiry}:{tag}", principal.as_str())
    }

    fn tag(&self, principal: &str, expiry: i64) -> String {
        // HMAC accepts any key length; the Err arm is unreachable.
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            return String::new();
        };
        mac.update(principal.as_bytes());
        mac.update(b":");
        mac.update(expiry.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl TokenVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> GatewayResult<AuthClaims> {
        // Split from the right: the principal may contain ':'.
        let mut parts = token.rsplitn(3, ':');
        let (Some(tag), Some(expiry), Some(principal)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(GatewayError::Unauthorized("malformed token".to_owned()));
        };

        let expiry: i64 = expiry
            .parse()
            .map_err(|_| GatewayError::Unauthorized("malformed expiry".to_owned()))?;
        if expiry < Utc::now().timestamp() {
            return Err(GatewayError::Unauthorized("token expired".to_owned()));
        }

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| GatewayError::Unauthorized("verifier misconfigured".to_owned()))?;
        mac.update(principal.as_bytes());
        mac.update(b":");
        mac.update(expiry.to_string().as_bytes());
        let tag_bytes = hex::decode(tag)
            .map_err(|_| GatewayError::Unauthorized("malformed signature".to_owned()))?;
        mac.verify_slice(&tag_bytes)
            .map_err(|_| GatewayError::Unauthorized("bad signature".to_owned()))?;

        Ok(AuthClaims {
            principal: PrincipalId::new(principal),
            username: principal.to_owned(),
        })
    }
}
