//! Caller identity at the HTTP boundary.
//!
//! Identity is supplied by the upstream auth service as `x-tenant-id` and
//! `x-user-id` headers (or `tenant`/`user` query parameters on the voice
//! socket, where browsers cannot set headers). When `[auth].shared_secret_env`
//! names a secret, the pair must also carry a signature:
//!
//! ```text
//! x-identity-signature = hex(HMAC-SHA256(secret, "<tenant>:<user>"))
//! ```
//!
//! Beyond that check the identity is trusted as given.

use anyhow::Result;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::config::AuthConfig;
use crate::models::Identity;

type HmacSha256 = Hmac<Sha256>;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";
pub const SIGNATURE_HEADER: &str = "x-identity-signature";

const MAX_ID_LEN: usize = 128;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing caller identity ({TENANT_HEADER} and {USER_HEADER} are required)")]
    MissingIdentity,

    #[error("invalid {0}")]
    InvalidIdentity(String),

    #[error("missing {SIGNATURE_HEADER}")]
    MissingSignature,

    #[error("identity signature does not match")]
    BadSignature,
}

/// Raw identity claims from one request.
#[derive(Debug, Default, Clone)]
pub struct IdentityClaims<'a> {
    pub tenant: Option<&'a str>,
    pub user: Option<&'a str>,
    pub signature: Option<&'a str>,
}

#[derive(Clone, Default)]
pub struct IdentityVerifier {
    secret: Option<Vec<u8>>,
}

impl IdentityVerifier {
    pub fn new(secret: Option<Vec<u8>>) -> Self {
        Self { secret }
    }

    /// Reads the secret named by `shared_secret_env`. A configured but unset
    /// variable is an error, so signing is never silently switched off.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        match &config.shared_secret_env {
            None => Ok(Self::new(None)),
            Some(var) => {
                let secret = std::env::var(var).map_err(|_| {
                    anyhow::anyhow!("{} environment variable not set (auth.shared_secret_env)", var)
                })?;
                if secret.is_empty() {
                    anyhow::bail!("{} must not be empty", var);
                }
                Ok(Self::new(Some(secret.into_bytes())))
            }
        }
    }

    pub fn requires_signature(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(&self, claims: &IdentityClaims<'_>) -> Result<Identity, AuthError> {
        let (tenant, user) = match (claims.tenant, claims.user) {
            (Some(t), Some(u)) => (t.trim(), u.trim()),
            _ => return Err(AuthError::MissingIdentity),
        };
        validate_id("tenant id", tenant)?;
        validate_id("user id", user)?;

        if let Some(secret) = &self.secret {
            let signature = claims.signature.ok_or(AuthError::MissingSignature)?;
            let expected = hex::decode(signature.trim()).map_err(|_| AuthError::BadSignature)?;
            let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::BadSignature)?;
            mac.update(signing_payload(tenant, user).as_bytes());
            mac.verify_slice(&expected)
                .map_err(|_| AuthError::BadSignature)?;
        }

        Ok(Identity::new(tenant, user))
    }
}

fn validate_id(label: &str, value: &str) -> Result<(), AuthError> {
    if value.is_empty()
        || value.len() > MAX_ID_LEN
        || value.contains(':')
        || value.chars().any(char::is_control)
    {
        return Err(AuthError::InvalidIdentity(label.to_string()));
    }
    Ok(())
}

fn signing_payload(tenant: &str, user: &str) -> String {
    format!("{}:{}", tenant, user)
}

/// Signature an upstream auth service attaches to `(tenant, user)`.
pub fn sign(secret: &[u8], tenant: &str, user: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("invalid HMAC key: {}", e))?;
    mac.update(signing_payload(tenant, user).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims<'a>(t: &'a str, u: &'a str, sig: Option<&'a str>) -> IdentityClaims<'a> {
        IdentityClaims {
            tenant: Some(t),
            user: Some(u),
            signature: sig,
        }
    }

    #[test]
    fn test_unsigned_mode_trusts_headers() {
        let v = IdentityVerifier::default();
        let id = v.verify(&claims("acme", "alice", None)).unwrap();
        assert_eq!(id, Identity::new("acme", "alice"));
        assert_eq!(
            v.verify(&IdentityClaims::default()).unwrap_err(),
            AuthError::MissingIdentity
        );
    }

    #[test]
    fn test_rejects_malformed_ids() {
        let v = IdentityVerifier::default();
        assert!(matches!(
            v.verify(&claims("", "alice", None)),
            Err(AuthError::InvalidIdentity(_))
        ));
        assert!(matches!(
            v.verify(&claims("a:b", "alice", None)),
            Err(AuthError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn test_signed_mode() {
        let v = IdentityVerifier::new(Some(b"s3cret".to_vec()));
        let sig = sign(b"s3cret", "acme", "alice").unwrap();

        assert!(v.verify(&claims("acme", "alice", Some(&sig))).is_ok());
        assert_eq!(
            v.verify(&claims("acme", "alice", None)).unwrap_err(),
            AuthError::MissingSignature
        );
        assert_eq!(
            v.verify(&claims("acme", "mallory", Some(&sig))).unwrap_err(),
            AuthError::BadSignature
        );
        assert_eq!(
            v.verify(&claims("acme", "alice", Some("zz"))).unwrap_err(),
            AuthError::BadSignature
        );
    }
}
