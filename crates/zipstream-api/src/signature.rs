//! Request signature and expiry verification.
//!
//! Canonicalization: the signed payload is the manifest id, or
//! `id + "|" + expiry` when an expiry is present. The signature is the
//! lowercase hex of HMAC-SHA256 over that payload. Verification is
//! constant-time via the MAC itself.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::metrics::{EXPIRED_REQUESTS_TOTAL, SIGNATURE_FAILURES_TOTAL};

type HmacSha256 = Hmac<Sha256>;

/// Why a request was rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    /// The expiry query parameter is not a base-10 Unix timestamp.
    #[error("invalid expiry: {0}")]
    InvalidExpiry(String),
    /// The expiry has passed.
    #[error("request has expired")]
    Expired,
    /// Signing is enforced but no signature was supplied.
    #[error("signature required")]
    MissingSignature,
    /// The supplied signature does not match.
    #[error("invalid signature")]
    InvalidSignature,
}

/// Verifies the optional HMAC gate on inbound requests.
#[derive(Clone)]
pub struct Verifier {
    secret: Vec<u8>,
    enforce: bool,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("secret", &"[REDACTED]")
            .field("enforce", &self.enforce)
            .finish()
    }
}

impl Verifier {
    /// Creates a verifier with the given secret and enforcement flag.
    #[must_use]
    pub fn new(secret: Vec<u8>, enforce: bool) -> Self {
        Self { secret, enforce }
    }

    /// Checks expiry and signature for one request.
    ///
    /// The signature is required when enforcement is on or when the client
    /// supplied one; otherwise unsigned requests pass.
    ///
    /// # Errors
    ///
    /// Returns the applicable [`VerifyError`]; expiry and signature
    /// failure counters are incremented here.
    pub fn verify(
        &self,
        id: &str,
        expiry: Option<&str>,
        signature: Option<&str>,
    ) -> Result<(), VerifyError> {
        if let Some(expiry_str) = expiry {
            let expiry_ts: i64 = expiry_str
                .parse()
                .map_err(|_| VerifyError::InvalidExpiry(expiry_str.to_string()))?;
            if Utc::now().timestamp() > expiry_ts {
                metrics::counter!(EXPIRED_REQUESTS_TOTAL).increment(1);
                return Err(VerifyError::Expired);
            }
        }

        let signature = signature.filter(|s| !s.is_empty());
        if self.enforce || signature.is_some() {
            let Some(signature) = signature else {
                metrics::counter!(SIGNATURE_FAILURES_TOTAL).increment(1);
                return Err(VerifyError::MissingSignature);
            };
            if self.verify_signature(id, expiry, signature).is_err() {
                metrics::counter!(SIGNATURE_FAILURES_TOTAL).increment(1);
                return Err(VerifyError::InvalidSignature);
            }
        }

        Ok(())
    }

    fn verify_signature(
        &self,
        id: &str,
        expiry: Option<&str>,
        signature: &str,
    ) -> Result<(), VerifyError> {
        let supplied = hex::decode(signature).map_err(|_| VerifyError::InvalidSignature)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(payload(id, expiry).as_bytes());
        mac.verify_slice(&supplied)
            .map_err(|_| VerifyError::InvalidSignature)
    }

    /// Computes the lowercase hex signature for a payload; used by tests
    /// and by operators generating links.
    #[must_use]
    pub fn sign(&self, id: &str, expiry: Option<&str>) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(payload(id, expiry).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

fn payload(id: &str, expiry: Option<&str>) -> String {
    match expiry {
        Some(expiry) => format!("{id}|{expiry}"),
        None => id.to_string(),
    }
}
