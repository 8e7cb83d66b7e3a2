//! Proxy Auth - signed bearer tokens for the idempotent proxy
//!
//! Callers present `proxy-authorization: Bearer <base64url(token)>` where the
//! token is `(expire_at, agent, signature)`. The proxy trusts any number of
//! public keys per scheme so keys can be rotated without downtime.
//!
//! Schemes:
//! 1. Ed25519: signature over the canonical `(expire_at, agent)` bytes
//! 2. ECDSA/secp256k1: signature over SHA3-256 of the same bytes (prehash)
//!
//! When both key sets are configured, ECDSA is used.

mod token;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::Signer;
use k256::ecdsa::{
    self,
    signature::hazmat::{PrehashSigner, PrehashVerifier},
};
use sha3::{Digest, Sha3_256};
use std::time::{SystemTime, UNIX_EPOCH};

pub use token::{decode_bearer, signing_payload, Token};

/// Tolerated clock skew when checking `expire_at`, in seconds.
pub const PERMITTED_DRIFT: u64 = 10;

/// Public keys the proxy accepts tokens from.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    pub ecdsa: Vec<ecdsa::VerifyingKey>,
    pub ed25519: Vec<ed25519_dalek::VerifyingKey>,
}

impl TrustedKeys {
    /// No keys means authentication is disabled.
    pub fn is_empty(&self) -> bool {
        self.ecdsa.is_empty() && self.ed25519.is_empty()
    }

    pub fn verify_at(&self, data: &[u8], now: u64) -> Result<Token, AuthError> {
        if !self.ecdsa.is_empty() {
            return ecdsa_verify(&self.ecdsa, data, now);
        }
        if !self.ed25519.is_empty() {
            return ed25519_verify(&self.ed25519, data, now);
        }

        Err(AuthError::NoPublicKey)
    }

    pub fn verify(&self, data: &[u8]) -> Result<Token, AuthError> {
        self.verify_at(data, unix_now())
    }

    /// Verify a full `Bearer ...` header value.
    ///
    /// Returns `(expire_at, message)`.
    pub fn verify_bearer(&self, header: &str) -> Result<(u64, String), AuthError> {
        let data = decode_bearer(header)?;
        let token = self.verify(&data)?;
        Ok((token.expire_at, token.message))
    }
}

/// Sign with Ed25519 over the canonical payload.
pub fn ed25519_sign(
    key: &ed25519_dalek::SigningKey,
    expire_at: u64,
    message: &str,
) -> Result<Token, AuthError> {
    let payload = signing_payload(expire_at, message)?;
    let signature = key.sign(&payload).to_bytes().to_vec();

    Ok(Token {
        expire_at,
        message: message.to_string(),
        signature,
    })
}

/// Verify an Ed25519 token against any of `keys`.
pub fn ed25519_verify(
    keys: &[ed25519_dalek::VerifyingKey],
    data: &[u8],
    now: u64,
) -> Result<Token, AuthError> {
    let token = Token::from_bytes(data)?;
    check_expiry(&token, now)?;

    let sig = ed25519_dalek::Signature::from_slice(&token.signature)
        .map_err(|e| AuthError::InvalidSignature(format!("ed25519: {}", e)))?;
    let payload = signing_payload(token.expire_at, &token.message)?;

    if keys.iter().any(|key| key.verify_strict(&payload, &sig).is_ok()) {
        return Ok(token);
    }

    Err(AuthError::NoMatchingKey)
}

/// Sign with secp256k1 ECDSA over SHA3-256 of the canonical payload.
pub fn ecdsa_sign(
    key: &ecdsa::SigningKey,
    expire_at: u64,
    message: &str,
) -> Result<Token, AuthError> {
    let payload = signing_payload(expire_at, message)?;
    let digest = sha3_256(&payload);
    let sig: ecdsa::Signature = key
        .sign_prehash(&digest)
        .map_err(|e| AuthError::Signing(e.to_string()))?;

    Ok(Token {
        expire_at,
        message: message.to_string(),
        signature: sig.to_bytes().to_vec(),
    })
}

/// Verify a secp256k1 token against any of `keys`.
pub fn ecdsa_verify(
    keys: &[ecdsa::VerifyingKey],
    data: &[u8],
    now: u64,
) -> Result<Token, AuthError> {
    let token = Token::from_bytes(data)?;
    check_expiry(&token, now)?;

    let sig = ecdsa::Signature::from_slice(&token.signature)
        .map_err(|e| AuthError::InvalidSignature(format!("secp256k1: {}", e)))?;
    let digest = sha3_256(&signing_payload(token.expire_at, &token.message)?);

    if keys.iter().any(|key| key.verify_prehash(&digest, &sig).is_ok()) {
        return Ok(token);
    }

    Err(AuthError::NoMatchingKey)
}

/// Parse a base64url (no padding) Ed25519 public key.
pub fn parse_ed25519_key(encoded: &str) -> Result<ed25519_dalek::VerifyingKey, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim().as_bytes())
        .map_err(|e| AuthError::InvalidPublicKey(format!("base64 decode: {}", e)))?;

    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        AuthError::InvalidPublicKey(format!("expected 32 bytes, got {}", bytes.len()))
    })?;

    ed25519_dalek::VerifyingKey::from_bytes(&arr)
        .map_err(|e| AuthError::InvalidPublicKey(format!("ed25519 parse error: {}", e)))
}

/// Parse a base64url (no padding) SEC1-encoded secp256k1 public key.
pub fn parse_ecdsa_key(encoded: &str) -> Result<ecdsa::VerifyingKey, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim().as_bytes())
        .map_err(|e| AuthError::InvalidPublicKey(format!("base64 decode: {}", e)))?;

    ecdsa::VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| AuthError::InvalidPublicKey(format!("secp256k1 parse error: {}", e)))
}

pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn check_expiry(token: &Token, now: u64) -> Result<(), AuthError> {
    if token.expire_at.saturating_add(PERMITTED_DRIFT) < now {
        return Err(AuthError::Expired(token.expire_at));
    }
    Ok(())
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing Bearer token")]
    MissingBearer,
    #[error("failed to decode token: {0}")]
    Decode(String),
    #[error("failed to encode token: {0}")]
    Encode(String),
    #[error("token expired at {0}")]
    Expired(u64),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("no public key configured")]
    NoPublicKey,
    #[error("signature verification failed")]
    NoMatchingKey,
}
