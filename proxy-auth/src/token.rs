//! Canonical token codec.
//!
//! Wire layout: the CBOR array `[expire_at, message, signature]` framed as
//! base64url (no padding) behind a `Bearer ` prefix. The signature never
//! covers itself; signers sign the CBOR array `[expire_at, message]` only.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_bytes::{ByteBuf, Bytes};

use crate::AuthError;

const BEARER_PREFIX: &str = "Bearer ";

/// Signed authentication token: `(expire_at, message, signature)`.
///
/// `expire_at` is in unix seconds. `message` carries the agent identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub expire_at: u64,
    pub message: String,
    pub signature: Vec<u8>,
}

impl Token {
    pub fn to_bytes(&self) -> Result<Vec<u8>, AuthError> {
        let mut buf = Vec::new();
        ciborium::into_writer(
            &(self.expire_at, &self.message, Bytes::new(&self.signature)),
            &mut buf,
        )
        .map_err(|e| AuthError::Encode(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, AuthError> {
        let mut reader = data;
        let (expire_at, message, signature): (u64, String, ByteBuf) =
            ciborium::from_reader(&mut reader).map_err(|e| AuthError::Decode(e.to_string()))?;
        if !reader.is_empty() {
            return Err(AuthError::Decode(format!(
                "{} trailing bytes after token",
                reader.len()
            )));
        }

        Ok(Self {
            expire_at,
            message,
            signature: signature.into_vec(),
        })
    }

    /// Render as an `Authorization`-style header value.
    pub fn to_bearer(&self) -> Result<String, AuthError> {
        Ok(format!("{}{}", BEARER_PREFIX, URL_SAFE_NO_PAD.encode(self.to_bytes()?)))
    }
}

/// Bytes covered by the signature.
pub fn signing_payload(expire_at: u64, message: &str) -> Result<Vec<u8>, AuthError> {
    let mut buf = Vec::new();
    ciborium::into_writer(&(expire_at, message), &mut buf)
        .map_err(|e| AuthError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Strip the `Bearer ` prefix and base64url-decode the token bytes.
///
/// The bytes are not parsed here; the verifiers do that so structural
/// errors and signature errors surface from one place.
pub fn decode_bearer(header: &str) -> Result<Vec<u8>, AuthError> {
    let encoded = header
        .strip_prefix(BEARER_PREFIX)
        .ok_or(AuthError::MissingBearer)?;

    URL_SAFE_NO_PAD
        .decode(encoded.trim().as_bytes())
        .map_err(|e| AuthError::Decode(format!("base64: {}", e)))
}
