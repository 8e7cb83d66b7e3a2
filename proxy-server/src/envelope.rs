//! Captured upstream response, as stored for replay.
//!
//! ## Projection
//! - Headers: `content-length` is always dropped, `content-type` moves into
//!   `mime`, and a non-empty `response-headers` allow-list keeps only the
//!   named headers (case-insensitive).
//! - Body: for status < 300 with a non-empty `x-json-mask`, JSON and CBOR map
//!   bodies keep only the masked top-level keys. Everything else passes
//!   through untouched so error payloads stay intact.
//!
//! ## Rendering
//! Replays always go out as HTTP 200. The upstream status only lives inside
//! the stored envelope.

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ProxyError;

pub const DEFAULT_MIME: &str = "text/plain";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    /// Duplicates are kept in upstream order
    pub headers: Vec<(String, String)>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    pub mime: String,
}

impl Default for ResponseEnvelope {
    fn default() -> Self {
        Self::new(200)
    }
}

impl ResponseEnvelope {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            mime: DEFAULT_MIME.to_string(),
        }
    }

    pub fn with_headers(&mut self, headers: &HeaderMap, allow_list: &str) {
        let allow_list = allow_list.to_ascii_lowercase();
        let allowed = split_list(&allow_list);

        for (name, value) in headers.iter() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            let name = name.as_str();
            if name == header::CONTENT_TYPE.as_str() {
                self.mime = value.to_string();
            } else if name != header::CONTENT_LENGTH.as_str()
                && (allowed.is_empty() || allowed.contains(&name))
            {
                self.headers.push((name.to_string(), value.to_string()));
            }
        }
    }

    /// Store the body, projecting it through `mask` when applicable.
    ///
    /// Must run after `with_headers`, which sets `mime`.
    pub fn with_body(&mut self, body: &[u8], mask: &str) -> Result<(), ProxyError> {
        let mask = split_list(mask);
        let projected = if self.status >= 300 || mask.is_empty() {
            None
        } else if self.mime.contains("application/json") {
            Some(mask_json(body, &mask)?)
        } else if self.mime.contains("application/cbor") {
            Some(mask_cbor(body, &mask)?)
        } else {
            None
        };

        self.body = projected.unwrap_or_else(|| body.to_vec());
        Ok(())
    }

    /// CBOR map `{status, headers, body, mime}`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProxyError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| ProxyError::Internal(format!("encode envelope: {}", e)))?;
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProxyError> {
        ciborium::from_reader(data)
            .map_err(|e| ProxyError::Internal(format!("decode envelope: {}", e)))
    }
}

fn mask_json(body: &[u8], mask: &[&str]) -> Result<Vec<u8>, ProxyError> {
    let obj: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::Internal(format!("invalid JSON body: {}", e)))?;

    let mut projected = serde_json::Map::with_capacity(mask.len());
    for key in mask {
        if let Some(v) = obj.get(*key) {
            projected.insert(key.to_string(), v.clone());
        }
    }

    serde_json::to_vec(&projected).map_err(|e| ProxyError::Internal(e.to_string()))
}

fn mask_cbor(body: &[u8], mask: &[&str]) -> Result<Vec<u8>, ProxyError> {
    let obj: ciborium::Value = ciborium::from_reader(body)
        .map_err(|e| ProxyError::Internal(format!("invalid CBOR body: {}", e)))?;

    let entries = match obj.into_map() {
        Ok(mut entries) => {
            entries.retain(|(k, _)| k.as_text().is_some_and(|t| mask.contains(&t)));
            entries
        }
        Err(_) => Vec::new(),
    };

    let mut buf = Vec::new();
    ciborium::into_writer(&ciborium::Value::Map(entries), &mut buf)
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    Ok(buf)
}

/// Comma-separated list, trimmed, empties dropped.
pub fn split_list(list: &str) -> Vec<&str> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

impl IntoResponse for ResponseEnvelope {
    fn into_response(self) -> Response {
        let len = self.body.len();
        let mut res = Response::new(Body::from(self.body));
        *res.status_mut() = StatusCode::OK;

        let headers = res.headers_mut();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid stored header"),
            }
        }

        match HeaderValue::from_str(&self.mime) {
            Ok(mime) => {
                headers.insert(header::CONTENT_TYPE, mime);
            }
            Err(_) => {
                warn!(mime = %self.mime, "Invalid stored mime, using default");
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(DEFAULT_MIME));
            }
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));

        res
    }
}
