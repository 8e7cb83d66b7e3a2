//! Outbound leg of the proxy.
//!
//! Forwarded requests lose the control headers the proxy consumes itself, and
//! any header whose value names a configured `HEADER_*` entry is rewritten to
//! that entry's value. This is how server-side secrets (API keys, upstream
//! bearer tokens) are relayed without the caller ever holding them.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::config::HEADER_VAR_PREFIX;
use crate::error::ProxyError;

/// Headers never forwarded upstream.
pub const STRIPPED_HEADERS: [&str; 7] = [
    "host",
    "forwarded",
    "proxy-authorization",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "idempotency-key",
];

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Executes the single downstream call a leader makes.
///
/// Any HTTP status is `Ok`; `Err` is reserved for transport failures.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| ProxyError::Validation(format!("invalid method: {}", e)))?;

        let mut builder = self.client.request(method, &request.url);
        // reqwest 0.11 carries its own `http` types; headers cross as bytes
        for (name, value) in request.headers.iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Upstream(format!("upstream request timed out: {}", e))
            } else {
                ProxyError::Upstream(format!("upstream request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            match (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %name, "Dropping unrepresentable upstream header"),
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Upstream(format!("failed to read upstream body: {}", e)))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// Prepare inbound headers for forwarding.
pub fn alter_headers(headers: &HeaderMap, header_vars: &HashMap<String, HeaderValue>) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }

        let substituted = value
            .to_str()
            .ok()
            .filter(|v| v.starts_with(HEADER_VAR_PREFIX))
            .and_then(|v| header_vars.get(v));

        out.append(name.clone(), substituted.unwrap_or(value).clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_control_headers() {
        let mut headers = HeaderMap::new();
        for name in STRIPPED_HEADERS {
            headers.insert(name, HeaderValue::from_static("x"));
        }
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers.insert("x-json-mask", HeaderValue::from_static("id"));
        headers.insert("response-headers", HeaderValue::from_static("etag"));

        let out = alter_headers(&headers, &HashMap::new());
        assert_eq!(out.len(), 3);
        assert_eq!(out["accept"], "application/json");
        assert!(out.get("proxy-authorization").is_none());
        assert!(out.get("idempotency-key").is_none());
        assert!(out.get("host").is_none());
    }

    #[test]
    fn test_substitutes_configured_values() {
        let mut vars = HashMap::new();
        vars.insert(
            "HEADER_API_TOKEN".to_string(),
            HeaderValue::from_static("Bearer s3cret"),
        );

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("HEADER_API_TOKEN"));
        headers.insert("x-other", HeaderValue::from_static("HEADER_UNKNOWN"));
        headers.insert("x-plain", HeaderValue::from_static("value"));

        let out = alter_headers(&headers, &vars);
        assert_eq!(out["authorization"], "Bearer s3cret");
        // Unknown names pass through verbatim
        assert_eq!(out["x-other"], "HEADER_UNKNOWN");
        assert_eq!(out["x-plain"], "value");
    }

    #[test]
    fn test_keeps_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));

        let out = alter_headers(&headers, &HashMap::new());
        let values: Vec<_> = out.get_all("x-tag").iter().collect();
        assert_eq!(values, vec!["a", "b"]);
    }
}
