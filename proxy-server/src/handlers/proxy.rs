//! Leader/follower request orchestration.
//!
//! Every proxied request maps to one [`IdempotencyKey`]. The first request to
//! acquire the key (the leader) makes the downstream call and stores the
//! projected response; concurrent or later requests with the same key
//! (followers) poll until that response is available and replay it.
//!
//! Outcome classification:
//! - upstream status 200..=500: cached, replayed to every follower until TTL
//! - upstream status > 500, transport failure, timeout: lock released, 500

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    Extension,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::Agent;
use crate::config::{Config, URL_VAR_PREFIX};
use crate::coordinator::{CoordinatorStore, IdempotencyKey, Lease};
use crate::envelope::ResponseEnvelope;
use crate::error::ProxyError;
use crate::upstream::{alter_headers, UpstreamRequest};
use crate::AppState;

pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_JSON_MASK: &str = "x-json-mask";
pub const RESPONSE_HEADERS: &str = "response-headers";

/// Releases the leader's lock unless the response was committed.
///
/// Dropping an armed guard (client disconnect, panic, early return) spawns
/// the release so followers are not left waiting for the TTL.
struct LeaderGuard {
    store: Arc<dyn CoordinatorStore>,
    key: IdempotencyKey,
    lease: Lease,
    armed: bool,
}

impl LeaderGuard {
    fn new(store: Arc<dyn CoordinatorStore>, key: IdempotencyKey, lease: Lease) -> Self {
        Self {
            store,
            key,
            lease,
            armed: true,
        }
    }

    fn commit(mut self) {
        self.armed = false;
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.store.release(&self.key, self.lease).await {
            warn!(key = %self.key, error = %e, "Failed to release idempotency lock");
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let lease = self.lease;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = store.release(&key, lease).await {
                        warn!(key = %key, error = %e, "Failed to release abandoned lock");
                    }
                });
            }
            Err(_) => warn!(key = %key, "No runtime to release abandoned lock, relying on TTL"),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
}

/// Resolve the downstream URL.
///
/// `/URL_NAME` targets the configured `URL_NAME` entry; any other path is
/// forwarded to `https://{x-forwarded-host}{path?query}`.
fn resolve_target(config: &Config, uri: &Uri, headers: &HeaderMap) -> Result<String, ProxyError> {
    let path = uri.path();
    let url = match path.strip_prefix('/').filter(|p| p.starts_with(URL_VAR_PREFIX)) {
        Some(name) => {
            let url = config.url_vars.get(name).map(String::as_str).unwrap_or_default();
            if !url.starts_with("http") {
                return Err(ProxyError::Validation(format!("invalid url: {}", url)));
            }
            url.to_string()
        }
        None => {
            let host = header_str(headers, X_FORWARDED_HOST);
            if host.is_empty() {
                return Err(ProxyError::missing_header(X_FORWARDED_HOST));
            }
            let path_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or(path);
            format!("https://{}{}", host, path_query)
        }
    };

    reqwest::Url::parse(&url).map_err(|e| ProxyError::Validation(format!("invalid url: {}", e)))?;
    Ok(url)
}

pub async fn proxy(
    State(state): State<AppState>,
    Extension(Agent(agent)): Extension<Agent>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let url = resolve_target(&state.config, &uri, &headers)?;

    let idempotency_key = header_str(&headers, IDEMPOTENCY_KEY);
    if idempotency_key.is_empty() {
        return Err(ProxyError::missing_header(IDEMPOTENCY_KEY));
    }
    let key = IdempotencyKey::new(&agent, method.as_str(), idempotency_key);

    let Some(lease) = state.store.try_acquire(&key).await? else {
        let envelope = poll_cached(&state, &key).await?;
        info!(
            action = "cachehit",
            method = %method,
            url = %url,
            status = envelope.status,
            agent = %agent,
            idempotency_key = %key,
            "Replaying cached response"
        );
        return Ok(envelope.into_response());
    };

    let guard = LeaderGuard::new(Arc::clone(&state.store), key.clone(), lease);

    let request = UpstreamRequest {
        method: method.clone(),
        url: url.clone(),
        headers: alter_headers(&headers, &state.config.header_vars),
        // Safe methods carry no body downstream
        body: if method.is_safe() { Vec::new() } else { body.to_vec() },
    };

    let response = match tokio::time::timeout(
        state.config.request_timeout,
        state.upstream.execute(request),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(url = %url, idempotency_key = %key, error = %e, "Upstream call failed");
            guard.release().await;
            return Err(e);
        }
        Err(_) => {
            warn!(url = %url, idempotency_key = %key, "Upstream call timed out");
            guard.release().await;
            return Err(ProxyError::Upstream("upstream request timed out".to_string()));
        }
    };

    if !(200..=500).contains(&response.status) {
        warn!(
            url = %url,
            status = response.status,
            idempotency_key = %key,
            "Upstream returned a non-cacheable status"
        );
        guard.release().await;
        return Err(ProxyError::Upstream(
            String::from_utf8_lossy(&response.body).to_string(),
        ));
    }

    let mut envelope = ResponseEnvelope::new(response.status);
    envelope.with_headers(&response.headers, header_str(&headers, RESPONSE_HEADERS));
    let stored = match envelope.with_body(&response.body, header_str(&headers, X_JSON_MASK)) {
        Ok(()) => state.store.store(&key, lease, &envelope).await,
        Err(e) => Err(e),
    };
    if let Err(e) = stored {
        warn!(idempotency_key = %key, error = %e, "Failed to cache upstream response");
        guard.release().await;
        return Err(e);
    }
    guard.commit();

    info!(
        action = "proxying",
        method = %method,
        url = %url,
        status = envelope.status,
        agent = %agent,
        idempotency_key = %key,
        "Proxied request"
    );
    Ok(envelope.into_response())
}

/// Follower loop: peek until READY or the attempt budget runs out.
async fn poll_cached(
    state: &AppState,
    key: &IdempotencyKey,
) -> Result<ResponseEnvelope, ProxyError> {
    for _ in 0..state.config.poll_attempts() {
        if let Some(envelope) = state.store.peek(key).await? {
            return Ok(envelope);
        }
        tokio::time::sleep(state.config.poll_interval).await;
    }

    Err(ProxyError::Timeout)
}
