use axum::{
    body::Body,
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::AppState;

/// Header carrying the signed bearer token.
pub const PROXY_AUTHORIZATION: &str = "proxy-authorization";

/// Identity used when no public keys are configured.
pub const ANONYMOUS_AGENT: &str = "ANON";

/// Authenticated caller, inserted into request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent(pub String);

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ProxyError> {
    let path = req.uri().path();

    // The banner is served without identity; every other path is proxied
    if path == "/" && req.method() == Method::GET {
        return Ok(next.run(req).await);
    }

    let agent = if state.config.trusted_keys.is_empty() {
        ANONYMOUS_AGENT.to_string()
    } else {
        let header = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();

        let (expire_at, agent) = state.config.trusted_keys.verify_bearer(header).map_err(|e| {
            warn!(error = %e, "Rejected proxy token");
            ProxyError::Auth(e)
        })?;
        debug!(agent = %agent, expire_at, "Proxy token verified");
        agent
    };

    if !state.config.allow_agents.is_empty() && !state.config.allow_agents.contains(&agent) {
        warn!(agent = %agent, "Agent not in ALLOW_AGENTS");
        return Err(ProxyError::Forbidden(agent));
    }

    req.extensions_mut().insert(Agent(agent));
    Ok(next.run(req).await)
}
