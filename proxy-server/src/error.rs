use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Everything a proxied request can fail with.
///
/// None of these are retried inside the proxy; a released lock lets the
/// caller retry with the same idempotency key.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Invalid, expired or unverifiable token
    #[error("proxy authentication failed: {0}")]
    Auth(#[from] proxy_auth::AuthError),
    /// Authenticated, but not in ALLOW_AGENTS
    #[error("agent {0} is not allowed")]
    Forbidden(String),
    /// Missing or malformed request input
    #[error("{0}")]
    Validation(String),
    /// Upstream status > 500 or transport failure
    #[error("{0}")]
    Upstream(String),
    /// Follower gave up waiting for the leader
    #[error("polling get cache timeout")]
    Timeout,
    /// Protocol violation or storage failure
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Auth(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) | ProxyError::Timeout | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn missing_header(name: &str) -> Self {
        ProxyError::Validation(format!("missing header: {}", name))
    }
}

impl From<redis::RedisError> for ProxyError {
    fn from(e: redis::RedisError) -> Self {
        ProxyError::Internal(format!("redis: {}", e))
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
