use anyhow::{Context, Result};
use axum::http::HeaderValue;
use proxy_auth::TrustedKeys;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Prefix of config entries usable as a literal target URL (`/URL_FOO`).
pub const URL_VAR_PREFIX: &str = "URL_";
/// Prefix of config entries substituted into forwarded header values.
pub const HEADER_VAR_PREFIX: &str = "HEADER_";
pub const ECDSA_KEY_PREFIX: &str = "ECDSA_PUB_KEY";
pub const ED25519_KEY_PREFIX: &str = "ED25519_PUB_KEY";

#[derive(Clone, Debug)]
pub struct Config {
    // HTTP server
    pub host: String,
    pub port: u16,

    // Timeouts
    /// Upstream call budget; also the follower polling budget
    pub request_timeout: Duration,
    /// Follower poll interval
    pub poll_interval: Duration,
    /// Lifetime of a lock or cached response
    pub cache_ttl: Duration,

    /// Request body limit for unsafe methods
    pub max_body_bytes: usize,

    // Storage
    /// Redis backend when set, in-memory coordinator otherwise
    pub redis_url: Option<String>,

    // Access control
    pub allow_agents: BTreeSet<String>,
    pub trusted_keys: TrustedKeys,

    // Indirection tables
    pub url_vars: HashMap<String, String>,
    pub header_vars: HashMap<String, HeaderValue>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build from `(name, value)` pairs. Startup fails on malformed keys or
    /// header values rather than silently dropping them.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let get = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let request_timeout_ms: u64 = get("REQUEST_TIMEOUT")
            .unwrap_or("10000")
            .parse::<u64>()
            .context("Invalid REQUEST_TIMEOUT")?
            .max(1000);
        let poll_interval_ms: u64 = get("POLL_INTERVAL")
            .unwrap_or("100")
            .parse::<u64>()
            .context("Invalid POLL_INTERVAL")?
            .max(10);
        let cache_ttl_ms: u64 = match get("CACHE_TTL") {
            Some(v) => v.parse().context("Invalid CACHE_TTL")?,
            None => request_timeout_ms,
        };

        let mut trusted_keys = TrustedKeys::default();
        let mut url_vars = HashMap::new();
        let mut header_vars = HashMap::new();

        // Sort for a stable key order in logs; verification is order-independent
        let mut names: Vec<&String> = vars.keys().collect();
        names.sort();
        for name in names {
            let value = &vars[name];
            if name.starts_with(ECDSA_KEY_PREFIX) {
                let key = proxy_auth::parse_ecdsa_key(value)
                    .with_context(|| format!("Invalid {}", name))?;
                trusted_keys.ecdsa.push(key);
            } else if name.starts_with(ED25519_KEY_PREFIX) {
                let key = proxy_auth::parse_ed25519_key(value)
                    .with_context(|| format!("Invalid {}", name))?;
                trusted_keys.ed25519.push(key);
            } else if name.starts_with(URL_VAR_PREFIX) {
                url_vars.insert(name.clone(), value.clone());
            } else if name.starts_with(HEADER_VAR_PREFIX) {
                let header_value = HeaderValue::from_str(value)
                    .with_context(|| format!("Invalid header value in {}", name))?;
                header_vars.insert(name.clone(), header_value);
            }
        }

        Ok(Self {
            host: get("HOST").unwrap_or("0.0.0.0").to_string(),
            port: get("PORT")
                .unwrap_or("8080")
                .parse()
                .context("Invalid PORT")?,
            request_timeout: Duration::from_millis(request_timeout_ms),
            poll_interval: Duration::from_millis(poll_interval_ms),
            cache_ttl: Duration::from_millis(cache_ttl_ms),
            max_body_bytes: get("MAX_BODY_BYTES")
                .unwrap_or("1048576")
                .parse()
                .context("Invalid MAX_BODY_BYTES")?,
            redis_url: get("REDIS_URL").map(str::to_string),
            allow_agents: get("ALLOW_AGENTS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            trusted_keys,
            url_vars,
            header_vars,
        })
    }

    /// Follower attempts: `floor(request_timeout / poll_interval)`, at least one.
    pub fn poll_attempts(&self) -> u32 {
        let attempts = self.request_timeout.as_millis() / self.poll_interval.as_millis().max(1);
        attempts.clamp(1, u32::MAX as u128) as u32
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache_ttl.is_zero() {
            anyhow::bail!("CACHE_TTL must be greater than zero");
        }

        if self.trusted_keys.is_empty() {
            tracing::warn!("No public keys configured - all callers are treated as ANON");
        }

        if self.cache_ttl < self.request_timeout {
            tracing::warn!(
                cache_ttl_ms = self.cache_ttl.as_millis() as u64,
                request_timeout_ms = self.request_timeout.as_millis() as u64,
                "CACHE_TTL is shorter than REQUEST_TIMEOUT - a slow leader may lose its lock"
            );
        }

        Ok(())
    }
}
