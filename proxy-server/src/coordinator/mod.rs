//! Idempotency coordination
//!
//! One logical entry per [`IdempotencyKey`], moving through
//! `EMPTY -> PENDING -> READY` and back to `EMPTY` on release or TTL expiry.
//!
//! - `try_acquire`: EMPTY -> PENDING for exactly one caller (the leader),
//!   who receives a [`Lease`]
//! - `peek`: followers poll until READY
//! - `store`: leader commits the envelope, TTL restarts
//! - `release`: any failure path resets the entry
//!
//! `store` and `release` only act while the caller's lease still holds the
//! entry. A leader whose PENDING entry expired and was re-acquired by
//! another request can no longer touch it.
//!
//! Backends:
//! - [`MemoryStore`]: per-key mutex-guarded entries with spawned TTL timers
//! - [`RedisStore`]: `SET NX PX` acquire, compare-and-set scripts for
//!   store/release, Redis expiry as TTL

mod memory;
mod redis_store;

use async_trait::async_trait;
use std::fmt;

use crate::envelope::ResponseEnvelope;
use crate::error::ProxyError;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Address of exactly one coordinator entry.
///
/// Derived from `(agent, method, key)`. Equality is on the tuple, so two
/// agents (or two methods) never share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    agent: String,
    method: String,
    key: String,
}

impl IdempotencyKey {
    pub fn new(agent: &str, method: &str, key: &str) -> Self {
        Self {
            agent: agent.to_string(),
            method: method.to_string(),
            key: key.to_string(),
        }
    }

    /// Flat storage address. The agent is length-prefixed so an agent name
    /// containing `:` cannot alias another tuple.
    pub fn storage_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.agent.len(),
            self.agent,
            self.method,
            self.key
        )
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.agent, self.method, self.key)
    }
}

/// Proof of holding an entry's PENDING lock.
///
/// Issued by `try_acquire`, never reused by the same store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease(pub u64);

/// Per-key lock + cache operations.
///
/// Implementations serialize the four operations per key; different keys
/// never contend.
#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    /// EMPTY -> PENDING. `Some(lease)` makes the caller the leader. Never
    /// blocks on another caller's progress.
    async fn try_acquire(&self, key: &IdempotencyKey) -> Result<Option<Lease>, ProxyError>;

    /// `Ok(None)` while PENDING, the stored envelope once READY, and
    /// `ProxyError::Internal("not obtained")` on an EMPTY entry.
    async fn peek(&self, key: &IdempotencyKey) -> Result<Option<ResponseEnvelope>, ProxyError>;

    /// PENDING -> READY; restarts the TTL. Fails with
    /// `ProxyError::Internal` unless `lease` still holds the PENDING entry.
    async fn store(
        &self,
        key: &IdempotencyKey,
        lease: Lease,
        envelope: &ResponseEnvelope,
    ) -> Result<(), ProxyError>;

    /// Reset to EMPTY if `lease` still holds the entry, otherwise a no-op.
    async fn release(&self, key: &IdempotencyKey, lease: Lease) -> Result<(), ProxyError>;

    /// Backend label for logs.
    fn backend(&self) -> &'static str;
}
