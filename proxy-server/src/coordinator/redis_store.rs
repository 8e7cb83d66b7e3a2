use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

use super::{CoordinatorStore, IdempotencyKey, Lease};
use crate::envelope::ResponseEnvelope;
use crate::error::ProxyError;

/// First byte of a PENDING record. Stored envelopes are CBOR maps and always
/// start with a major-type-5 byte, never 0x00.
const PENDING_TAG: u8 = 0x00;

/// Replace the PENDING record with the envelope only if it still carries the
/// caller's lease.
const STORE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

/// Delete the entry only if it still carries the caller's lease.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Coordinator backed by Redis. Key expiry is the TTL timer.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self, ProxyError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Redis coordinator connected");
        Ok(Self { conn, ttl })
    }

    fn ttl_ms(&self) -> u64 {
        (self.ttl.as_millis() as u64).max(1)
    }
}

fn redis_key(key: &IdempotencyKey) -> String {
    format!("idempotency:{}", key.storage_key())
}

/// Value held by a PENDING entry: tag byte followed by the big-endian lease.
fn pending_record(lease: Lease) -> Vec<u8> {
    let mut record = Vec::with_capacity(9);
    record.push(PENDING_TAG);
    record.extend_from_slice(&lease.0.to_be_bytes());
    record
}

/// Interpret a raw GET reply.
fn decode_entry(raw: Option<Vec<u8>>) -> Result<Option<ResponseEnvelope>, ProxyError> {
    match raw {
        None => Err(ProxyError::Internal("not obtained".to_string())),
        Some(bytes) if bytes.first() == Some(&PENDING_TAG) => Ok(None),
        Some(bytes) => ResponseEnvelope::from_bytes(&bytes).map(Some),
    }
}

#[async_trait]
impl CoordinatorStore for RedisStore {
    async fn try_acquire(&self, key: &IdempotencyKey) -> Result<Option<Lease>, ProxyError> {
        let mut conn = self.conn.clone();
        let lease = Lease(rand::random());
        let acquired: Option<String> = redis::cmd("SET")
            .arg(redis_key(key))
            .arg(pending_record(lease))
            .arg("NX") // Only set if not exists
            .arg("PX")
            .arg(self.ttl_ms())
            .query_async(&mut conn)
            .await?;

        debug!(key = %key, acquired = acquired.is_some(), "Idempotency lock attempt");
        Ok(acquired.map(|_| lease))
    }

    async fn peek(&self, key: &IdempotencyKey) -> Result<Option<ResponseEnvelope>, ProxyError> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(redis_key(key)).await?;
        decode_entry(raw)
    }

    async fn store(
        &self,
        key: &IdempotencyKey,
        lease: Lease,
        envelope: &ResponseEnvelope,
    ) -> Result<(), ProxyError> {
        let mut conn = self.conn.clone();
        let stored: i64 = redis::Script::new(STORE_SCRIPT)
            .key(redis_key(key))
            .arg(pending_record(lease))
            .arg(envelope.to_bytes()?)
            .arg(self.ttl_ms())
            .invoke_async(&mut conn)
            .await?;

        if stored == 1 {
            Ok(())
        } else {
            Err(ProxyError::Internal("lease lost".to_string()))
        }
    }

    async fn release(&self, key: &IdempotencyKey, lease: Lease) -> Result<(), ProxyError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(redis_key(key))
            .arg(pending_record(lease))
            .invoke_async(&mut conn)
            .await?;
        debug!(key = %key, released = deleted > 0, "Idempotency lock release");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
