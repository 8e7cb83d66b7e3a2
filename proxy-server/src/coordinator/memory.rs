//! In-memory coordinator: one mutex-guarded entry per key.
//!
//! Each entry owns its TTL timer. Scheduling a deadline spawns a task tagged
//! with the entry's current generation; any reschedule or reset bumps the
//! generation and aborts the old task, so a stale timer can never reset an
//! entry that moved on. Timers hold a `Weak` reference and fire even when no
//! request touches the key again.
//!
//! Leases come from a store-wide counter, so a lease is never reissued even
//! after its entry was evicted and recreated.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;

use super::{CoordinatorStore, IdempotencyKey, Lease};
use crate::envelope::ResponseEnvelope;
use crate::error::ProxyError;

/// Map size above which idle entries are evicted on access.
const LAZY_EVICTION_THRESHOLD: usize = 1024;
/// Entries created between two lazy cleanups.
const LAZY_EVICTION_INTERVAL: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Empty,
    Pending,
    Ready,
}

struct EntryInner {
    state: EntryState,
    /// Holder of the current PENDING/READY cycle
    lease: Option<Lease>,
    /// Encoded envelope, present only when READY
    value: Option<Vec<u8>>,
    generation: u64,
    timer: Option<AbortHandle>,
}

impl EntryInner {
    fn reset(&mut self) {
        self.state = EntryState::Empty;
        self.lease = None;
        self.value = None;
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Single-key state machine.
pub struct Coordinator {
    ttl: Duration,
    inner: Mutex<EntryInner>,
}

impl Coordinator {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            inner: Mutex::new(EntryInner {
                state: EntryState::Empty,
                lease: None,
                value: None,
                generation: 0,
                timer: None,
            }),
        })
    }

    /// EMPTY -> PENDING under `lease`.
    pub async fn try_acquire(self: &Arc<Self>, lease: Lease) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != EntryState::Empty {
            return false;
        }

        inner.state = EntryState::Pending;
        inner.lease = Some(lease);
        if inner.timer.is_none() {
            self.schedule_expiry(&mut inner);
        }
        true
    }

    pub async fn peek(&self) -> Result<Option<Vec<u8>>, ProxyError> {
        let inner = self.inner.lock().await;
        match inner.state {
            EntryState::Empty => Err(ProxyError::Internal("not obtained".to_string())),
            EntryState::Pending => Ok(None),
            EntryState::Ready => Ok(inner.value.clone()),
        }
    }

    pub async fn store(self: &Arc<Self>, lease: Lease, value: Vec<u8>) -> Result<(), ProxyError> {
        let mut inner = self.inner.lock().await;
        if inner.lease != Some(lease) {
            return Err(ProxyError::Internal("lease lost".to_string()));
        }
        if inner.state != EntryState::Pending {
            return Err(ProxyError::Internal("value already stored".to_string()));
        }

        inner.state = EntryState::Ready;
        inner.value = Some(value);
        self.schedule_expiry(&mut inner);
        Ok(())
    }

    /// Reset to EMPTY if `lease` still holds the entry. Returns whether it did.
    pub async fn release(&self, lease: Lease) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.lease != Some(lease) {
            return false;
        }
        inner.reset();
        true
    }

    pub async fn state(&self) -> EntryState {
        self.inner.lock().await.state
    }

    /// EMPTY and not locked right now. Used by eviction, never blocks.
    fn is_idle(&self) -> bool {
        self.inner
            .try_lock()
            .map(|inner| inner.state == EntryState::Empty)
            .unwrap_or(false)
    }

    fn schedule_expiry(self: &Arc<Self>, inner: &mut EntryInner) {
        if let Some(old) = inner.timer.take() {
            old.abort();
        }
        inner.generation += 1;

        let generation = inner.generation;
        let ttl = self.ttl;
        let entry: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(entry) = entry.upgrade() else {
                return;
            };
            let mut inner = entry.inner.lock().await;
            if inner.generation == generation {
                debug!(state = ?inner.state, "TTL elapsed, resetting idempotency entry");
                // This task is the timer; drop the handle instead of aborting itself
                inner.timer = None;
                inner.reset();
            }
        });
        inner.timer = Some(handle.abort_handle());
    }
}

#[derive(Default)]
struct EntryMap {
    entries: HashMap<IdempotencyKey, Arc<Coordinator>>,
    created_since_cleanup: usize,
}

impl EntryMap {
    /// Drop entries that are EMPTY and referenced only by the map.
    fn retain_active(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| Arc::strong_count(entry) > 1 || !entry.is_idle());
        self.created_since_cleanup = 0;
        before - self.entries.len()
    }
}

/// Concurrent map of lazily created coordinators.
#[derive(Clone)]
pub struct MemoryStore {
    map: Arc<Mutex<EntryMap>>,
    next_lease: Arc<AtomicU64>,
    ttl: Duration,
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: Arc::new(Mutex::new(EntryMap::default())),
            next_lease: Arc::new(AtomicU64::new(1)),
            ttl,
        }
    }

    /// Get or create the entry for `key`.
    pub async fn coordinator(&self, key: &IdempotencyKey) -> Arc<Coordinator> {
        let mut map = self.map.lock().await;
        if let Some(entry) = map.entries.get(key) {
            return Arc::clone(entry);
        }

        // Lazy cleanup keeps the map bounded between sweeps; amortized over
        // a batch of insertions so a large live map is not rescanned per call
        if map.entries.len() > LAZY_EVICTION_THRESHOLD
            && map.created_since_cleanup >= LAZY_EVICTION_INTERVAL
        {
            let evicted = map.retain_active();
            debug!(evicted, remaining = map.entries.len(), "Idempotency map cleanup triggered");
        }

        map.created_since_cleanup += 1;
        let entry = Coordinator::new(self.ttl);
        map.entries.insert(key.clone(), Arc::clone(&entry));
        entry
    }

    async fn existing(&self, key: &IdempotencyKey) -> Option<Arc<Coordinator>> {
        self.map.lock().await.entries.get(key).cloned()
    }

    /// Drop entries that are EMPTY and referenced only by the map.
    ///
    /// Returns the number of evicted entries.
    pub async fn evict_idle(&self) -> usize {
        self.map.lock().await.retain_active()
    }

    pub async fn len(&self) -> usize {
        self.map.lock().await.entries.len()
    }
}

#[async_trait]
impl CoordinatorStore for MemoryStore {
    async fn try_acquire(&self, key: &IdempotencyKey) -> Result<Option<Lease>, ProxyError> {
        let lease = Lease(self.next_lease.fetch_add(1, Ordering::Relaxed));
        let acquired = self.coordinator(key).await.try_acquire(lease).await;
        Ok(acquired.then_some(lease))
    }

    async fn peek(&self, key: &IdempotencyKey) -> Result<Option<ResponseEnvelope>, ProxyError> {
        let Some(entry) = self.existing(key).await else {
            return Err(ProxyError::Internal("not obtained".to_string()));
        };
        match entry.peek().await? {
            Some(bytes) => Ok(Some(ResponseEnvelope::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        key: &IdempotencyKey,
        lease: Lease,
        envelope: &ResponseEnvelope,
    ) -> Result<(), ProxyError> {
        let Some(entry) = self.existing(key).await else {
            return Err(ProxyError::Internal("lease lost".to_string()));
        };
        entry.store(lease, envelope.to_bytes()?).await
    }

    async fn release(&self, key: &IdempotencyKey, lease: Lease) -> Result<(), ProxyError> {
        if let Some(entry) = self.existing(key).await {
            if !entry.release(lease).await {
                debug!(key = %key, "Stale lease, entry left to its current holder");
            }
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn key(k: &str) -> IdempotencyKey {
        IdempotencyKey::new("ANON", "POST", k)
    }

    fn envelope(body: &[u8]) -> ResponseEnvelope {
        let mut env = ResponseEnvelope::new(200);
        env.body = body.to_vec();
        env
    }

    #[tokio::test]
    async fn test_state_machine() {
        let entry = Coordinator::new(Duration::from_secs(60));
        let lease = Lease(1);
        assert_eq!(entry.state().await, EntryState::Empty);
        assert!(matches!(entry.peek().await, Err(ProxyError::Internal(_))));
        assert!(entry.store(lease, vec![1]).await.is_err());

        assert!(entry.try_acquire(lease).await);
        assert_eq!(entry.state().await, EntryState::Pending);
        assert!(!entry.try_acquire(Lease(2)).await);
        assert_eq!(entry.peek().await.unwrap(), None);

        entry.store(lease, vec![1, 2, 3]).await.unwrap();
        assert_eq!(entry.state().await, EntryState::Ready);
        assert_eq!(entry.peek().await.unwrap(), Some(vec![1, 2, 3]));
        assert!(!entry.try_acquire(Lease(3)).await);
        // Only the PENDING holder stores, and only once
        assert!(entry.store(lease, vec![9]).await.is_err());

        assert!(entry.release(lease).await);
        assert_eq!(entry.state().await, EntryState::Empty);
        assert!(entry.try_acquire(Lease(4)).await);
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let k = key("race");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move { store.try_acquire(&k).await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_self_healing_pending() {
        let store = MemoryStore::new(Duration::from_millis(50));
        let k = key("stuck");

        assert!(store.try_acquire(&k).await.unwrap().is_some());
        assert!(store.try_acquire(&k).await.unwrap().is_none());

        // Leader never stores or releases
        sleep(Duration::from_millis(120)).await;
        assert_eq!(store.coordinator(&k).await.state().await, EntryState::Empty);
        assert!(store.try_acquire(&k).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ttl_measured_from_store() {
        let store = MemoryStore::new(Duration::from_millis(100));
        let k = key("ttl");

        let lease = store.try_acquire(&k).await.unwrap().unwrap();
        sleep(Duration::from_millis(60)).await;
        store.store(&k, lease, &envelope(b"v")).await.unwrap();

        // 120ms after acquire but only 60ms after store: still READY
        sleep(Duration::from_millis(60)).await;
        assert_eq!(store.peek(&k).await.unwrap(), Some(envelope(b"v")));

        sleep(Duration::from_millis(100)).await;
        assert!(matches!(store.peek(&k).await, Err(ProxyError::Internal(_))));
        assert!(store.try_acquire(&k).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_cancels_timer() {
        let entry = Coordinator::new(Duration::from_millis(50));
        assert!(entry.try_acquire(Lease(1)).await);
        assert!(entry.release(Lease(1)).await);

        // New lease right after release; the old deadline must not reset it
        assert!(entry.try_acquire(Lease(2)).await);
        sleep(Duration::from_millis(30)).await;
        entry.store(Lease(2), vec![7]).await.unwrap();
        sleep(Duration::from_millis(30)).await;
        assert_eq!(entry.state().await, EntryState::Ready);
    }

    #[tokio::test]
    async fn test_expired_leader_cannot_store_or_release() {
        let store = MemoryStore::new(Duration::from_millis(50));
        let k = key("stale");

        let stale = store.try_acquire(&k).await.unwrap().unwrap();
        sleep(Duration::from_millis(80)).await;
        let current = store.try_acquire(&k).await.unwrap().unwrap();
        assert_ne!(stale, current);

        // The expired holder is shut out
        assert!(matches!(
            store.store(&k, stale, &envelope(b"from-stale")).await,
            Err(ProxyError::Internal(_))
        ));
        store.release(&k, stale).await.unwrap();
        assert_eq!(store.peek(&k).await.unwrap(), None);

        store.store(&k, current, &envelope(b"from-current")).await.unwrap();
        store.release(&k, stale).await.unwrap();
        assert_eq!(store.peek(&k).await.unwrap(), Some(envelope(b"from-current")));
    }

    #[tokio::test]
    async fn test_leases_survive_eviction() {
        let store = MemoryStore::new(Duration::from_millis(20));
        let k = key("evicted");

        let first = store.try_acquire(&k).await.unwrap().unwrap();
        sleep(Duration::from_millis(60)).await;
        assert_eq!(store.evict_idle().await, 1);

        // A recreated entry never hands out a lease seen before
        let second = store.try_acquire(&k).await.unwrap().unwrap();
        assert_ne!(first, second);
        assert!(store.store(&k, first, &envelope(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_peek_returns_identical_envelope() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let k = key("same");
        let mut env = envelope(br#"{"id":5}"#);
        env.status = 201;
        env.mime = "application/json".to_string();
        env.headers.push(("x-a".to_string(), "1".to_string()));

        let lease = store.try_acquire(&k).await.unwrap().unwrap();
        assert_eq!(store.peek(&k).await.unwrap(), None);
        store.store(&k, lease, &env).await.unwrap();

        for _ in 0..3 {
            assert_eq!(store.peek(&k).await.unwrap(), Some(env.clone()));
        }
    }

    #[tokio::test]
    async fn test_distinct_keys_independent() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let a = IdempotencyKey::new("ANON", "POST", "A");
        let b = IdempotencyKey::new("ANON", "POST", "B");

        let lease_a = store.try_acquire(&a).await.unwrap().unwrap();
        let lease_b = store.try_acquire(&b).await.unwrap().unwrap();

        store.store(&a, lease_a, &envelope(b"a")).await.unwrap();
        assert_eq!(store.peek(&b).await.unwrap(), None);

        // A lease is bound to its own key
        store.release(&a, lease_b).await.unwrap();
        store.release(&b, lease_b).await.unwrap();
        assert_eq!(store.peek(&a).await.unwrap(), Some(envelope(b"a")));
        assert!(store.peek(&b).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_key_operations() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let k = key("never");

        assert!(store.peek(&k).await.is_err());
        assert!(store.store(&k, Lease(1), &envelope(b"x")).await.is_err());
        store.release(&k, Lease(1)).await.unwrap();
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let idle = key("idle");
        let busy = key("busy");

        let lease = store.try_acquire(&idle).await.unwrap().unwrap();
        store.release(&idle, lease).await.unwrap();
        assert!(store.try_acquire(&busy).await.unwrap().is_some());

        // A caller still holding an idle entry keeps it alive
        let held = store.coordinator(&idle).await;
        assert_eq!(store.evict_idle().await, 0);
        drop(held);

        assert_eq!(store.evict_idle().await, 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.peek(&busy).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lazy_cleanup_bounds_idle_map() {
        let store = MemoryStore::new(Duration::from_secs(60));
        for i in 0..(LAZY_EVICTION_THRESHOLD * 3) {
            store.coordinator(&key(&format!("idle-{}", i))).await;
        }
        assert!(store.len().await <= LAZY_EVICTION_THRESHOLD + LAZY_EVICTION_INTERVAL);
    }

    #[tokio::test]
    async fn test_lazy_cleanup_keeps_live_entries() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let total = LAZY_EVICTION_THRESHOLD + 2 * LAZY_EVICTION_INTERVAL;
        for i in 0..total {
            assert!(store.try_acquire(&key(&format!("live-{}", i))).await.unwrap().is_some());
        }
        // Existing keys are served without touching the cleanup path
        assert!(store.try_acquire(&key("live-0")).await.unwrap().is_none());
        assert_eq!(store.len().await, total);
    }
}
