//! Background jobs for the proxy
//!
//! - Sweep of idle in-memory idempotency entries. TTL timers reset entries to
//!   EMPTY on their own; this job drops the empty shells from the map.

use std::time::Duration;
use tracing::{debug, info};

use crate::coordinator::MemoryStore;

/// Configuration for the idle entry sweep
pub struct IdleSweepConfig {
    /// How often to run the sweep (default: 60 seconds)
    pub check_interval: Duration,
}

impl Default for IdleSweepConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Run the idle entry sweep periodically
pub async fn run_idle_sweep(store: MemoryStore, config: IdleSweepConfig) {
    info!(
        "Idle entry sweep started (interval={}s)",
        config.check_interval.as_secs()
    );

    loop {
        tokio::time::sleep(config.check_interval).await;
        sweep_once(&store).await;
    }
}

async fn sweep_once(store: &MemoryStore) -> usize {
    let evicted = store.evict_idle().await;
    if evicted > 0 {
        let remaining = store.len().await;
        info!(evicted, remaining, "Evicted idle idempotency entries");
    } else {
        debug!("Idle sweep found nothing to evict");
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{CoordinatorStore, IdempotencyKey};

    #[tokio::test]
    async fn test_sweep_once() {
        let store = MemoryStore::new(Duration::from_millis(20));
        for i in 0..5 {
            let key = IdempotencyKey::new("ANON", "POST", &format!("K{}", i));
            assert!(store.try_acquire(&key).await.unwrap().is_some());
        }
        assert_eq!(sweep_once(&store).await, 0);

        // Every lock expires back to EMPTY
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sweep_once(&store).await, 5);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_run_idle_sweep_loop() {
        let store = MemoryStore::new(Duration::from_millis(10));
        let key = IdempotencyKey::new("ANON", "GET", "loop");
        assert!(store.try_acquire(&key).await.unwrap().is_some());

        let job = tokio::spawn(run_idle_sweep(
            store.clone(),
            IdleSweepConfig {
                check_interval: Duration::from_millis(30),
            },
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        job.abort();

        assert_eq!(store.len().await, 0);
    }

    #[test]
    fn test_sweep_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let store = MemoryStore::new(Duration::from_secs(1));
        let sweep = run_idle_sweep(store, IdleSweepConfig::default());
        // tokio::spawn requires Send; hold no guard or borrow across an await
        assert_send(&sweep);
    }
}
