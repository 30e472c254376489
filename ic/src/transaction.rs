//! Transactor - cooperative cross-peer lock over the shared store
//!
//! The store has no compare-and-swap, so mutual exclusion is a timestamp
//! written under the lock key. A peer that finds a fresh lock waits for the
//! next store notification or a short poll timer, whichever comes first, then
//! retries. A lock older than the timeout belongs to a peer that died holding
//! it and is taken over.
//!
//! Reading and writing the lock record happen with no suspension point in
//! between, and the critical section itself is synchronous. A peer's own tasks
//! additionally queue on a local mutex, so on a multi-threaded runtime they
//! never race each other for the record.

use std::sync::Arc;
use std::time::Duration;

use kvstore::KvStore;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::now_ms;

/// Runs critical sections under the shared lock record
pub struct Transactor {
    store: KvStore,
    lock_key: String,
    timeout_ms: i64,
    wait: Duration,
    /// Signalled whenever this peer observes a store change
    wake: Arc<Notify>,
    local: Mutex<()>,
}

impl Transactor {
    pub fn new(
        store: KvStore,
        lock_key: impl Into<String>,
        timeout: Duration,
        wait: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            lock_key: lock_key.into(),
            timeout_ms: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
            wait,
            wake,
            local: Mutex::new(()),
        }
    }

    /// Run `critical` while holding the shared lock
    ///
    /// Waiting never blocks the thread: each retry is parked on the wake
    /// signal raced against the poll timer. Both are dropped once the lock is
    /// acquired.
    pub async fn run_exclusive<F, R>(&self, critical: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _local = self.local.lock().await;
        let mut attempts = 0u32;
        loop {
            // Registered before the check so a release between check and wait is not missed
            let woken = self.wake.notified();

            if let Some(guard) = self.try_acquire() {
                if attempts > 0 {
                    debug!(lock_key = %self.lock_key, attempts, "Transactor::run_exclusive: acquired after waiting");
                }
                let result = critical();
                drop(guard);
                return result;
            }

            attempts += 1;
            tokio::select! {
                _ = woken => {}
                _ = tokio::time::sleep(self.wait) => {}
            }
        }
    }

    fn try_acquire(&self) -> Option<LockGuard<'_>> {
        let now = now_ms();
        let held_since = self
            .store
            .get(&self.lock_key)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .filter(|held_since| *held_since != 0);

        if let Some(held_since) = held_since {
            if now - held_since < self.timeout_ms {
                return None;
            }
            warn!(
                lock_key = %self.lock_key,
                age_ms = now - held_since,
                "Transactor: taking over stale lock"
            );
        }

        self.store.set(&self.lock_key, &now.to_string());
        Some(LockGuard { transactor: self })
    }
}

/// Removes the lock record when the critical section ends, even by panic
struct LockGuard<'a> {
    transactor: &'a Transactor,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.transactor.store.remove(&self.transactor.lock_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::SharedMemory;
    use std::time::Instant;

    const LOCK: &str = "test_lock";

    fn transactor(store: KvStore, timeout_ms: u64) -> Transactor {
        Transactor::new(
            store,
            LOCK,
            Duration::from_millis(timeout_ms),
            Duration::from_millis(5),
            Arc::new(Notify::new()),
        )
    }

    #[tokio::test]
    async fn test_free_lock_runs_immediately_and_releases() {
        let shared = SharedMemory::new();
        let store = KvStore::new(shared.connect());
        let tx = transactor(store.clone(), 1_000);

        let seen = tx.run_exclusive(|| store.get(LOCK)).await;

        assert!(seen.is_some(), "lock record is held during the critical section");
        assert_eq!(store.get(LOCK), None);
    }

    #[tokio::test]
    async fn test_fresh_lock_blocks_until_released() {
        let shared = SharedMemory::new();
        let other = KvStore::new(shared.connect());
        other.set(LOCK, &now_ms().to_string());

        let tx = transactor(KvStore::new(shared.connect()), 10_000);
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            other.remove(LOCK);
        });

        let started = Instant::now();
        tx.run_exclusive(|| ()).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let shared = SharedMemory::new();
        let store = KvStore::new(shared.connect());
        store.set(LOCK, &(now_ms() - 5_000).to_string());

        let tx = transactor(store.clone(), 1_000);
        let started = Instant::now();
        let value = tx.run_exclusive(|| 7).await;

        assert_eq!(value, 7);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(store.get(LOCK), None);
    }

    #[tokio::test]
    async fn test_garbage_lock_value_counts_as_free() {
        let shared = SharedMemory::new();
        let store = KvStore::new(shared.connect());
        store.set(LOCK, "not-a-timestamp");

        let tx = transactor(store.clone(), 60_000);
        assert!(tx.run_exclusive(|| true).await);
    }

    #[tokio::test]
    async fn test_wake_signal_shortens_wait() {
        let shared = SharedMemory::new();
        let other = KvStore::new(shared.connect());
        other.set(LOCK, &now_ms().to_string());

        let wake = Arc::new(Notify::new());
        let tx = Transactor::new(
            KvStore::new(shared.connect()),
            LOCK,
            Duration::from_secs(10),
            Duration::from_secs(5),
            wake.clone(),
        );

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            other.remove(LOCK);
            wake.notify_waiters();
        });

        let started = Instant::now();
        tx.run_exclusive(|| ()).await;
        assert!(started.elapsed() < Duration::from_secs(2), "woken by signal, not the 5s poll");
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_store_never_blocks() {
        let tx = transactor(KvStore::unavailable(), 1_000);
        assert_eq!(tx.run_exclusive(|| "ran").await, "ran");
    }
}
