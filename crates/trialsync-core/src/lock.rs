//! In-process mutual exclusion over sync resource keys.
//!
//! At most one unexpired lock exists per key. Locks expire after
//! [`LockConfig::timeout_ms`] even if never released, so a crashed or hung
//! holder cannot wedge the pipeline; a background sweep reclaims them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::events::{Listeners, Subscription};
use crate::ids::DeviceId;
use crate::util::now_millis;

/// Lock manager timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock lifetime
    pub timeout_ms: u64,
    /// Interval of the expiry sweep
    pub sweep_interval_ms: u64,
    /// Upper bound between checks in [`SyncLockManager::wait_for_release`]
    pub wait_poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            sweep_interval_ms: 1_000,
            wait_poll_interval_ms: 500,
        }
    }
}

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLock {
    pub lock_id: String,
    pub resource_key: String,
    /// Unix ms
    pub acquired_at: i64,
    /// Unix ms
    pub expires_at: i64,
    pub device_id: String,
    pub issued_by: String,
    #[serde(skip)]
    deadline: Instant,
}

impl SyncLock {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEventKind {
    Acquired,
    Released,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEvent {
    pub kind: LockEventKind,
    pub resource_key: String,
    pub lock_id: String,
}

struct Inner {
    config: LockConfig,
    device_id: DeviceId,
    locks: Mutex<HashMap<String, SyncLock>>,
    released: Notify,
    events: Listeners<LockEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a shared lock table.
#[derive(Clone)]
pub struct SyncLockManager {
    inner: Arc<Inner>,
}

impl SyncLockManager {
    pub fn new(device_id: DeviceId, config: LockConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                device_id,
                locks: Mutex::new(HashMap::new()),
                released: Notify::new(),
                events: Listeners::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.inner.config.timeout_ms)
    }

    /// Spawn the periodic expiry sweep. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.sweep_interval_ms.max(1));
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Self { inner }.sweep();
            }
        }));
        tracing::debug!("Lock sweep started ({period:?})");
    }

    /// Stop the expiry sweep. Held locks are kept.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
            tracing::debug!("Lock sweep stopped");
        }
    }

    /// Try to take the lock for `key`. Returns the new lock id, or `None`
    /// while another unexpired lock is held.
    pub fn acquire(&self, key: &str, issued_by: &str) -> Option<String> {
        let now = Instant::now();
        let mut events = Vec::new();

        let lock_id = {
            let mut locks = self.inner.locks.lock();
            if let Some(existing) = locks.get(key) {
                if !existing.is_expired(now) {
                    tracing::debug!(
                        "Lock {key} busy (held by {} until {})",
                        existing.issued_by,
                        existing.expires_at
                    );
                    return None;
                }
                events.push(LockEvent {
                    kind: LockEventKind::Expired,
                    resource_key: key.to_string(),
                    lock_id: existing.lock_id.clone(),
                });
            }

            let acquired_at = now_millis();
            let timeout = self.timeout();
            let lock = SyncLock {
                lock_id: format!("lock_{acquired_at}_{}", &crate::ids::generate_secure_uuid()[..8]),
                resource_key: key.to_string(),
                acquired_at,
                expires_at: acquired_at
                    + i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX / 2),
                device_id: self.inner.device_id.to_string(),
                issued_by: issued_by.to_string(),
                deadline: now + timeout,
            };
            let lock_id = lock.lock_id.clone();
            locks.insert(key.to_string(), lock);
            lock_id
        };

        events.push(LockEvent {
            kind: LockEventKind::Acquired,
            resource_key: key.to_string(),
            lock_id: lock_id.clone(),
        });
        for event in &events {
            self.inner.events.notify(event);
        }
        Some(lock_id)
    }

    /// Release `key` if `lock_id` is its current holder.
    pub fn release(&self, key: &str, lock_id: &str) -> bool {
        let removed = {
            let mut locks = self.inner.locks.lock();
            match locks.get(key) {
                Some(lock) if lock.lock_id == lock_id => locks.remove(key),
                Some(_) => {
                    tracing::warn!("Refusing release of {key}: lock id {lock_id} is not the holder");
                    None
                }
                None => None,
            }
        };

        let Some(lock) = removed else {
            return false;
        };
        self.inner.released.notify_waiters();
        self.inner.events.notify(&LockEvent {
            kind: LockEventKind::Released,
            resource_key: key.to_string(),
            lock_id: lock.lock_id,
        });
        true
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.get_lock(key).is_some()
    }

    /// Current unexpired lock for `key`.
    pub fn get_lock(&self, key: &str) -> Option<SyncLock> {
        let now = Instant::now();
        self.inner
            .locks
            .lock()
            .get(key)
            .filter(|lock| !lock.is_expired(now))
            .cloned()
    }

    pub fn active_locks(&self) -> Vec<SyncLock> {
        let now = Instant::now();
        let mut locks: Vec<SyncLock> = self
            .inner
            .locks
            .lock()
            .values()
            .filter(|lock| !lock.is_expired(now))
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        locks
    }

    /// Drop every lock.
    pub fn release_all(&self) {
        let drained: Vec<SyncLock> = self.inner.locks.lock().drain().map(|(_, lock)| lock).collect();
        self.inner.released.notify_waiters();
        for lock in drained {
            self.inner.events.notify(&LockEvent {
                kind: LockEventKind::Released,
                resource_key: lock.resource_key,
                lock_id: lock.lock_id,
            });
        }
    }

    /// Remove expired locks, returning how many were reclaimed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<SyncLock> = {
            let mut locks = self.inner.locks.lock();
            let keys: Vec<String> = locks
                .iter()
                .filter(|(_, lock)| lock.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| locks.remove(key)).collect()
        };

        if expired.is_empty() {
            return 0;
        }
        self.inner.released.notify_waiters();
        for lock in &expired {
            tracing::warn!("Lock {} on {} expired", lock.lock_id, lock.resource_key);
            self.inner.events.notify(&LockEvent {
                kind: LockEventKind::Expired,
                resource_key: lock.resource_key.clone(),
                lock_id: lock.lock_id.clone(),
            });
        }
        expired.len()
    }

    /// Wait until `key` is free. Returns false if `timeout` elapses first.
    ///
    /// Wakes on release notifications, with a bounded poll as fallback for
    /// locks that simply expire.
    pub async fn wait_for_release(&self, key: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.inner.config.wait_poll_interval_ms.max(1));

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some(lock) = self.get_lock(key) else {
                return true;
            };
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let wait = (deadline - now)
                .min(poll)
                .min(lock.deadline.saturating_duration_since(now));
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Acquire `key` as an RAII guard that releases on drop.
    pub fn lock(&self, key: &str, issued_by: &str) -> Option<LockGuard> {
        self.acquire(key, issued_by).map(|lock_id| LockGuard {
            manager: self.clone(),
            key: key.to_string(),
            lock_id,
        })
    }

    /// Run `operation` while holding `key`. Fails with
    /// [`Error::LockUnavailable`] if the lock is held elsewhere. The lock is
    /// released however `operation` ends, including cancellation.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, issued_by: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self
            .lock(key, issued_by)
            .ok_or_else(|| Error::LockUnavailable(key.to_string()))?;
        let output = operation().await;
        drop(guard);
        output
    }

    /// Listen for lock events on `key`.
    pub fn subscribe(
        &self,
        key: &str,
        listener: impl Fn(&LockEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let key = key.to_string();
        self.inner.events.subscribe(move |event: &LockEvent| {
            if event.resource_key == key {
                listener(event);
            }
        })
    }
}

/// Releases its lock when dropped.
pub struct LockGuard {
    manager: SyncLockManager,
    key: String,
    lock_id: String,
}

impl LockGuard {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.key, &self.lock_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> SyncLockManager {
        SyncLockManager::new(DeviceId::generate(), LockConfig::default())
    }

    #[test]
    fn second_acquire_fails_until_release() {
        let locks = manager();
        let first = locks.acquire("patient:p1", "sync").unwrap();
        assert!(locks.acquire("patient:p1", "editor").is_none());
        assert!(locks.acquire("patient:p2", "editor").is_some());

        assert!(locks.release("patient:p1", &first));
        assert!(!locks.release("patient:p1", &first));
        assert!(locks.acquire("patient:p1", "editor").is_some());
    }

    #[test]
    fn release_with_wrong_id_is_rejected() {
        let locks = manager();
        let _held = locks.acquire("k", "a").unwrap();
        assert!(!locks.release("k", "lock_0_deadbeef"));
        assert!(locks.is_locked("k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_has_one_winner() {
        let locks = manager();
        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let tasks: Vec<_> = (0..8)
            .map(|n| {
                let locks = locks.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    locks.acquire("form:f1", &format!("task{n}")).is_some()
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_reacquired() {
        let locks = manager();
        let stale = locks.acquire("k", "crashed").unwrap();
        tokio::time::advance(Duration::from_millis(30_001)).await;

        assert!(!locks.is_locked("k"));
        let fresh = locks.acquire("k", "next").unwrap();
        assert_ne!(stale, fresh);
        // The expired holder must not release the new lock.
        assert!(!locks.release("k", &stale));
        assert!(locks.is_locked("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_reclaims_expired_locks() {
        let locks = manager();
        locks.start();
        locks.acquire("k", "crashed").unwrap();
        tokio::time::sleep(Duration::from_millis(31_500)).await;
        assert!(locks.active_locks().is_empty());
        assert!(locks.inner.locks.lock().is_empty());
        locks.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_release_wakes_on_release() {
        let locks = manager();
        let lock_id = locks.acquire("k", "holder").unwrap();

        let releaser = locks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            releaser.release("k", &lock_id);
        });

        assert!(locks.wait_for_release("k", Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_release_times_out() {
        let locks = manager();
        locks.acquire("k", "holder").unwrap();
        assert!(!locks.wait_for_release("k", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let locks = manager();
        let result: Result<()> = locks
            .with_lock("k", "sync", || async { Err(Error::Network("down".to_string())) })
            .await;
        assert!(result.is_err());
        assert!(!locks.is_locked("k"));

        let value = locks.with_lock("k", "sync", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(!locks.is_locked("k"));
    }

    #[tokio::test]
    async fn with_lock_fails_when_held() {
        let locks = manager();
        let _guard = locks.lock("k", "other").unwrap();
        let result = locks.with_lock("k", "sync", || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::LockUnavailable(key)) if key == "k"));
    }

    #[tokio::test]
    async fn with_lock_releases_on_cancellation() {
        let locks = manager();
        let holder = locks.clone();
        let task = tokio::spawn(async move {
            holder
                .with_lock("k", "slow", || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(locks.is_locked("k"));
        task.abort();
        let _ = task.await;
        assert!(!locks.is_locked("k"));
    }

    #[test]
    fn subscribers_see_only_their_key() {
        let locks = manager();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let subscription = locks.subscribe("k", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let id = locks.acquire("k", "a").unwrap();
        locks.acquire("other", "a").unwrap();
        locks.release("k", &id);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(subscription.unsubscribe());
    }
}
