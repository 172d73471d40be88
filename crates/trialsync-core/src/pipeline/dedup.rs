//! Collapses concurrent identical requests into one execution.
//!
//! The first caller for a key runs the operation; callers arriving while it
//! is in flight wait on a `watch` channel for the same outcome. Successful
//! results stay cached for a short window so rapid repeats skip the network.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a successful result is served from cache
    pub cache_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { cache_ms: 5_000 }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub cache: bool,
    pub cache_duration: Option<Duration>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            cache: true,
            cache_duration: None,
        }
    }
}

impl ExecuteOptions {
    pub const fn uncached() -> Self {
        Self {
            cache: false,
            cache_duration: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStats {
    pub pending: usize,
    pub cached: usize,
    pub executions: u64,
    pub deduplicated: u64,
    pub cache_hits: u64,
}

type Outcome<T> = std::result::Result<T, Arc<Error>>;
type Slot<T> = Option<Outcome<T>>;

struct State<T> {
    pending: HashMap<String, watch::Receiver<Slot<T>>>,
    cache: HashMap<String, (T, Instant)>,
    executions: u64,
    deduplicated: u64,
    cache_hits: u64,
}

impl<T> State<T> {
    /// Most keys are never requested twice, so expiry cannot wait for a
    /// repeat lookup.
    fn evict_expired(&mut self, now: Instant) {
        self.cache.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

enum Role<T> {
    Cached(T),
    Follower(watch::Receiver<Slot<T>>),
    Leader(watch::Sender<Slot<T>>),
}

/// Removes the pending entry if the leader is dropped before finishing.
struct PendingGuard<'a, T> {
    state: &'a Mutex<State<T>>,
    key: &'a str,
    armed: bool,
}

impl<T> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().pending.remove(self.key);
        }
    }
}

pub struct RequestDeduplicator<T> {
    config: DedupConfig,
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for RequestDeduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(State {
                pending: HashMap::new(),
                cache: HashMap::new(),
                executions: 0,
                deduplicated: 0,
                cache_hits: 0,
            })),
        }
    }

    /// Run `operation` for `key` unless an identical call is in flight or a
    /// cached result is still fresh.
    pub async fn execute<F, Fut>(&self, key: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(key, ExecuteOptions::default(), operation)
            .await
    }

    pub async fn execute_with<F, Fut>(&self, key: &str, options: ExecuteOptions, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut operation = Some(operation);
        loop {
            match self.role(key) {
                Role::Cached(value) => return Ok(value),
                Role::Follower(mut receiver) => {
                    tracing::debug!("Joining in-flight request {key}");
                    let outcome = match receiver.wait_for(Option::is_some).await {
                        Ok(slot) => slot.clone(),
                        // Leader was cancelled; compete to lead again.
                        Err(_) => continue,
                    };
                    return match outcome {
                        Some(Ok(value)) => Ok(value),
                        Some(Err(error)) => Err(Error::Shared(error)),
                        None => continue,
                    };
                }
                Role::Leader(sender) => {
                    let Some(operation) = operation.take() else {
                        return Err(Error::NotInitialized("deduplicated operation"));
                    };
                    return self.lead(key, options, sender, operation).await;
                }
            }
        }
    }

    fn role(&self, key: &str) -> Role<T> {
        let mut state = self.state.lock();
        state.evict_expired(Instant::now());

        if let Some((value, _)) = state.cache.get(key) {
            let value = value.clone();
            state.cache_hits += 1;
            return Role::Cached(value);
        }

        if let Some(receiver) = state.pending.get(key) {
            let receiver = receiver.clone();
            state.deduplicated += 1;
            return Role::Follower(receiver);
        }

        let (sender, receiver) = watch::channel(None);
        state.pending.insert(key.to_string(), receiver);
        state.executions += 1;
        Role::Leader(sender)
    }

    async fn lead<F, Fut>(
        &self,
        key: &str,
        options: ExecuteOptions,
        sender: watch::Sender<Slot<T>>,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = PendingGuard {
            state: &self.state,
            key,
            armed: true,
        };
        let result = operation().await;
        guard.armed = false;

        {
            let mut state = self.state.lock();
            state.pending.remove(key);
            state.evict_expired(Instant::now());
            if let (Ok(value), true) = (&result, options.cache) {
                let ttl = options
                    .cache_duration
                    .unwrap_or_else(|| Duration::from_millis(self.config.cache_ms));
                if !ttl.is_zero() {
                    state
                        .cache
                        .insert(key.to_string(), (value.clone(), Instant::now() + ttl));
                }
            }
        }

        match result {
            Ok(value) => {
                sender.send_replace(Some(Ok(value.clone())));
                Ok(value)
            }
            Err(error) if sender.receiver_count() == 0 => Err(error),
            Err(error) => {
                let shared = Arc::new(error);
                sender.send_replace(Some(Err(Arc::clone(&shared))));
                Err(Error::Shared(shared))
            }
        }
    }

    /// Drop one cached result, or all of them.
    pub fn clear_cache(&self, key: Option<&str>) {
        let mut state = self.state.lock();
        match key {
            Some(key) => {
                state.cache.remove(key);
            }
            None => state.cache.clear(),
        }
    }

    /// Forget cached results and in-flight bookkeeping.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.cache.clear();
        state.pending.clear();
    }

    pub fn stats(&self) -> DedupStats {
        let state = self.state.lock();
        let now = Instant::now();
        DedupStats {
            pending: state.pending.len(),
            cached: state
                .cache
                .values()
                .filter(|(_, expires_at)| *expires_at > now)
                .count(),
            executions: state.executions,
            deduplicated: state.deduplicated,
            cache_hits: state.cache_hits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dedup() -> RequestDeduplicator<u32> {
        RequestDeduplicator::new(DedupConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let dedup = dedup();
        let calls = Arc::new(AtomicU32::new(0));

        let slow = |calls: Arc<AtomicU32>| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(calls.fetch_add(1, Ordering::SeqCst) + 41)
        };
        let (a, b) = tokio::join!(
            dedup.execute("patient:p1", || slow(Arc::clone(&calls))),
            dedup.execute("patient:p1", || slow(Arc::clone(&calls))),
        );

        assert_eq!(a.unwrap(), 41);
        assert_eq!(b.unwrap(), 41);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = dedup.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_shared_with_followers() {
        let dedup = dedup();
        let failing = || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<u32, _>(Error::Network("unreachable".to_string()))
        };
        let (a, b) = tokio::join!(dedup.execute("k", failing), dedup.execute("k", failing));

        assert_eq!(a.unwrap_err().to_string(), "Network error: unreachable");
        assert!(b.unwrap_err().is_retryable());
        assert_eq!(dedup.stats().cached, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn results_are_cached_for_window() {
        let dedup = dedup();
        let calls = Arc::new(AtomicU32::new(0));
        let run = || {
            let calls = Arc::clone(&calls);
            async move { Ok(calls.fetch_add(1, Ordering::SeqCst)) }
        };

        assert_eq!(dedup.execute("k", run).await.unwrap(), 0);
        assert_eq!(dedup.execute("k", run).await.unwrap(), 0);
        tokio::time::advance(Duration::from_millis(5_001)).await;
        assert_eq!(dedup.execute("k", run).await.unwrap(), 1);
        assert_eq!(dedup.stats().cache_hits, 1);

        dedup.clear_cache(Some("k"));
        assert_eq!(dedup.execute("k", run).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_results_are_evicted_for_unrelated_keys() {
        let dedup = dedup();
        for version in 0..200 {
            let key = format!("write:baseline:p1@{version}");
            dedup.execute(&key, || async { Ok(version) }).await.unwrap();
            tokio::time::advance(Duration::from_secs(10)).await;
        }

        assert_eq!(dedup.stats().cached, 0);
        assert_eq!(dedup.state.lock().cache.len(), 1);
    }

    #[tokio::test]
    async fn uncached_calls_always_execute() {
        let dedup = dedup();
        let calls = Arc::new(AtomicU32::new(0));
        for expected in 0..3 {
            let calls = Arc::clone(&calls);
            let value = dedup
                .execute_with("k", ExecuteOptions::uncached(), || async move {
                    Ok(calls.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap();
            assert_eq!(value, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_does_not_strand_followers() {
        let dedup = dedup();
        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute("k", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let dedup = dedup.clone();
            tokio::spawn(async move { dedup.execute("k", || async { Ok(2) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        assert_eq!(follower.await.unwrap().unwrap(), 2);
    }
}
