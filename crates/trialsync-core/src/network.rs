//! Connectivity monitor.
//!
//! Raw online/offline signals from the platform are not trusted directly.
//! An online signal moves the monitor to `Verifying`; after a short
//! stabilization delay a reachability check decides whether the link is
//! really usable. Only a confirmed transition to `Online` notifies
//! subscribers and triggers a flush of pending changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::events::{Listeners, Subscription};
use crate::state::SyncStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Offline,
    Verifying,
    Online,
}

/// Event reported by the platform's network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawSignal {
    Online,
    Offline,
}

/// Cheap, side-effect-free probe of the remote endpoint.
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    async fn verify(&self) -> bool;
}

/// `HEAD` request against a health URL.
pub struct HttpReachabilityCheck {
    url: String,
    client: reqwest::Client,
}

impl HttpReachabilityCheck {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl ReachabilityCheck for HttpReachabilityCheck {
    async fn verify(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::debug!("Reachability check against {} failed: {error}", self.url);
                false
            }
        }
    }
}

/// Trusts the platform signal as-is. Used when no verification URL is set.
pub struct AssumeReachable;

#[async_trait]
impl ReachabilityCheck for AssumeReachable {
    async fn verify(&self) -> bool {
        true
    }
}

/// Receives the flush request issued on every confirmed reconnect.
#[async_trait]
pub trait FlushHandler: Send + Sync {
    async fn flush(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Wait after a raw online signal before verifying
    pub stabilization_delay_ms: u64,
    pub verify_timeout_ms: u64,
    /// Endpoint for the `HEAD` check; unset trusts raw signals
    pub verify_url: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            stabilization_delay_ms: 1_000,
            verify_timeout_ms: 5_000,
            verify_url: None,
        }
    }
}

struct Inner {
    config: NetworkConfig,
    check: Arc<dyn ReachabilityCheck>,
    state: Mutex<ConnectivityState>,
    /// Bumped on every raw signal so a slow verification cannot override a
    /// newer signal.
    generation: AtomicU64,
    connectivity: Listeners<bool>,
    sync_status: Listeners<SyncStatus>,
    flush: Mutex<Option<Weak<dyn FlushHandler>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    pub fn new(config: NetworkConfig, check: Arc<dyn ReachabilityCheck>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                check,
                state: Mutex::new(ConnectivityState::Offline),
                generation: AtomicU64::new(0),
                connectivity: Listeners::new(),
                sync_status: Listeners::new(),
                flush: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Monitor using an HTTP `HEAD` check when a URL is configured.
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let check: Arc<dyn ReachabilityCheck> = match &config.verify_url {
            Some(url) => Arc::new(HttpReachabilityCheck::new(
                url.clone(),
                Duration::from_millis(config.verify_timeout_ms),
            )?),
            None => Arc::new(AssumeReachable),
        };
        Ok(Self::new(config.clone(), check))
    }

    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.lock()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Route confirmed reconnects to `handler`. Only a weak reference is
    /// kept.
    pub fn attach_flush_handler(&self, handler: Weak<dyn FlushHandler>) {
        *self.inner.flush.lock() = Some(handler);
    }

    pub fn detach_flush_handler(&self) {
        self.inner.flush.lock().take();
    }

    /// Registry shared with the sync engine for status publication.
    pub fn sync_status_listeners(&self) -> Listeners<SyncStatus> {
        self.inner.sync_status.clone()
    }

    pub fn subscribe_connectivity(
        &self,
        listener: impl Fn(&bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.connectivity.subscribe(listener)
    }

    pub fn subscribe_sync_status(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.sync_status.subscribe(listener)
    }

    /// Drive the state machine with one raw signal.
    ///
    /// An online signal resolves after the stabilization delay and the
    /// reachability check. A newer signal received meanwhile wins.
    pub async fn handle_signal(&self, signal: RawSignal) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match signal {
            RawSignal::Offline => self.go_offline(),
            RawSignal::Online => self.verify_online(generation).await,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn go_offline(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), ConnectivityState::Offline);
        if previous == ConnectivityState::Online {
            tracing::info!("Connection lost");
            self.inner.connectivity.notify(&false);
        }
        self.inner.sync_status.notify(&SyncStatus::Offline);
    }

    async fn verify_online(&self, generation: u64) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectivityState::Online {
                return;
            }
            *state = ConnectivityState::Verifying;
        }

        tokio::time::sleep(Duration::from_millis(self.inner.config.stabilization_delay_ms)).await;
        if !self.is_current(generation) {
            return;
        }

        let timeout = Duration::from_millis(self.inner.config.verify_timeout_ms);
        let reachable = tokio::time::timeout(timeout, self.inner.check.verify())
            .await
            .unwrap_or(false);

        {
            let mut state = self.inner.state.lock();
            if !self.is_current(generation) {
                return;
            }
            if !reachable {
                *state = ConnectivityState::Offline;
                drop(state);
                tracing::warn!("Online signal received but the remote endpoint is unreachable");
                return;
            }
            *state = ConnectivityState::Online;
        }

        tracing::info!("Connection verified; flushing pending changes");
        self.inner.connectivity.notify(&true);

        let handler = self.inner.flush.lock().as_ref().and_then(Weak::upgrade);
        if let Some(handler) = handler {
            handler.flush().await;
        }
    }

    /// Consume raw signals from `signals` until the sender is dropped or
    /// [`ConnectivityMonitor::stop`] is called. Each signal is handled on
    /// its own task so an offline signal is never stuck behind a flush.
    pub fn spawn_listener(&self, mut signals: mpsc::Receiver<RawSignal>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let monitor = Self { inner };
                tokio::spawn(async move { monitor.handle_signal(signal).await });
            }
        });
        if let Some(previous) = self.inner.listener.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.inner.listener.lock().take() {
            handle.abort();
        }
        // Invalidate any verification still in flight.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Toggle(AtomicBool);

    #[async_trait]
    impl ReachabilityCheck for Toggle {
        async fn verify(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingFlush(AtomicUsize);

    #[async_trait]
    impl FlushHandler for CountingFlush {
        async fn flush(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor(reachable: bool) -> ConnectivityMonitor {
        ConnectivityMonitor::new(
            NetworkConfig::default(),
            Arc::new(Toggle(AtomicBool::new(reachable))),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn verified_online_notifies_and_flushes_once() {
        let monitor = monitor(true);
        let flush = Arc::new(CountingFlush::default());
        let handler: Arc<dyn FlushHandler> = flush.clone();
        monitor.attach_flush_handler(Arc::downgrade(&handler));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = monitor.subscribe_connectivity(move |online| sink.lock().push(*online));

        monitor.handle_signal(RawSignal::Online).await;
        assert_eq!(monitor.state(), ConnectivityState::Online);
        assert_eq!(*seen.lock(), vec![true]);
        assert_eq!(flush.0.load(Ordering::SeqCst), 1);

        // Repeated online signals while online do nothing.
        monitor.handle_signal(RawSignal::Online).await;
        assert_eq!(flush.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_verification_stays_offline() {
        let monitor = monitor(false);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _subscription = monitor.subscribe_connectivity(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.handle_signal(RawSignal::Online).await;
        assert_eq!(monitor.state(), ConnectivityState::Offline);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_publishes_sync_status() {
        let monitor = monitor(true);
        monitor.handle_signal(RawSignal::Online).await;

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        let subscription = monitor.subscribe_sync_status(move |status| sink.lock().push(status.clone()));

        monitor.handle_signal(RawSignal::Offline).await;
        assert_eq!(monitor.state(), ConnectivityState::Offline);
        assert_eq!(*statuses.lock(), vec![SyncStatus::Offline]);
        assert!(subscription.unsubscribe());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_during_verification_wins() {
        let monitor = monitor(true);
        let verifying = monitor.clone();
        let pending = tokio::spawn(async move { verifying.handle_signal(RawSignal::Online).await });

        tokio::task::yield_now().await;
        assert_eq!(monitor.state(), ConnectivityState::Verifying);
        monitor.handle_signal(RawSignal::Offline).await;
        pending.await.unwrap();

        assert_eq!(monitor.state(), ConnectivityState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_drives_state_machine() {
        let monitor = monitor(true);
        let (sender, receiver) = mpsc::channel(4);
        monitor.spawn_listener(receiver);

        sender.send(RawSignal::Online).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(monitor.is_online());

        sender.send(RawSignal::Offline).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.is_online());
        monitor.stop();
    }
}
