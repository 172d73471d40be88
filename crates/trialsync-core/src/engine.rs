//! Sync engine.
//!
//! `save` records a change locally and returns without touching the
//! network: the working copy is persisted dirty together with its queued
//! change, then the change enters the coalescer and the priority queue.
//! `sync_pending` flushes the queue entity by entity under the entity's
//! sync lock: stale writes are rejected, temporary ids are exchanged for
//! permanent ones, divergence from the remote copy is resolved and audited,
//! and the accepted version is recorded. Anything that fails stays queued
//! and dirty for the next reconnect.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::conflict::{self, ConflictDetector};
use crate::error::{Error, Result};
use crate::events::{Listeners, Subscription};
use crate::ids::{self, DeviceId, IdGenerator};
use crate::lock::{LockGuard, SyncLockManager};
use crate::models::{
    document_body, without_merge_tags, ConflictRecord, EntityRecord, FieldChanges,
    QueuedChange, Resolution, SyncPriority,
};
use crate::network::{ConnectivityMonitor, FlushHandler, RawSignal, ReachabilityCheck};
use crate::paths::{set_path, SchemaRegistry};
use crate::pipeline::{
    calculate_delta, retry, BandwidthDetector, CoalescedChange, Compressor, DedupStats,
    EncodedPayload, MetricsCollector, ObjectPool, PriorityQueue, RequestCoalescer,
    RequestDeduplicator, RetryConfig, SmartRetry, SyncMetrics, SyncStrategy, WriteBody,
};
use crate::remote::{RemoteDocument, RemoteStore};
use crate::services::LocalStore;
use crate::state::SyncStatus;
use crate::tracker::{DirtyFieldTracker, IS_DIRTY_PATH, LAST_SYNCED_PATH};
use crate::util::{duration_millis, now_millis, now_rfc3339};

const SAVE_ISSUER: &str = "save";
const SYNC_ISSUER: &str = "sync";

/// Field that links forms to their patient.
const PATIENT_REFERENCE_FIELD: &str = "patientId";
/// Where a created document remembers the temporary id it replaced.
const OFFLINE_ID_PATH: &str = "metadata.offlineId";

const BUFFER_CAPACITY: usize = 4 * 1024;
const BUFFER_POOL_SIZE: usize = 8;

/// Returned by [`SyncEngine::save`] once the change is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReceipt {
    pub change_id: String,
    pub entity_id: String,
    pub entity_type: String,
    /// Local version assigned to the change
    pub version: u64,
    pub changed_fields: Vec<String>,
    pub priority: SyncPriority,
    /// The coalescer reached its batch size with this change
    pub batch_full: bool,
}

/// Result of one remote create or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmitted {
    pub id: String,
    pub version: u64,
}

/// An entity whose changes could not be transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub entity_type: String,
    pub entity_id: String,
    pub change_ids: Vec<String>,
    pub error: String,
    pub retryable: bool,
}

/// Outcome of [`SyncEngine::sync_pending`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Entities accepted by the remote store
    pub synced: usize,
    /// Entities left queued after a failure
    pub failed: usize,
    /// Entities whose queued version was older than the stored one
    pub rejected: usize,
    /// Audited conflicts encountered during this flush
    pub conflicts: Vec<ConflictRecord>,
    pub failures: Vec<SyncFailure>,
    /// Temporary id to permanent id
    pub id_map: BTreeMap<String, String>,
    pub duration_ms: u64,
    /// Another flush was already running
    pub skipped: bool,
}

impl SyncReport {
    pub const fn is_success(&self) -> bool {
        !self.skipped && self.failed == 0
    }

    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct Queued {
    seq: u64,
    change: QueuedChange,
}

#[derive(Debug, Default)]
struct EntityOutcome {
    permanent_id: Option<String>,
    conflict: Option<ConflictRecord>,
}

/// Clears the in-progress flag however the flush ends.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn resource_key(entity_type: &str, entity_id: &str) -> String {
    format!("{entity_type}:{entity_id}")
}

fn is_reference_path(path: &str) -> bool {
    path == PATIENT_REFERENCE_FIELD
        || path
            .strip_suffix(PATIENT_REFERENCE_FIELD)
            .is_some_and(|parent| parent.ends_with('.'))
}

/// Rewrite references to `old_id` held in `delta`.
fn substitute_reference(delta: &mut FieldChanges, old_id: &str, new_id: &str) {
    for (path, value) in delta.iter_mut() {
        if is_reference_path(path) && value.as_str() == Some(old_id) {
            *value = Value::String(new_id.to_string());
        }
    }
}

fn with_bookkeeping(mut fields: FieldChanges) -> FieldChanges {
    fields.insert(LAST_SYNCED_PATH.to_string(), Value::String(now_rfc3339()));
    fields.insert(IS_DIRTY_PATH.to_string(), Value::Bool(false));
    fields
}

pub struct EngineBuilder {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    config: EngineConfig,
    schemas: SchemaRegistry,
    reachability: Option<Arc<dyn ReachabilityCheck>>,
    bandwidth: Option<BandwidthDetector>,
}

impl EngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Replace the configured reachability check.
    #[must_use]
    pub fn reachability(mut self, check: Arc<dyn ReachabilityCheck>) -> Self {
        self.reachability = Some(check);
        self
    }

    /// Replace the configured bandwidth detector.
    #[must_use]
    pub fn bandwidth(mut self, detector: BandwidthDetector) -> Self {
        self.bandwidth = Some(detector);
        self
    }

    /// Assemble the engine and reload the durable queue.
    pub async fn build(self) -> Result<SyncEngine> {
        let Self {
            store,
            remote,
            config,
            schemas,
            reachability,
            bandwidth,
        } = self;
        config.validate()?;

        let device_id = store.device_id().await?;
        let network = match reachability {
            Some(check) => ConnectivityMonitor::new(config.network.clone(), check),
            None => ConnectivityMonitor::from_config(&config.network)?,
        };
        let bandwidth = match bandwidth {
            Some(detector) => detector,
            None => BandwidthDetector::from_config(&config.bandwidth)?,
        };

        let inner = Inner {
            ids: IdGenerator::new(device_id.clone()),
            locks: SyncLockManager::new(device_id.clone(), config.lock.clone()),
            conflicts: ConflictDetector::new(store.clone(), device_id.clone()),
            coalescer: RequestCoalescer::new(config.coalescer.clone()),
            queue: Mutex::new(PriorityQueue::new()),
            dedup: RequestDeduplicator::new(config.dedup.clone()),
            compressor: Compressor::new(config.compression.clone()),
            buffers: ObjectPool::buffers(BUFFER_CAPACITY, BUFFER_POOL_SIZE),
            metrics: MetricsCollector::new(),
            status: network.sync_status_listeners(),
            next_seq: AtomicU64::new(0),
            sync_in_progress: AtomicBool::new(false),
            last_report: Mutex::new(None),
            device_id,
            store,
            remote,
            config,
            schemas,
            network,
            bandwidth,
        };

        let engine = SyncEngine {
            inner: Arc::new(inner),
        };
        engine.restore_pending().await?;
        info!("Sync engine ready for device {}", engine.inner.device_id);
        Ok(engine)
    }
}

struct Inner {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    config: EngineConfig,
    schemas: SchemaRegistry,
    device_id: DeviceId,
    ids: IdGenerator,
    locks: SyncLockManager,
    conflicts: ConflictDetector,
    coalescer: RequestCoalescer,
    /// Keyed by change id. Also guards the coalescer so both always hold the
    /// same changes.
    queue: Mutex<PriorityQueue<Queued>>,
    dedup: RequestDeduplicator<Transmitted>,
    bandwidth: BandwidthDetector,
    network: ConnectivityMonitor,
    compressor: Compressor,
    buffers: ObjectPool<Vec<u8>>,
    metrics: MetricsCollector,
    status: Listeners<SyncStatus>,
    next_seq: AtomicU64,
    sync_in_progress: AtomicBool,
    last_report: Mutex<Option<SyncReport>>,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn builder(store: LocalStore, remote: Arc<dyn RemoteStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            remote,
            config: EngineConfig::default(),
            schemas: SchemaRegistry::clinical(),
            reachability: None,
            bandwidth: None,
        }
    }

    pub async fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::builder(store, remote).config(config).build().await
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.inner.ids
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.network
    }

    pub fn locks(&self) -> &SyncLockManager {
        &self.inner.locks
    }

    pub fn bandwidth(&self) -> &BandwidthDetector {
        &self.inner.bandwidth
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.inner.metrics.snapshot()
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.inner.dedup.stats()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.sync_in_progress.load(Ordering::SeqCst)
    }

    /// Report of the most recent completed flush.
    pub fn last_report(&self) -> Option<SyncReport> {
        self.inner.last_report.lock().clone()
    }

    /// Queued changes in transmission order.
    pub fn pending_changes(&self) -> Vec<QueuedChange> {
        self.inner
            .queue
            .lock()
            .snapshot()
            .into_iter()
            .map(|queued| queued.change)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn subscribe_sync_status(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.network.subscribe_sync_status(listener)
    }

    /// Start background services and flush on every confirmed reconnect.
    pub fn start(&self) {
        self.inner.locks.start();
        self.inner.bandwidth.start();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handler: Weak<dyn FlushHandler> = weak;
        self.inner.network.attach_flush_handler(handler);
        debug!("Sync engine started");
    }

    /// Feed raw platform connectivity signals to the monitor.
    pub fn listen_for_signals(&self, signals: mpsc::Receiver<RawSignal>) {
        self.inner.network.spawn_listener(signals);
    }

    /// Stop background services and drop in-memory pipeline state. The
    /// durable queue is kept and restored on the next start.
    pub fn cleanup(&self) {
        let inner = &self.inner;
        inner.network.stop();
        inner.network.detach_flush_handler();
        inner.bandwidth.stop();
        inner.locks.stop();
        inner.locks.release_all();
        {
            let mut queue = inner.queue.lock();
            queue.clear();
            inner.coalescer.clear();
        }
        inner.dedup.clear();
        inner.buffers.clear();
        info!("Sync engine cleaned up");
    }

    /// Record a change locally. Returns `None` when `new_data` does not
    /// differ from the previous state.
    ///
    /// `old_data` defaults to the stored local copy. The call never waits on
    /// the network; when the batch fills up while online a background flush
    /// is started.
    pub async fn save(
        &self,
        entity_id: &str,
        entity_type: &str,
        new_data: Value,
        old_data: Option<Value>,
        priority: SyncPriority,
    ) -> Result<Option<SaveReceipt>> {
        let receipt = self
            .inner
            .save(entity_id, entity_type, new_data, old_data, priority)
            .await?;

        if receipt.as_ref().is_some_and(|receipt| receipt.batch_full)
            && self.inner.network.is_online()
        {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.flush().await });
        }
        Ok(receipt)
    }

    /// Run `transmit` deduplicated by `key` and retried with a backoff
    /// derived from the current connection quality.
    pub async fn sync<F, Fut>(&self, key: &str, transmit: F) -> Result<Transmitted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Transmitted>>,
    {
        self.inner.sync(key, &self.inner.bandwidth.strategy(), transmit).await
    }

    /// Transmit every queued change.
    pub async fn sync_pending(&self) -> Result<SyncReport> {
        self.inner.sync_pending().await
    }

    /// Reload queued changes persisted by a previous session. Returns the
    /// number of changes added to the in-memory queue.
    pub async fn restore_pending(&self) -> Result<usize> {
        self.inner.restore_pending().await
    }
}

#[async_trait]
impl FlushHandler for Inner {
    async fn flush(&self) {
        match self.sync_pending().await {
            Ok(report) if report.skipped => debug!("Flush skipped; sync already running"),
            Ok(report) => info!(
                "Flush finished: {} synced, {} failed, {} rejected",
                report.synced, report.failed, report.rejected
            ),
            Err(error) => warn!("Flush failed: {error}"),
        }
    }
}

impl Inner {
    fn publish(&self, status: &SyncStatus) {
        self.status.notify(status);
    }

    /// Hold the entity's sync lock, waiting for a current holder if needed.
    async fn lock_entity(&self, key: &str, issued_by: &str) -> Result<LockGuard> {
        if let Some(guard) = self.locks.lock(key, issued_by) {
            return Ok(guard);
        }
        let timeout = Duration::from_millis(self.config.lock.timeout_ms);
        if self.locks.wait_for_release(key, timeout).await {
            if let Some(guard) = self.locks.lock(key, issued_by) {
                return Ok(guard);
            }
        }
        Err(Error::LockUnavailable(key.to_string()))
    }

    async fn save(
        &self,
        entity_id: &str,
        entity_type: &str,
        new_data: Value,
        old_data: Option<Value>,
        priority: SyncPriority,
    ) -> Result<Option<SaveReceipt>> {
        if !ids::is_valid_id(entity_id) {
            return Err(Error::InvalidInput(format!("invalid entity id: {entity_id}")));
        }
        if entity_type.trim().is_empty() {
            return Err(Error::InvalidInput("entity type must not be empty".to_string()));
        }
        if !new_data.is_object() {
            return Err(Error::InvalidInput(
                "entity data must be a JSON object".to_string(),
            ));
        }

        // A caller may still hold a temporary id that was already exchanged.
        let entity_id = if ids::is_temporary(entity_id) {
            self.store
                .resolved_id(entity_id)
                .await?
                .unwrap_or_else(|| entity_id.to_string())
        } else {
            entity_id.to_string()
        };

        let key = resource_key(entity_type, &entity_id);
        let _guard = self.lock_entity(&key, SAVE_ISSUER).await?;

        let new_data = without_merge_tags(new_data);
        let stored = self.store.get(entity_type, &entity_id).await?;
        // `null` or any other non-object previous snapshot means "no snapshot".
        let base = old_data
            .filter(Value::is_object)
            .or_else(|| stored.as_ref().map(|record| record.data.clone()))
            .map(without_merge_tags);

        let mut tracker = DirtyFieldTracker::new(self.schemas.get(entity_type));
        tracker.initialize(base.as_ref().unwrap_or(&Value::Object(Map::new())));
        for (path, value) in calculate_delta(base.as_ref(), &new_data) {
            tracker.update_field(&path, value)?;
        }
        if !tracker.has_changes() {
            debug!("No changes to save for {key}");
            return Ok(None);
        }

        let stored_version = self
            .conflicts
            .stored_version(entity_type, &entity_id)
            .await?
            .map_or(0, |record| record.version);
        let local_version = stored.as_ref().map_or(0, |record| record.metadata.version);
        let version = local_version.max(stored_version) + 1;

        let mut record =
            stored.unwrap_or_else(|| EntityRecord::new(entity_id.clone(), entity_type, Value::Null));
        record.data = new_data;
        record.metadata.is_dirty = true;
        record.metadata.version = version;

        let change = QueuedChange {
            change_id: ids::generate_secure_uuid(),
            form_id: entity_id.clone(),
            form_type: entity_type.to_string(),
            delta: tracker.get_changes(),
            priority,
            enqueued_at: now_millis(),
            version,
            retries: 0,
            last_error: None,
        };
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;

        // Durable first: a storage failure leaves memory untouched.
        self.store.save_pending(&record, &change, seq).await?;

        let batch_full = {
            let mut queue = self.queue.lock();
            let batch_full = self.coalescer.add(&change);
            queue.insert_at(
                change.change_id.clone(),
                priority,
                seq,
                Queued {
                    seq,
                    change: change.clone(),
                },
            );
            batch_full
        };
        debug!(
            "Saved {key} v{version} ({} fields, priority {priority})",
            tracker.stats().dirty_fields
        );

        Ok(Some(SaveReceipt {
            change_id: change.change_id,
            entity_id,
            entity_type: entity_type.to_string(),
            version,
            changed_fields: tracker.get_changed_fields(),
            priority,
            batch_full,
        }))
    }

    async fn restore_pending(&self) -> Result<usize> {
        let mut stored = self.store.queued_changes().await?;
        let max_seq = stored.iter().map(|(_, seq)| *seq).max().unwrap_or(0);
        self.next_seq.fetch_max(max_seq, Ordering::SeqCst);
        stored.sort_by_key(|(_, seq)| *seq);

        let mut restored = 0;
        let mut queue = self.queue.lock();
        for (change, seq) in stored {
            if queue.contains(&change.change_id) {
                continue;
            }
            self.coalescer.add(&change);
            queue.insert_at(change.change_id.clone(), change.priority, seq, Queued { seq, change });
            restored += 1;
        }
        drop(queue);

        if restored > 0 {
            info!("Restored {restored} queued changes");
        }
        Ok(restored)
    }

    async fn sync<F, Fut>(
        &self,
        key: &str,
        strategy: &SyncStrategy,
        mut transmit: F,
    ) -> Result<Transmitted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Transmitted>>,
    {
        let retry = SmartRetry::new(self.config.retry.clone().with_base_delay(strategy.retry_delay));
        let metrics = &self.metrics;
        self.dedup
            .execute(key, || async move {
                let mut attempts = 0_u32;
                retry
                    .run(key, || {
                        attempts += 1;
                        if attempts > 1 {
                            metrics.record_retry();
                        }
                        transmit()
                    })
                    .await
            })
            .await
    }

    async fn sync_pending(&self) -> Result<SyncReport> {
        if self.sync_in_progress.swap(true, Ordering::SeqCst) {
            debug!("Sync already in progress");
            return Ok(SyncReport::skipped());
        }
        let _in_progress = InProgress(&self.sync_in_progress);

        let started = Instant::now();
        let result = self.flush_queue().await;
        let elapsed = started.elapsed();

        match result {
            Ok(mut report) => {
                report.duration_ms = duration_millis(elapsed);
                if report.synced + report.failed + report.rejected > 0 {
                    self.metrics.record_sync(elapsed, report.synced, report.failed);
                }
                *self.last_report.lock() = Some(report.clone());
                Ok(report)
            }
            Err(error) => {
                self.publish(&SyncStatus::Error {
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Take everything queued, in priority order, one entry per entity.
    fn drain(&self) -> (VecDeque<CoalescedChange>, HashMap<String, Queued>) {
        let mut queue = self.queue.lock();
        let mut batch: HashMap<String, CoalescedChange> = self
            .coalescer
            .flush()
            .into_iter()
            .map(|entry| (resource_key(&entry.form_type, &entry.form_id), entry))
            .collect();

        let mut work = VecDeque::new();
        let mut changes = HashMap::new();
        while let Some((change_id, queued)) = queue.dequeue() {
            let key = queued.change.resource_key();
            if let Some(entry) = batch.remove(&key) {
                work.push_back(entry);
            }
            changes.insert(change_id, queued);
        }
        work.extend(batch.into_values());
        (work, changes)
    }

    async fn flush_queue(&self) -> Result<SyncReport> {
        let (mut work, mut changes) = self.drain();
        let mut report = SyncReport::default();
        if work.is_empty() {
            self.publish(&SyncStatus::Idle);
            return Ok(report);
        }

        let total = work.len();
        info!("Syncing {total} entities ({} queued changes)", changes.len());
        self.publish(&SyncStatus::Syncing { done: 0, total });

        let mut done = 0;
        while let Some(entry) = work.pop_front() {
            match self.sync_entity(&entry).await {
                Ok(outcome) => {
                    report.synced += 1;
                    self.metrics.record_coalesced(entry.merged);
                    report.conflicts.extend(outcome.conflict);
                    if let Some(permanent_id) = outcome.permanent_id {
                        self.retarget(&entry.form_id, &permanent_id, &mut work, &mut changes);
                        report.id_map.insert(entry.form_id.clone(), permanent_id);
                    }
                    for change_id in &entry.change_ids {
                        changes.remove(change_id);
                    }
                }
                Err(error @ Error::StaleWrite { .. }) => {
                    warn!("Rejected queued change: {error}");
                    report.rejected += 1;
                    if let Err(error) = self.settle_rejected(&entry).await {
                        warn!("Failed to drop rejected changes: {error}");
                    }
                    for change_id in &entry.change_ids {
                        changes.remove(change_id);
                    }
                }
                Err(error) => {
                    warn!(
                        "Failed to sync {}:{}: {error}",
                        entry.form_type, entry.form_id
                    );
                    report.failed += 1;
                    report.failures.push(SyncFailure {
                        entity_type: entry.form_type.clone(),
                        entity_id: entry.form_id.clone(),
                        change_ids: entry.change_ids.clone(),
                        error: error.to_string(),
                        retryable: error.is_retryable(),
                    });
                    self.requeue(&entry, &mut changes, &error.to_string()).await;
                }
            }
            done += 1;
            self.publish(&SyncStatus::Syncing { done, total });
        }

        if report.failed == 0 {
            self.publish(&SyncStatus::Success {
                synced: report.synced,
            });
        } else {
            self.publish(&SyncStatus::Partial {
                synced: report.synced,
                failed: report.failed,
            });
        }
        Ok(report)
    }

    /// Point every pending reference at `new_id` after a create.
    fn retarget(
        &self,
        old_id: &str,
        new_id: &str,
        work: &mut VecDeque<CoalescedChange>,
        changes: &mut HashMap<String, Queued>,
    ) {
        for entry in work.iter_mut() {
            substitute_reference(&mut entry.delta, old_id, new_id);
        }
        for queued in changes.values_mut() {
            if queued.change.form_id == old_id {
                queued.change.form_id = new_id.to_string();
            }
            substitute_reference(&mut queued.change.delta, old_id, new_id);
        }

        let mut queue = self.queue.lock();
        for queued in queue.iter_mut() {
            if queued.change.form_id == old_id {
                self.coalescer
                    .rekey(&queued.change.form_type, old_id, new_id);
                queued.change.form_id = new_id.to_string();
            }
            substitute_reference(&mut queued.change.delta, old_id, new_id);
        }
    }

    /// Put a failed entry back so the next flush retries it.
    /// Drop a rejected change and mark its record clean at the stored
    /// version, unless later edits are still waiting to be sent.
    async fn settle_rejected(&self, entry: &CoalescedChange) -> Result<()> {
        let key = resource_key(&entry.form_type, &entry.form_id);
        let _guard = self.lock_entity(&key, SYNC_ISSUER).await?;
        self.store.discard_queued(&entry.change_ids).await?;

        let Some(mut record) = self.store.get(&entry.form_type, &entry.form_id).await? else {
            return Ok(());
        };
        if record.metadata.version > entry.version {
            return Ok(());
        }
        if let Some(stored) = self
            .conflicts
            .stored_version(&entry.form_type, &entry.form_id)
            .await?
        {
            record.metadata.version = record.metadata.version.max(stored.version);
        }
        record.metadata.is_dirty = false;
        self.store.put(&record).await
    }

    async fn requeue(
        &self,
        entry: &CoalescedChange,
        changes: &mut HashMap<String, Queued>,
        error: &str,
    ) {
        if let Err(storage_error) = self.store.record_queue_failure(&entry.change_ids, error).await {
            warn!("Failed to record sync failure: {storage_error}");
        }

        let mut restored: Vec<Queued> = entry
            .change_ids
            .iter()
            .filter_map(|change_id| changes.remove(change_id))
            .map(|mut queued| {
                queued.change.retries += 1;
                queued.change.last_error = Some(error.to_string());
                queued
            })
            .collect();
        restored.sort_by_key(|queued| queued.seq);

        let mut queue = self.queue.lock();
        for queued in restored {
            self.coalescer.add(&queued.change);
            queue.insert_at(
                queued.change.change_id.clone(),
                queued.change.priority,
                queued.seq,
                queued,
            );
        }
    }

    async fn sync_entity(&self, entry: &CoalescedChange) -> Result<EntityOutcome> {
        let table = entry.form_type.as_str();
        let key = resource_key(table, &entry.form_id);
        let _guard = self.lock_entity(&key, SYNC_ISSUER).await?;

        let Some(mut record) = self.store.get(table, &entry.form_id).await? else {
            debug!("{key} no longer exists locally; dropping its queued changes");
            self.store.discard_queued(&entry.change_ids).await?;
            return Ok(EntityOutcome::default());
        };
        self.conflicts
            .ensure_fresh(table, &record.id, entry.version)
            .await?;

        let strategy = self.bandwidth.strategy();
        let mut outcome = EntityOutcome::default();

        if record.is_temporary() {
            let temporary_id = record.id.clone();
            let document = Self::document_for_create(&record)?;
            let remote = &self.remote;
            let document = &document;
            let created = self
                .sync(&format!("create:{key}@{}", entry.version), &strategy, || async move {
                    remote
                        .create(table, document)
                        .await
                        .map(|created| Transmitted {
                            id: created.id,
                            version: created.version,
                        })
                })
                .await?;

            self.store.rekey(table, &temporary_id, &created.id).await?;
            record.id.clone_from(&created.id);
            outcome.permanent_id = Some(created.id);
            self.finish(&mut record, created.version, entry).await?;
            return Ok(outcome);
        }

        let base_version = self
            .conflicts
            .stored_version(table, &record.id)
            .await?
            .map_or(0, |stored| stored.version);
        let mut fields = if strategy.delta_sync {
            entry.delta.clone()
        } else {
            calculate_delta(None, &record.data)
        };

        let server = self.read_remote(table, &record.id).await?;
        if let Some(server) = server.filter(|server| server.version > base_version) {
            let local_body = document_body(&record.data);
            let server_body = document_body(&server.fields);
            let info = conflict::detect(
                &local_body,
                &server_body,
                record.metadata.version,
                server.version,
            );
            if info.needs_audit() {
                let audited = self.conflicts.record_conflict(table, &record.id, &info).await?;
                self.metrics.record_conflict();
                outcome.conflict = Some(audited);
            }

            match info.resolution {
                Resolution::UseServer => {
                    debug!("Adopting server copy of {key} at v{}", server.version);
                    record.data = conflict::resolve(&local_body, &server_body, &info);
                    self.finish(&mut record, server.version, entry).await?;
                    return Ok(outcome);
                }
                Resolution::MergeNeeded => {
                    let merged = conflict::resolve(&local_body, &server_body, &info);
                    fields = calculate_delta(Some(&server_body), &merged);
                    // Audit tags travel only in the remote write.
                    record.data = document_body(&merged);
                }
                Resolution::UseLocal => {}
            }
        }

        self.resolve_references(&mut fields).await?;
        let fields = with_bookkeeping(fields);
        let payload = self.encode(&fields, strategy.compression)?;
        self.metrics.record_delta(fields.len(), payload.bytes_saved());

        let remote = &self.remote;
        let id = record.id.as_str();
        let payload = &payload;
        let written = self
            .sync(&format!("write:{key}@{}", entry.version), &strategy, || async move {
                remote
                    .write_encoded(table, id, payload)
                    .await
                    .map(|version| Transmitted {
                        id: id.to_string(),
                        version,
                    })
            })
            .await?;

        self.finish(&mut record, written.version, entry).await?;
        Ok(outcome)
    }

    /// Replace temporary references exchanged in an earlier session. Queued
    /// deltas restored from disk still carry the ids they were saved with.
    async fn resolve_references(&self, fields: &mut FieldChanges) -> Result<()> {
        let temporary: Vec<String> = fields
            .iter()
            .filter(|(path, _)| is_reference_path(path))
            .filter_map(|(_, value)| value.as_str())
            .filter(|id| ids::is_temporary(id))
            .map(str::to_string)
            .collect();
        for old_id in temporary {
            if let Some(new_id) = self.store.resolved_id(&old_id).await? {
                substitute_reference(fields, &old_id, &new_id);
            }
        }
        Ok(())
    }

    async fn read_remote(&self, table: &str, id: &str) -> Result<Option<RemoteDocument>> {
        let remote = &self.remote;
        retry("read remote document", &RetryConfig::query(), || async move {
            remote.read(table, id).await
        })
        .await
    }

    /// Record the accepted `version` and drop the transmitted queue entries.
    /// Edits saved after `entry` was drained keep the record dirty.
    async fn finish(
        &self,
        record: &mut EntityRecord,
        version: u64,
        entry: &CoalescedChange,
    ) -> Result<()> {
        let now = now_millis();
        if record.metadata.version <= entry.version {
            record.mark_synced(version, now);
        } else {
            record.metadata.last_synced = Some(now);
        }
        let version_record = self.conflicts.version_record(&record.data, version);
        self.store
            .complete_sync(record, &version_record, &entry.change_ids)
            .await?;
        debug!("{}:{} accepted at v{version}", record.entity_type, record.id);
        Ok(())
    }

    fn document_for_create(record: &EntityRecord) -> Result<Value> {
        let mut document = match &record.data {
            Value::Object(_) => record.data.clone(),
            _ => Value::Object(Map::new()),
        };
        set_path(&mut document, LAST_SYNCED_PATH, Value::String(now_rfc3339()))?;
        set_path(&mut document, IS_DIRTY_PATH, Value::Bool(false))?;
        set_path(&mut document, OFFLINE_ID_PATH, Value::String(record.id.clone()))?;
        Ok(document)
    }

    /// Serialize through a pooled buffer and compress when the strategy
    /// asks for it.
    fn encode(&self, fields: &FieldChanges, compress: bool) -> Result<EncodedPayload> {
        let mut buffer = self.buffers.acquire();
        let encoded = serde_json::to_writer(&mut buffer, &WriteBody { fields })
            .map_err(Error::from)
            .and_then(|()| self.compressor.encode_serialized(fields, &buffer, compress));
        self.buffers.release(buffer);
        encoded
    }
}
