//! Shared local store service used by the sync engine and the CLI.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::{
    ConflictRepository, Database, EntityRepository, MetaRepository, QueueRepository,
    SqliteConflictRepository, SqliteEntityRepository, SqliteMetaRepository,
    SqliteQueueRepository, SqliteVersionRepository, VersionRepository,
};
use crate::ids::DeviceId;
use crate::models::{ConflictRecord, EntityRecord, QueuedChange, VersionRecord};
use crate::Result;

const DEVICE_ID_KEY: &str = "device_id";

/// Field rewritten when a temporary patient id becomes permanent.
const PATIENT_REFERENCE_FIELD: &str = "patientId";

/// Thread-safe service for local persistence.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open a store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path = db_path.clone();
        let db = tokio::task::spawn_blocking(move || Database::open(&path))
            .await
            .map_err(|error| crate::Error::Database(error.to_string()))??;
        tracing::debug!("Opened local store at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    /// Run `operation` against the database on the blocking pool. A missing
    /// auxiliary table is recreated and the operation retried once.
    async fn with_db<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let database = db.lock();
            match operation(&database) {
                Err(error) if error.is_missing_namespace() => {
                    tracing::warn!("Storage namespace missing ({error}); upgrading and retrying");
                    database.ensure_namespaces()?;
                    operation(&database)
                }
                result => result,
            }
        })
        .await
        .map_err(|error| crate::Error::Database(error.to_string()))?
    }

    /// Load the persisted device id, generating it on first use.
    pub async fn device_id(&self) -> Result<DeviceId> {
        let candidate = DeviceId::generate();
        let stored = self
            .with_db(move |db| {
                SqliteMetaRepository::new(db.connection())
                    .get_or_insert(DEVICE_ID_KEY, candidate.as_str())
            })
            .await?;
        stored.parse()
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_db(move |db| SqliteMetaRepository::new(db.connection()).get(&key))
            .await
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_db(move |db| SqliteMetaRepository::new(db.connection()).set(&key, &value))
            .await
    }

    pub async fn get(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>> {
        let (entity_type, id) = (entity_type.to_string(), id.to_string());
        self.with_db(move |db| SqliteEntityRepository::new(db.connection()).get(&entity_type, &id))
            .await
    }

    /// Insert or fully replace `record`.
    pub async fn put(&self, record: &EntityRecord) -> Result<()> {
        let record = record.clone();
        self.with_db(move |db| SqliteEntityRepository::new(db.connection()).put(&record))
            .await
    }

    pub async fn delete(&self, entity_type: &str, id: &str) -> Result<bool> {
        let (entity_type, id) = (entity_type.to_string(), id.to_string());
        self.with_db(move |db| {
            SqliteEntityRepository::new(db.connection()).delete(&entity_type, &id)
        })
        .await
    }

    pub async fn list(&self, entity_type: &str) -> Result<Vec<EntityRecord>> {
        let entity_type = entity_type.to_string();
        self.with_db(move |db| SqliteEntityRepository::new(db.connection()).list(&entity_type))
            .await
    }

    pub async fn list_dirty(&self) -> Result<Vec<EntityRecord>> {
        self.with_db(|db| SqliteEntityRepository::new(db.connection()).list_dirty())
            .await
    }

    pub async fn get_version(&self, table: &str, id: &str) -> Result<Option<VersionRecord>> {
        let (table, id) = (table.to_string(), id.to_string());
        self.with_db(move |db| SqliteVersionRepository::new(db.connection()).get(&table, &id))
            .await
    }

    pub async fn put_version(&self, table: &str, id: &str, record: &VersionRecord) -> Result<()> {
        let (table, id, record) = (table.to_string(), id.to_string(), record.clone());
        self.with_db(move |db| {
            SqliteVersionRepository::new(db.connection()).put(&table, &id, &record)
        })
        .await
    }

    /// Persist a locally saved entity together with its queued change.
    pub async fn save_pending(
        &self,
        record: &EntityRecord,
        change: &QueuedChange,
        seq: u64,
    ) -> Result<()> {
        let (record, change) = (record.clone(), change.clone());
        self.with_db(move |db| {
            let tx = db.connection().unchecked_transaction()?;
            SqliteEntityRepository::new(&tx).put(&record)?;
            SqliteQueueRepository::new(&tx).upsert(&change, seq)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Persist an entity accepted by the remote store: updated record, new
    /// version record and removal of the transmitted queue entries.
    pub async fn complete_sync(
        &self,
        record: &EntityRecord,
        version: &VersionRecord,
        change_ids: &[String],
    ) -> Result<()> {
        let (record, version, change_ids) = (record.clone(), version.clone(), change_ids.to_vec());
        self.with_db(move |db| {
            let tx = db.connection().unchecked_transaction()?;
            SqliteEntityRepository::new(&tx).put(&record)?;
            SqliteVersionRepository::new(&tx).put(&record.entity_type, &record.id, &version)?;
            let queue = SqliteQueueRepository::new(&tx);
            for change_id in &change_ids {
                queue.remove(change_id)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Drop queue entries that will never be transmitted.
    pub async fn discard_queued(&self, change_ids: &[String]) -> Result<usize> {
        let change_ids = change_ids.to_vec();
        self.with_db(move |db| {
            let queue = SqliteQueueRepository::new(db.connection());
            let mut removed = 0;
            for change_id in &change_ids {
                if queue.remove(change_id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }

    /// Replace a temporary id with the permanent one everywhere it is stored:
    /// the entity row, its version record, queued changes and `patientId`
    /// references held by other entities.
    pub async fn rekey(&self, entity_type: &str, old_id: &str, new_id: &str) -> Result<()> {
        let (table, old, new) = (entity_type.to_string(), old_id.to_string(), new_id.to_string());
        self.with_db(move |db| {
            let tx = db.connection().unchecked_transaction()?;
            let entities = SqliteEntityRepository::new(&tx);
            if entities.get(&table, &old)?.is_some() {
                entities.rekey(&table, &old, &new)?;
            }
            entities.replace_reference(PATIENT_REFERENCE_FIELD, &old, &new)?;
            SqliteVersionRepository::new(&tx).rekey(&table, &old, &new)?;
            SqliteQueueRepository::new(&tx).rekey(&old, &new)?;
            SqliteMetaRepository::new(&tx).set(&format!("idmap:{old}"), &new)?;
            tx.commit()?;
            Ok(())
        })
        .await?;
        tracing::info!("Replaced temporary id {old_id} with {new_id}");
        Ok(())
    }

    /// Permanent id previously assigned to a temporary id.
    pub async fn resolved_id(&self, temporary_id: &str) -> Result<Option<String>> {
        self.get_meta(&format!("idmap:{temporary_id}")).await
    }

    pub async fn upsert_queued(&self, change: &QueuedChange, seq: u64) -> Result<()> {
        let change = change.clone();
        self.with_db(move |db| SqliteQueueRepository::new(db.connection()).upsert(&change, seq))
            .await
    }

    pub async fn queued_changes(&self) -> Result<Vec<(QueuedChange, u64)>> {
        self.with_db(|db| SqliteQueueRepository::new(db.connection()).list())
            .await
    }

    pub async fn remove_queued(&self, change_id: &str) -> Result<bool> {
        let change_id = change_id.to_string();
        self.with_db(move |db| SqliteQueueRepository::new(db.connection()).remove(&change_id))
            .await
    }

    pub async fn record_queue_failure(&self, change_ids: &[String], error: &str) -> Result<()> {
        let (change_ids, error) = (change_ids.to_vec(), error.to_string());
        self.with_db(move |db| {
            let repo = SqliteQueueRepository::new(db.connection());
            for change_id in &change_ids {
                repo.record_failure(change_id, &error)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn max_queue_seq(&self) -> Result<u64> {
        self.with_db(|db| SqliteQueueRepository::new(db.connection()).max_seq())
            .await
    }

    pub async fn queue_len(&self) -> Result<usize> {
        self.with_db(|db| SqliteQueueRepository::new(db.connection()).count())
            .await
    }

    pub async fn record_conflict(&self, record: &ConflictRecord) -> Result<i64> {
        let record = record.clone();
        self.with_db(move |db| SqliteConflictRepository::new(db.connection()).insert(&record))
            .await
    }

    pub async fn recent_conflicts(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        self.with_db(move |db| SqliteConflictRepository::new(db.connection()).list(limit))
            .await
    }

    pub async fn conflicts_for(&self, table: &str, entity_id: &str) -> Result<Vec<ConflictRecord>> {
        let (table, entity_id) = (table.to_string(), entity_id.to_string());
        self.with_db(move |db| {
            SqliteConflictRepository::new(db.connection()).list_for(&table, &entity_id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldChanges, SyncPriority};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn queued(form_id: &str) -> QueuedChange {
        QueuedChange {
            change_id: format!("chg_{form_id}"),
            form_id: form_id.to_string(),
            form_type: "patient".to_string(),
            delta: FieldChanges::from([("status".to_string(), json!("enrolled"))]),
            priority: SyncPriority::Critical,
            enqueued_at: 1,
            version: 1,
            retries: 0,
            last_error: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_writers_share_the_store() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let writers: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    let record = EntityRecord::new(format!("p{n}"), "patient", json!({"visit": n}));
                    store.put(&record).await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        assert_eq!(store.list("patient").await.unwrap().len(), 8);
        let stored = store.get("patient", "p3").await.unwrap().unwrap();
        assert_eq!(stored.data, json!({"visit": 3}));
    }

    #[tokio::test]
    async fn device_id_is_stable() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let first = store.device_id().await.unwrap();
        let second = store.device_id().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn device_id_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trialsync.db");
        let first = LocalStore::open_path(&path).await.unwrap().device_id().await.unwrap();
        let second = LocalStore::open_path(&path).await.unwrap().device_id().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_namespace_is_recreated_and_retried() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .put(&EntityRecord::new("p1", "patient", json!({"status": "active"})))
            .await
            .unwrap();
        store
            .with_db(|db| {
                db.connection().execute_batch("DROP TABLE _versions")?;
                Ok(())
            })
            .await
            .unwrap();

        let record = VersionRecord {
            version: 1,
            checksum: "abc".to_string(),
            timestamp: 0,
            device_id: "device_0a1b2c3d4e5f".to_string(),
        };
        store.put_version("patient", "p1", &record).await.unwrap();
        assert_eq!(store.get_version("patient", "p1").await.unwrap(), Some(record));
        assert!(store.get("patient", "p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn save_pending_and_complete_sync() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut record = EntityRecord::new("p1", "patient", json!({"status": "enrolled"}));
        record.metadata.is_dirty = true;
        store.save_pending(&record, &queued("p1"), 1).await.unwrap();
        assert_eq!(store.queue_len().await.unwrap(), 1);

        record.mark_synced(1, 10);
        let version = VersionRecord {
            version: 1,
            checksum: "abc".to_string(),
            timestamp: 10,
            device_id: "device_0a1b2c3d4e5f".to_string(),
        };
        store
            .complete_sync(&record, &version, &["chg_p1".to_string()])
            .await
            .unwrap();

        assert_eq!(store.queue_len().await.unwrap(), 0);
        let stored = store.get("patient", "p1").await.unwrap().unwrap();
        assert!(!stored.metadata.is_dirty);
        assert_eq!(store.get_version("patient", "p1").await.unwrap(), Some(version));
    }

    #[tokio::test]
    async fn rekey_rewrites_every_reference() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .save_pending(&EntityRecord::new("tmp1", "patient", json!({})), &queued("tmp1"), 1)
            .await
            .unwrap();
        store
            .put(&EntityRecord::new("f1", "baseline", json!({"patientId": "tmp1"})))
            .await
            .unwrap();

        store.rekey("patient", "tmp1", "perm1").await.unwrap();

        assert!(store.get("patient", "perm1").await.unwrap().is_some());
        assert_eq!(
            store.get("baseline", "f1").await.unwrap().unwrap().data["patientId"],
            "perm1"
        );
        assert_eq!(store.queued_changes().await.unwrap()[0].0.form_id, "perm1");
        assert_eq!(store.resolved_id("tmp1").await.unwrap().as_deref(), Some("perm1"));
    }
}
