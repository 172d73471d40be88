//! trialsync-core - offline-first sync engine for clinical trial records
//!
//! Edits are saved to a local SQLite store and queued with field-level
//! deltas. When connectivity is confirmed the queue is flushed to a remote
//! document store with coalescing, deduplication, adaptive retry and
//! conflict detection.

pub mod config;
pub mod conflict;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod filter;
pub mod ids;
pub mod lock;
pub mod models;
pub mod network;
pub mod paths;
pub mod pipeline;
pub mod remote;
pub mod services;
pub mod state;
pub mod tracker;
pub mod util;

pub use config::EngineConfig;
pub use engine::{EngineBuilder, SaveReceipt, SyncEngine, SyncFailure, SyncReport};
pub use error::{Error, Result};
pub use ids::{DeviceId, IdGenerator};
pub use models::{EntityRecord, QueuedChange, SyncPriority};
pub use remote::{HttpRemoteStore, MemoryRemoteStore, RemoteDocument, RemoteStore};
pub use services::LocalStore;
pub use state::SyncStatus;
