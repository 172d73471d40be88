//! Database layer for trialsync

mod connection;
mod conflict_repository;
mod entity_repository;
mod meta_repository;
pub(crate) mod migrations;
mod queue_repository;
mod version_repository;

pub use connection::Database;
pub use conflict_repository::{ConflictRepository, SqliteConflictRepository};
pub use entity_repository::{EntityRepository, SqliteEntityRepository};
pub use meta_repository::{MetaRepository, SqliteMetaRepository};
pub use queue_repository::{QueueRepository, SqliteQueueRepository};
pub use version_repository::{SqliteVersionRepository, VersionRepository};
