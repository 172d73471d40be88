//! Shared services wrapping the database layer.

mod local_store;

pub use local_store::LocalStore;
