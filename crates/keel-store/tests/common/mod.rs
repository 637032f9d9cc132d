//! Common test infrastructure for store integration tests.

use keel_store::{SqliteJobStore, StoreConfig};
use std::path::PathBuf;
use tempfile::TempDir;

/// Test store wrapper.
///
/// Owns a temporary directory holding the database file; the file is
/// deleted when the wrapper is dropped.
pub struct TestStore {
    dir: TempDir,
    store: SqliteJobStore,
}

impl TestStore {
    /// Creates a fresh store in a new temporary directory.
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = SqliteJobStore::open(&StoreConfig::at(dir.path().join("jobs.db")))
            .await
            .expect("Failed to open store");

        Self { dir, store }
    }

    /// Returns the store.
    pub fn store(&self) -> &SqliteJobStore {
        &self.store
    }

    /// Path of the database file.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join("jobs.db")
    }

    /// Closes the store and opens it again from the same file.
    pub async fn reopen(self) -> Self {
        self.store.close().await;
        let store = SqliteJobStore::open_path(self.path())
            .await
            .expect("Failed to reopen store");

        Self { dir: self.dir, store }
    }
}
