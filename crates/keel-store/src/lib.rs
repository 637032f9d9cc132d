//! # Keel Store
//!
//! Durable storage for outstanding jobs.
//!
//! ```text
//! QueueEngine
//!   ↓  Arc<dyn JobStore>   (store contract)
//! SqliteJobStore           (SQLx / SQLite, one file per named store)
//!   ↓
//! jobs table
//! ```
//!
//! The store is the single source of truth for which jobs exist. Ids
//! returned by `fetch_next` stay reserved until the caller removes,
//! reschedules, or releases them; callers may also pass extra ids to skip.

pub mod pool;
pub mod sqlite;
pub mod traits;

pub use pool::StoreConfig;
pub use sqlite::SqliteJobStore;
pub use traits::*;
