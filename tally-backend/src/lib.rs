//! # Tally Backend
//!
//! Core of the election tally service: cast vote record ingestion, write-in
//! adjudication, manual results entry, and cached tabulation over a SQLite
//! record store. Transport, authentication, and report rendering are
//! external collaborators; this crate exposes the mutation and query API
//! they call.

pub mod cache;
pub mod db;
pub mod error;
pub mod import;
pub mod manual_results;
pub mod tabulation;
pub mod write_ins;

pub use crate::error::{Error, ImportError, RecordValidationError, Result};

use crate::cache::TabulationCache;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

/// Application state shared across request handlers
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Per-election write lock. Mutations hold the write side across their
    /// transaction and the version bump; tabulation reads hold the read side
    /// while snapshotting the version and scanning, so a reader never
    /// observes a version bump without the corresponding committed data.
    election_lock: RwLock<()>,
    /// Memoized aggregation results, keyed by corpus version
    cache: TabulationCache,
}

impl AppState {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            election_lock: RwLock::new(()),
            cache: TabulationCache::new(),
        }
    }

    pub(crate) fn election_lock(&self) -> &RwLock<()> {
        &self.election_lock
    }

    pub(crate) fn cache(&self) -> &TabulationCache {
        &self.cache
    }

    /// Number of full-corpus aggregations performed so far. Instrumentation
    /// hook: repeated reads with no intervening mutation must not move this.
    pub fn full_scan_count(&self) -> u64 {
        self.cache.full_scan_count()
    }
}
