//! Cache layer between the dashboard and the rate-limited upstream.
//!
//! Storage is a capability (`CacheBacking`) with two interchangeable
//! implementations selected at startup: a process-local map (lost on
//! restart) and a durable SQLite store. Rows never expire in storage;
//! expiration is a read-time policy. A row keeps its `cached_at` forever and
//! each read decides whether the entry is still usable for the caller's max
//! age, so the reconciler is agnostic to which backing is active.

pub mod identity;
pub mod memory;
pub mod snapshot;
pub mod sqlite;

pub use identity::{IdentityLookup, MeetingIdentityCache};
pub use memory::MemoryBacking;
pub use snapshot::{Snapshot, SnapshotCache};
pub use sqlite::SqliteBacking;

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::types::{EngagementRecord, SuggestionRecord};
use crate::util::{now_rfc3339, parse_timestamp};

/// Namespace for cached company rows.
pub const NS_COMPANIES: &str = "companies";
/// Namespace for cached contact rows.
pub const NS_CONTACTS: &str = "contacts";
/// Namespace for per-company meeting identities.
pub const NS_MEETING_IDENTITY: &str = "meeting_identity";
/// Namespace for the pipeline-stage taxonomy (single entry).
pub const NS_STAGES: &str = "stages";
/// Fixed key for single-entry namespaces.
pub const SINGLETON_KEY: &str = "current";

/// Errors specific to cache-backing operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create cache directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A raw cached row: serialized value plus its write timestamp.
///
/// `cached_at` is set only on write; reads never touch it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: String,
    pub cached_at: String,
}

impl CacheEntry {
    /// Read-time freshness check. An unparseable `cached_at` counts as
    /// expired.
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        match parse_timestamp(&self.cached_at) {
            Some(at) => Utc::now() - at <= max_age,
            None => false,
        }
    }
}

/// Contents of the single snapshot slot.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub data: String,
    pub last_fetched: String,
}

/// Storage capability behind every cache in the system.
///
/// Writes are idempotent upserts; concurrent writers for the same key race
/// by write order (last write wins, no merge). The only eviction is an
/// explicit namespace clear.
pub trait CacheBacking: Send + Sync {
    fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    fn put_entry(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        cached_at: &str,
    ) -> Result<(), CacheError>;

    fn clear_namespace(&self, namespace: &str) -> Result<(), CacheError>;

    fn get_snapshot(&self) -> Result<Option<SnapshotRow>, CacheError>;

    /// Replace the single snapshot slot. A concurrent reader observes either
    /// the fully-old or fully-new snapshot, never a mix.
    fn replace_snapshot(&self, data: &str, last_fetched: &str) -> Result<(), CacheError>;

    fn clear_snapshot(&self) -> Result<(), CacheError>;

    /// Idempotent upsert by engagement id: same id replaces, never duplicates.
    fn upsert_engagement(&self, record: &EngagementRecord) -> Result<(), CacheError>;

    /// Cheap aggregate: the latest `occurred_at` for a company, if any.
    fn latest_engagement_at(&self, company_id: &str) -> Result<Option<String>, CacheError>;

    /// Most recent engagements for a company, newest first.
    fn engagements_for(
        &self,
        company_id: &str,
        limit: usize,
    ) -> Result<Vec<EngagementRecord>, CacheError>;

    fn get_suggestion(&self, deal_id: &str) -> Result<Option<SuggestionRecord>, CacheError>;

    fn put_suggestion(&self, record: &SuggestionRecord) -> Result<(), CacheError>;
}

/// Typed TTL-aware view over one namespace of the backing.
pub struct KvCache<T> {
    backing: Arc<dyn CacheBacking>,
    namespace: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> KvCache<T> {
    pub fn new(backing: Arc<dyn CacheBacking>, namespace: &'static str) -> Self {
        Self {
            backing,
            namespace,
            _marker: PhantomData,
        }
    }

    /// TTL-aware read. A miss is returned when no entry exists, when the
    /// entry is older than `max_age`, and when the stored value no longer
    /// deserializes (malformed cached data is a miss, never a hard failure).
    pub fn get(&self, key: &str, max_age: Duration) -> Result<Option<T>, CacheError> {
        let Some(entry) = self.backing.get_entry(self.namespace, key)? else {
            return Ok(None);
        };
        if !entry.is_fresh(max_age) {
            return Ok(None);
        }
        match serde_json::from_str(&entry.value) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                log::warn!(
                    "cache: malformed {} entry for '{}' treated as miss: {}",
                    self.namespace,
                    key,
                    e
                );
                Ok(None)
            }
        }
    }

    /// Upsert, stamping `cached_at = now`.
    pub fn set(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let json = serde_json::to_string(value)?;
        self.backing
            .put_entry(self.namespace, key, &json, &now_rfc3339())
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.backing.clear_namespace(self.namespace)
    }
}

// =============================================================================
// Shared test utilities
// =============================================================================

#[cfg(test)]
pub mod test_utils {
    use std::sync::Arc;

    use super::{CacheBacking, MemoryBacking, SqliteBacking};

    /// Open a throwaway durable backing.
    ///
    /// The `TempDir` is leaked so the file persists for the duration of the
    /// test; the OS cleans up test temp dirs.
    pub fn sqlite_backing() -> SqliteBacking {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        SqliteBacking::open_at(path).expect("Failed to open test backing")
    }

    /// Both backings, for suites that must hold on either.
    pub fn all_backings() -> Vec<(&'static str, Arc<dyn CacheBacking>)> {
        vec![
            ("memory", Arc::new(MemoryBacking::default()) as Arc<dyn CacheBacking>),
            ("sqlite", Arc::new(sqlite_backing()) as Arc<dyn CacheBacking>),
        ]
    }
}

// =============================================================================
// Tests
// =============================================================================
