//! Process-local cache backing. Everything is lost on restart.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{CacheBacking, CacheEntry, CacheError, SnapshotRow};
use crate::types::{EngagementRecord, SuggestionRecord};

/// In-memory backing: maps behind non-poisoning locks.
#[derive(Default)]
pub struct MemoryBacking {
    entries: RwLock<HashMap<(String, String), CacheEntry>>,
    snapshot: RwLock<Option<SnapshotRow>>,
    engagements: RwLock<HashMap<String, EngagementRecord>>,
    suggestions: RwLock<HashMap<String, SuggestionRecord>>,
}

impl CacheBacking for MemoryBacking {
    fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .entries
            .read()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn put_entry(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        cached_at: &str,
    ) -> Result<(), CacheError> {
        self.entries.write().insert(
            (namespace.to_string(), key.to_string()),
            CacheEntry {
                value: value.to_string(),
                cached_at: cached_at.to_string(),
            },
        );
        Ok(())
    }

    fn clear_namespace(&self, namespace: &str) -> Result<(), CacheError> {
        self.entries.write().retain(|(ns, _), _| ns != namespace);
        Ok(())
    }

    fn get_snapshot(&self) -> Result<Option<SnapshotRow>, CacheError> {
        Ok(self.snapshot.read().clone())
    }

    fn replace_snapshot(&self, data: &str, last_fetched: &str) -> Result<(), CacheError> {
        // Single slot swap under the write lock; readers see old or new.
        *self.snapshot.write() = Some(SnapshotRow {
            data: data.to_string(),
            last_fetched: last_fetched.to_string(),
        });
        Ok(())
    }

    fn clear_snapshot(&self) -> Result<(), CacheError> {
        *self.snapshot.write() = None;
        Ok(())
    }

    fn upsert_engagement(&self, record: &EngagementRecord) -> Result<(), CacheError> {
        self.engagements
            .write()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn latest_engagement_at(&self, company_id: &str) -> Result<Option<String>, CacheError> {
        // Timestamps are normalized UTC RFC 3339, so the string max is the
        // chronological max (same as the durable backing's SQL MAX).
        Ok(self
            .engagements
            .read()
            .values()
            .filter(|r| r.company_id == company_id)
            .map(|r| r.occurred_at.clone())
            .max())
    }

    fn engagements_for(
        &self,
        company_id: &str,
        limit: usize,
    ) -> Result<Vec<EngagementRecord>, CacheError> {
        let mut rows: Vec<EngagementRecord> = self
            .engagements
            .read()
            .values()
            .filter(|r| r.company_id == company_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        rows.truncate(limit);
        Ok(rows)
    }

    fn get_suggestion(&self, deal_id: &str) -> Result<Option<SuggestionRecord>, CacheError> {
        Ok(self.suggestions.read().get(deal_id).cloned())
    }

    fn put_suggestion(&self, record: &SuggestionRecord) -> Result<(), CacheError> {
        self.suggestions
            .write()
            .insert(record.deal_id.clone(), record.clone());
        Ok(())
    }
}
