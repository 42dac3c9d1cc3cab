//! Single-slot cache for the latest full deal list.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::{CacheBacking, CacheError};
use crate::types::Deal;
use crate::util::parse_timestamp;

/// The current full materialization of the pipeline, as of `last_fetched`.
/// Never a partial view: a write always carries the complete collection.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub data: Vec<Deal>,
    pub last_fetched: DateTime<Utc>,
}

impl Snapshot {
    pub fn age(&self) -> Duration {
        Utc::now() - self.last_fetched
    }
}

pub struct SnapshotCache {
    backing: Arc<dyn CacheBacking>,
}

impl SnapshotCache {
    pub fn new(backing: Arc<dyn CacheBacking>) -> Self {
        Self { backing }
    }

    /// Load the current snapshot. A stored row that no longer parses is
    /// treated as absent (the next reconciliation bootstraps a fresh one).
    pub fn get(&self) -> Result<Option<Snapshot>, CacheError> {
        let Some(row) = self.backing.get_snapshot()? else {
            return Ok(None);
        };

        let Some(last_fetched) = parse_timestamp(&row.last_fetched) else {
            log::warn!("snapshot: unparseable last_fetched '{}', treating as absent", row.last_fetched);
            return Ok(None);
        };

        match serde_json::from_str::<Vec<Deal>>(&row.data) {
            Ok(data) => Ok(Some(Snapshot { data, last_fetched })),
            Err(e) => {
                log::warn!("snapshot: malformed stored data treated as absent: {}", e);
                Ok(None)
            }
        }
    }

    /// Atomically replace the snapshot with a complete deal collection.
    pub fn replace(&self, deals: &[Deal]) -> Result<(), CacheError> {
        let data = serde_json::to_string(deals)?;
        self.backing
            .replace_snapshot(&data, &Utc::now().to_rfc3339())
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.backing.clear_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::all_backings;
    use super::*;

    fn sample_deal(id: &str, marker: &str) -> Deal {
        Deal {
            id: id.to_string(),
            name: format!("Deal {id}"),
            stage_id: "discovery".to_string(),
            stage_label: "Discovery".to_string(),
            amount: None,
            company_id: None,
            company_name: None,
            primary_contact_id: None,
            primary_contact_name: None,
            days_in_stage: None,
            last_meeting_at: None,
            last_modified: marker.to_string(),
        }
    }

    #[test]
    fn test_empty_slot_reads_none() {
        for (name, backing) in all_backings() {
            let cache = SnapshotCache::new(backing);
            assert!(cache.get().expect("get").is_none(), "{name}");
        }
    }

    #[test]
    fn test_replace_supersedes_entirely() {
        for (name, backing) in all_backings() {
            let cache = SnapshotCache::new(backing);

            cache
                .replace(&[sample_deal("a", "m1"), sample_deal("b", "m2")])
                .expect("first replace");
            cache
                .replace(&[sample_deal("c", "m3")])
                .expect("second replace");

            let snapshot = cache.get().expect("get").unwrap();
            let ids: Vec<&str> = snapshot.data.iter().map(|d| d.id.as_str()).collect();
            // No mix of old and new: the old collection is gone wholesale.
            assert_eq!(ids, vec!["c"], "{name}");
        }
    }

    #[test]
    fn test_malformed_stored_data_is_absent() {
        for (name, backing) in all_backings() {
            backing
                .replace_snapshot("{broken", "2026-03-01T10:00:00+00:00")
                .expect("raw write");
            let cache = SnapshotCache::new(backing);
            assert!(cache.get().expect("must not error").is_none(), "{name}");
        }
    }

    #[test]
    fn test_age_reflects_last_fetched() {
        for (name, backing) in all_backings() {
            backing
                .replace_snapshot("[]", &(Utc::now() - Duration::minutes(90)).to_rfc3339())
                .expect("raw write");
            let cache = SnapshotCache::new(backing);
            let snapshot = cache.get().expect("get").unwrap();
            assert!(snapshot.age() >= Duration::minutes(89), "{name}");
        }
    }

    #[test]
    fn test_clear_empties_slot() {
        for (name, backing) in all_backings() {
            let cache = SnapshotCache::new(backing);
            cache.replace(&[sample_deal("a", "m1")]).expect("replace");
            cache.clear().expect("clear");
            assert!(cache.get().expect("get").is_none(), "{name}");
        }
    }
}
