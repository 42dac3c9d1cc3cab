//! Per-company meeting-identity cache.
//!
//! Validity here is a content fingerprint, not an age: the stored sorted
//! meeting-id sequence must be byte-equal to the caller's current sequence.
//! On a hit the cached `last_meeting_at` is reused no matter how much time
//! has passed; on a mismatch the caller re-derives it from meeting detail
//! and writes the result back with the new identity set.

use std::sync::Arc;

use super::{CacheBacking, CacheError, NS_MEETING_IDENTITY};
use crate::types::MeetingIdentity;
use crate::util::now_rfc3339;

/// Outcome of an identity-fingerprint lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityLookup {
    /// Identity unchanged; the cached value is usable. `None` means the
    /// company has a cached "no dated meetings" answer, which is itself a hit.
    Hit(Option<String>),
    /// No stored identity, unparseable stored identity, or a different id set.
    Miss,
}

pub struct MeetingIdentityCache {
    backing: Arc<dyn CacheBacking>,
}

impl MeetingIdentityCache {
    pub fn new(backing: Arc<dyn CacheBacking>) -> Self {
        Self { backing }
    }

    /// Sort and dedupe an id list into the canonical fingerprint form.
    pub fn canonical_ids(mut ids: Vec<String>) -> Vec<String> {
        ids.sort();
        ids.dedup();
        ids
    }

    /// Compare the stored identity against the current id set.
    /// `current_ids` must already be canonical (see [`canonical_ids`](Self::canonical_ids)).
    pub fn lookup(
        &self,
        company_id: &str,
        current_ids: &[String],
    ) -> Result<IdentityLookup, CacheError> {
        let Some(entry) = self.backing.get_entry(NS_MEETING_IDENTITY, company_id)? else {
            return Ok(IdentityLookup::Miss);
        };

        let stored: MeetingIdentity = match serde_json::from_str(&entry.value) {
            Ok(identity) => identity,
            Err(e) => {
                // Unparseable identity data is a miss, not a hard failure.
                log::warn!(
                    "meeting identity for company {} is malformed, treating as miss: {}",
                    company_id,
                    e
                );
                return Ok(IdentityLookup::Miss);
            }
        };

        if stored.meeting_ids == current_ids {
            Ok(IdentityLookup::Hit(stored.last_meeting_at))
        } else {
            Ok(IdentityLookup::Miss)
        }
    }

    /// Store a freshly derived value together with its identity set.
    /// An empty id set is stored explicitly: "zero meetings" is an answer.
    pub fn store(
        &self,
        company_id: &str,
        ids: &[String],
        last_meeting_at: Option<&str>,
    ) -> Result<(), CacheError> {
        let identity = MeetingIdentity {
            last_meeting_at: last_meeting_at.map(|s| s.to_string()),
            meeting_ids: ids.to_vec(),
        };
        let json = serde_json::to_string(&identity)?;
        self.backing
            .put_entry(NS_MEETING_IDENTITY, company_id, &json, &now_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::all_backings;
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_absent_company_misses() {
        for (name, backing) in all_backings() {
            let cache = MeetingIdentityCache::new(backing);
            let result = cache.lookup("c-1", &ids(&["m1"])).expect("lookup");
            assert_eq!(result, IdentityLookup::Miss, "{name}");
        }
    }

    #[test]
    fn test_equal_id_sequence_hits_regardless_of_age() {
        for (name, backing) in all_backings() {
            // Plant an identity written long ago; no TTL applies here.
            backing
                .put_entry(
                    NS_MEETING_IDENTITY,
                    "c-1",
                    r#"{"lastMeetingAt":"2026-01-05T15:00:00+00:00","meetingIds":["m1","m2"]}"#,
                    "2020-01-01T00:00:00+00:00",
                )
                .expect("put");

            let cache = MeetingIdentityCache::new(backing);
            let result = cache.lookup("c-1", &ids(&["m1", "m2"])).expect("lookup");
            assert_eq!(
                result,
                IdentityLookup::Hit(Some("2026-01-05T15:00:00+00:00".to_string())),
                "{name}"
            );
        }
    }

    #[test]
    fn test_changed_id_sequence_misses() {
        for (name, backing) in all_backings() {
            let cache = MeetingIdentityCache::new(backing);
            cache
                .store("c-1", &ids(&["m1", "m2"]), Some("2026-01-05T15:00:00+00:00"))
                .expect("store");

            // One id added
            assert_eq!(
                cache.lookup("c-1", &ids(&["m1", "m2", "m3"])).expect("lookup"),
                IdentityLookup::Miss,
                "{name}"
            );
            // One id removed
            assert_eq!(
                cache.lookup("c-1", &ids(&["m1"])).expect("lookup"),
                IdentityLookup::Miss,
                "{name}"
            );
        }
    }

    #[test]
    fn test_empty_set_is_a_cached_answer() {
        for (name, backing) in all_backings() {
            let cache = MeetingIdentityCache::new(backing);
            cache.store("c-1", &[], None).expect("store");

            let result = cache.lookup("c-1", &[]).expect("lookup");
            assert_eq!(result, IdentityLookup::Hit(None), "{name}");
        }
    }

    #[test]
    fn test_malformed_identity_is_a_miss() {
        for (name, backing) in all_backings() {
            backing
                .put_entry(NS_MEETING_IDENTITY, "c-1", "][", "2026-01-01T00:00:00+00:00")
                .expect("put");
            let cache = MeetingIdentityCache::new(backing);
            let result = cache.lookup("c-1", &ids(&["m1"])).expect("must not error");
            assert_eq!(result, IdentityLookup::Miss, "{name}");
        }
    }

    #[test]
    fn test_canonical_ids_sorts_and_dedupes() {
        let canonical =
            MeetingIdentityCache::canonical_ids(ids(&["m3", "m1", "m2", "m1"]));
        assert_eq!(canonical, ids(&["m1", "m2", "m3"]));
    }
}
