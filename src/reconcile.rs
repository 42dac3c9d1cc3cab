//! Change-detection reconciliation of the pipeline snapshot.
//!
//! Upstream is rate-limited, so a refresh cycle never re-fetches the world.
//! It probes a cheap id/marker listing, diffs it against the cached
//! snapshot, and fetches detail only for deals that are new or whose marker
//! moved, evicting deals that vanished from the listing. When nothing
//! changed, the cycle costs exactly one probe request.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::batch::run_batched;
use crate::cache::{
    CacheBacking, IdentityLookup, KvCache, MeetingIdentityCache, SnapshotCache, NS_COMPANIES,
    NS_CONTACTS, NS_STAGES, SINGLETON_KEY,
};
use crate::config::Config;
use crate::crm_api::{CrmApi, CrmApiError, DealMarker};
use crate::error::RefreshError;
use crate::types::{CompanyInfo, ContactInfo, Deal, StageInfo, StageTransition};
use crate::util::parse_timestamp;

// ============================================================================
// In-flight guard
// ============================================================================

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;

/// Serializes reconciliation runs as an explicit `idle | running` state
/// machine. A second trigger while one is in flight is a no-op, not queued;
/// the next trigger after completion simply runs.
pub struct RefreshController {
    state: AtomicU8,
}

impl RefreshController {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_IDLE),
        }
    }

    /// Attempt the idle -> running transition. Returns a guard that
    /// transitions back on drop, or `None` when a run is already in flight.
    pub fn begin(&self) -> Option<RefreshGuard<'_>> {
        self.state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshGuard { controller: self })
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }
}

impl Default for RefreshController {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RefreshGuard<'a> {
    controller: &'a RefreshController,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.controller.state.store(STATE_IDLE, Ordering::Release);
    }
}

// ============================================================================
// Diffing
// ============================================================================

/// Partition of the probe listing against the cached snapshot.
#[derive(Debug, Clone, Default)]
pub struct DealDiff {
    /// Upstream ids whose marker differs from the cache, or which the cache
    /// has never seen. Probe order is preserved.
    pub changed: Vec<String>,
    /// Cached ids absent from the fresh listing.
    pub deleted: HashSet<String>,
}

impl DealDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Diff the cached snapshot against a fresh probe listing. Markers are
/// compared verbatim; a reformatted-but-equal marker counts as changed,
/// which only costs one extra detail fetch.
pub fn partition_changes(cached: &[Deal], probe: &[DealMarker]) -> DealDiff {
    let cached_markers: HashMap<&str, &str> = cached
        .iter()
        .map(|d| (d.id.as_str(), d.last_modified.as_str()))
        .collect();
    let live: HashSet<&str> = probe.iter().map(|m| m.id.as_str()).collect();

    let mut diff = DealDiff::default();
    for marker in probe {
        match cached_markers.get(marker.id.as_str()) {
            Some(cached_marker) if *cached_marker == marker.last_modified => {}
            _ => diff.changed.push(marker.id.clone()),
        }
    }
    diff.deleted = cached
        .iter()
        .filter(|d| !live.contains(d.id.as_str()))
        .map(|d| d.id.clone())
        .collect();
    diff
}

// ============================================================================
// Stage duration
// ============================================================================

/// Days since the most recent transition *into* the current stage (ties
/// resolved toward the most recent timestamp). No usable history means no
/// answer, never zero.
pub fn days_in_stage(
    history: &[StageTransition],
    current_stage: &str,
    now: DateTime<Utc>,
) -> Option<i64> {
    history
        .iter()
        .filter(|t| t.stage_id == current_stage)
        .filter_map(|t| parse_timestamp(&t.occurred_at))
        .max()
        .map(|entered| (now - entered).num_days().max(0))
}

// ============================================================================
// Refresher
// ============================================================================

/// What a refresh cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another run was already in flight; nothing was done.
    AlreadyRunning,
    /// Probe and snapshot agreed; the cached snapshot stands, zero detail
    /// fetches spent.
    Unchanged { deals: usize },
    /// Snapshot merged and replaced.
    Updated {
        deals: usize,
        fetched: usize,
        removed: usize,
        failed: usize,
    },
    /// First-ever full fetch.
    Bootstrapped { deals: usize, failed: usize },
}

/// Tuning knobs for a reconciliation pass.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub sub_entity_ttl: chrono::Duration,
    pub stage_ttl: chrono::Duration,
    pub engagement_page_size: usize,
}

impl From<&Config> for RefreshSettings {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            sub_entity_ttl: chrono::Duration::hours(config.sub_entity_ttl_hours),
            stage_ttl: chrono::Duration::hours(config.stage_ttl_hours),
            engagement_page_size: config.engagement_page_size,
        }
    }
}

pub struct PipelineRefresher {
    crm: Arc<dyn CrmApi>,
    backing: Arc<dyn CacheBacking>,
    snapshot: SnapshotCache,
    companies: KvCache<CompanyInfo>,
    contacts: KvCache<ContactInfo>,
    stages: KvCache<Vec<StageInfo>>,
    identity: MeetingIdentityCache,
    controller: RefreshController,
    settings: RefreshSettings,
}

impl PipelineRefresher {
    pub fn new(
        crm: Arc<dyn CrmApi>,
        backing: Arc<dyn CacheBacking>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            crm,
            snapshot: SnapshotCache::new(backing.clone()),
            companies: KvCache::new(backing.clone(), NS_COMPANIES),
            contacts: KvCache::new(backing.clone(), NS_CONTACTS),
            stages: KvCache::new(backing.clone(), NS_STAGES),
            identity: MeetingIdentityCache::new(backing.clone()),
            controller: RefreshController::new(),
            settings,
            backing,
        }
    }

    pub fn controller(&self) -> &RefreshController {
        &self.controller
    }

    pub fn snapshot(&self) -> &SnapshotCache {
        &self.snapshot
    }

    /// Run one reconciliation cycle. Takes the bootstrap path when no
    /// snapshot exists yet; otherwise diffs against the probe listing.
    pub async fn refresh(&self) -> Result<RefreshOutcome, RefreshError> {
        let Some(_guard) = self.controller.begin() else {
            log::debug!("reconcile: run already in flight, trigger is a no-op");
            return Ok(RefreshOutcome::AlreadyRunning);
        };

        let current = self.snapshot.get()?;
        let bootstrapping = current.is_none();
        let markers = self.crm.list_deal_markers().await.map_err(|e| {
            if bootstrapping {
                RefreshError::Bootstrap(e)
            } else {
                RefreshError::Probe(e)
            }
        })?;

        match current {
            None => self.bootstrap(markers).await,
            Some(snapshot) => self.reconcile(snapshot.data, markers).await,
        }
    }

    /// First-ever fetch: no diffing, full detail for every listed deal.
    /// Partial results are kept; per-deal failures only shrink the snapshot.
    async fn bootstrap(&self, markers: Vec<DealMarker>) -> Result<RefreshOutcome, RefreshError> {
        log::info!("bootstrap: no snapshot yet, fetching {} deals in full", markers.len());

        let stage_labels = self.stage_labels().await;
        let ids: Vec<String> = markers.into_iter().map(|m| m.id).collect();
        let total = ids.len();
        let fetched = self.fetch_details(&ids, &stage_labels).await;

        let deals: Vec<Deal> = fetched.into_iter().flatten().collect();
        let failed = total - deals.len();
        if failed > 0 {
            log::warn!("bootstrap: {} of {} deals failed to fetch", failed, total);
        }

        self.sync_engagements(companies_of(&deals)).await?;
        self.snapshot.replace(&deals)?;

        Ok(RefreshOutcome::Bootstrapped {
            deals: deals.len(),
            failed,
        })
    }

    async fn reconcile(
        &self,
        cached: Vec<Deal>,
        markers: Vec<DealMarker>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let diff = partition_changes(&cached, &markers);
        if diff.is_empty() {
            log::info!(
                "reconcile: no upstream changes, snapshot of {} deals stands",
                cached.len()
            );
            return Ok(RefreshOutcome::Unchanged { deals: cached.len() });
        }

        log::info!(
            "reconcile: {} changed, {} deleted of {} live deals",
            diff.changed.len(),
            diff.deleted.len(),
            markers.len()
        );

        let stage_labels = self.stage_labels().await;
        let fetched = self.fetch_details(&diff.changed, &stage_labels).await;
        let fetched_count = fetched.iter().filter(|f| f.is_some()).count();

        let fresh_deals: Vec<&Deal> = fetched.iter().flatten().collect();
        let touched_companies = companies_of(&fresh_deals);

        // Merge: start from the cached collection, drop deleted ids, then
        // overwrite or append the successfully fetched deals. A failed fetch
        // keeps that deal's stale cached value (its old marker also stays,
        // so the next cycle retries it).
        let mut merged: Vec<Deal> = cached
            .into_iter()
            .filter(|d| !diff.deleted.contains(&d.id))
            .collect();
        let mut index: HashMap<String, usize> = merged
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();

        let mut failed = 0;
        for (deal_id, maybe) in diff.changed.iter().zip(fetched) {
            match maybe {
                Some(deal) => match index.get(&deal.id) {
                    Some(&i) => merged[i] = deal,
                    None => {
                        index.insert(deal.id.clone(), merged.len());
                        merged.push(deal);
                    }
                },
                None => {
                    failed += 1;
                    log::warn!(
                        "reconcile: detail fetch failed for deal {}, keeping cached entry",
                        deal_id
                    );
                }
            }
        }

        self.sync_engagements(touched_companies).await?;
        self.snapshot.replace(&merged)?;

        Ok(RefreshOutcome::Updated {
            deals: merged.len(),
            fetched: fetched_count,
            removed: diff.deleted.len(),
            failed,
        })
    }

    /// Batched detail fetches. A single deal's failure maps to `None` and
    /// never aborts its batch.
    async fn fetch_details(
        &self,
        ids: &[String],
        stage_labels: &HashMap<String, String>,
    ) -> Vec<Option<Deal>> {
        run_batched(
            ids.to_vec(),
            self.settings.batch_size,
            self.settings.batch_delay,
            |id| async move {
                match self.build_deal(&id, stage_labels).await {
                    Ok(deal) => Some(deal),
                    Err(e) => {
                        log::warn!("deal {}: detail fetch failed: {}", id, e);
                        None
                    }
                }
            },
        )
        .await
    }

    /// Fetch one deal and join its sub-entities. Join failures degrade the
    /// joined field to `None`; only the detail fetch itself can fail the deal.
    async fn build_deal(
        &self,
        deal_id: &str,
        stage_labels: &HashMap<String, String>,
    ) -> Result<Deal, CrmApiError> {
        let detail = self.crm.fetch_deal_detail(deal_id).await?;

        let company = match detail.company_id.as_deref() {
            Some(cid) => self.company_info(cid).await,
            None => None,
        };
        let contact = match detail.primary_contact_id.as_deref() {
            Some(pid) => self.contact_info(pid).await,
            None => None,
        };
        let last_meeting_at = match detail.company_id.as_deref() {
            Some(cid) => self.company_last_meeting(cid).await,
            None => None,
        };
        let days_in_stage = days_in_stage(&detail.stage_history, &detail.stage_id, Utc::now());

        Ok(Deal {
            stage_label: stage_labels
                .get(&detail.stage_id)
                .cloned()
                .unwrap_or_else(|| detail.stage_id.clone()),
            id: detail.id,
            name: detail.name,
            stage_id: detail.stage_id,
            amount: detail.amount,
            company_name: company.map(|c| c.name),
            company_id: detail.company_id,
            primary_contact_name: contact.map(|c| c.name),
            primary_contact_id: detail.primary_contact_id,
            days_in_stage,
            last_meeting_at,
            last_modified: detail.last_modified,
        })
    }

    /// Company join: TTL cache first, upstream on miss.
    async fn company_info(&self, company_id: &str) -> Option<CompanyInfo> {
        match self.companies.get(company_id, self.settings.sub_entity_ttl) {
            Ok(Some(company)) => return Some(company),
            Ok(None) => {}
            Err(e) => log::warn!("company cache read failed for {}: {}", company_id, e),
        }

        match self.crm.fetch_company(company_id).await {
            Ok(company) => {
                if let Err(e) = self.companies.set(company_id, &company) {
                    log::warn!("company cache write failed for {}: {}", company_id, e);
                }
                Some(company)
            }
            Err(e) => {
                log::warn!("company fetch failed for {}: {}", company_id, e);
                None
            }
        }
    }

    /// Contact join: TTL cache first, upstream on miss.
    async fn contact_info(&self, contact_id: &str) -> Option<ContactInfo> {
        match self.contacts.get(contact_id, self.settings.sub_entity_ttl) {
            Ok(Some(contact)) => return Some(contact),
            Ok(None) => {}
            Err(e) => log::warn!("contact cache read failed for {}: {}", contact_id, e),
        }

        match self.crm.fetch_contact(contact_id).await {
            Ok(contact) => {
                if let Err(e) = self.contacts.set(contact_id, &contact) {
                    log::warn!("contact cache write failed for {}: {}", contact_id, e);
                }
                Some(contact)
            }
            Err(e) => {
                log::warn!("contact fetch failed for {}: {}", contact_id, e);
                None
            }
        }
    }

    /// Meeting-recency join, guarded by the identity fingerprint: meeting
    /// detail is re-fetched only when the associated id set itself changed.
    async fn company_last_meeting(&self, company_id: &str) -> Option<String> {
        let ids = match self.crm.company_meeting_ids(company_id).await {
            Ok(ids) => MeetingIdentityCache::canonical_ids(ids),
            Err(e) => {
                log::warn!("meeting listing failed for company {}: {}", company_id, e);
                return None;
            }
        };

        match self.identity.lookup(company_id, &ids) {
            Ok(IdentityLookup::Hit(cached)) => return cached,
            Ok(IdentityLookup::Miss) => {}
            Err(e) => log::warn!("identity cache read failed for {}: {}", company_id, e),
        }

        // Identity changed: derive the recency from every meeting in the new
        // set. Failed or undated meetings are excluded from the max.
        let metas = run_batched(
            ids.clone(),
            self.settings.batch_size,
            self.settings.batch_delay,
            |meeting_id| async move {
                match self.crm.fetch_meeting(&meeting_id).await {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        log::warn!("meeting {} fetch failed: {}", meeting_id, e);
                        None
                    }
                }
            },
        )
        .await;

        let last_meeting_at = metas
            .iter()
            .flatten()
            .filter_map(|m| m.occurred_at.as_deref())
            .filter_map(parse_timestamp)
            .max()
            .map(|dt| dt.to_rfc3339());

        if let Err(e) = self
            .identity
            .store(company_id, &ids, last_meeting_at.as_deref())
        {
            log::warn!("identity cache write failed for {}: {}", company_id, e);
        }

        last_meeting_at
    }

    /// Stage taxonomy as an id -> label map. Degrades to raw stage ids when
    /// neither cache nor upstream can supply labels.
    async fn stage_labels(&self) -> HashMap<String, String> {
        match self.stages.get(SINGLETON_KEY, self.settings.stage_ttl) {
            Ok(Some(stages)) => return label_map(&stages),
            Ok(None) => {}
            Err(e) => log::warn!("stage cache read failed: {}", e),
        }

        match self.crm.fetch_stages().await {
            Ok(stages) => {
                if let Err(e) = self.stages.set(SINGLETON_KEY, &stages) {
                    log::warn!("stage cache write failed: {}", e);
                }
                label_map(&stages)
            }
            Err(e) => {
                log::warn!("stage taxonomy fetch failed: {}", e);
                HashMap::new()
            }
        }
    }

    /// Pull the latest engagements for the touched companies into the log so
    /// the suggestion gate's aggregate stays current. Upstream failures are
    /// per-company and non-fatal; a backing failure fails the pass.
    async fn sync_engagements(&self, company_ids: Vec<String>) -> Result<(), RefreshError> {
        if company_ids.is_empty() {
            return Ok(());
        }

        let page_size = self.settings.engagement_page_size;
        let listed = run_batched(
            company_ids,
            self.settings.batch_size,
            self.settings.batch_delay,
            |company_id| async move {
                match self.crm.list_engagements(&company_id, page_size).await {
                    Ok(records) => Some((company_id, records)),
                    Err(e) => {
                        log::warn!("engagement listing failed for company {}: {}", company_id, e);
                        None
                    }
                }
            },
        )
        .await;

        for (company_id, records) in listed.into_iter().flatten() {
            log::debug!("engagements: {} rows for company {}", records.len(), company_id);
            for record in &records {
                self.backing.upsert_engagement(record)?;
            }
        }
        Ok(())
    }
}

fn label_map(stages: &[StageInfo]) -> HashMap<String, String> {
    stages
        .iter()
        .map(|s| (s.id.clone(), s.label.clone()))
        .collect()
}

fn companies_of<D: std::borrow::Borrow<Deal>>(deals: &[D]) -> Vec<String> {
    deals
        .iter()
        .filter_map(|d| d.borrow().company_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
