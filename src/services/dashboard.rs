//! Dashboard-facing operations over the pipeline mirror.
//!
//! The read path always prefers partial results: once any snapshot exists,
//! a dashboard request is served from it and upstream trouble only shows up
//! in the logs. Only the first-ever request, with nothing cached at all,
//! surfaces a bootstrap error to the caller.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::{CacheBacking, SnapshotCache};
use crate::config::Config;
use crate::error::ServiceError;
use crate::reconcile::{PipelineRefresher, RefreshOutcome};
use crate::suggestions::{SuggestionGenerator, SuggestionService};
use crate::types::{Deal, RefreshRecord, RefreshTrigger, SuggestionRecord};
use crate::util::now_rfc3339;

/// Refresh runs kept for diagnostics.
const MAX_REFRESH_HISTORY: usize = 50;

/// What a dashboard request receives.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineView {
    pub deals: Vec<Deal>,
    pub last_fetched: String,
    /// Whether a background reconciliation is currently in flight.
    pub refreshing: bool,
}

pub struct DashboardService {
    refresher: Arc<PipelineRefresher>,
    snapshot: SnapshotCache,
    suggestions: SuggestionService,
    snapshot_max_age: chrono::Duration,
    history: Arc<RwLock<Vec<RefreshRecord>>>,
}

impl DashboardService {
    pub fn new(
        refresher: Arc<PipelineRefresher>,
        backing: Arc<dyn CacheBacking>,
        generator: Arc<dyn SuggestionGenerator>,
        config: &Config,
    ) -> Self {
        Self {
            refresher,
            snapshot: SnapshotCache::new(backing.clone()),
            suggestions: SuggestionService::new(backing, generator, config.engagement_page_size),
            snapshot_max_age: config.snapshot_max_age(),
            history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Serve the pipeline. A fresh-enough snapshot is returned as-is; a
    /// stale one is returned immediately while a background reconciliation
    /// is kicked off (a duplicate trigger is a no-op). With no snapshot at
    /// all, the bootstrap runs inline and its error surfaces.
    pub async fn pipeline(&self) -> Result<PipelineView, ServiceError> {
        if let Some(snapshot) = self.snapshot.get()? {
            let stale = snapshot.age() > self.snapshot_max_age;
            if stale {
                log::info!(
                    "pipeline: snapshot is {}m old, triggering background refresh",
                    snapshot.age().num_minutes()
                );
                self.spawn_background_refresh(RefreshTrigger::Request);
            }
            return Ok(PipelineView {
                deals: snapshot.data,
                last_fetched: snapshot.last_fetched.to_rfc3339(),
                refreshing: self.refresher.controller().is_running(),
            });
        }

        // First-ever request: bootstrap inline, loudly.
        self.run_recorded_refresh(RefreshTrigger::Bootstrap).await?;
        let snapshot = self.snapshot.get()?.ok_or(ServiceError::NoSnapshot)?;
        Ok(PipelineView {
            deals: snapshot.data,
            last_fetched: snapshot.last_fetched.to_rfc3339(),
            refreshing: false,
        })
    }

    /// Explicit refresh. Unlike the background path, failures are returned
    /// to the caller.
    pub async fn refresh_now(&self, trigger: RefreshTrigger) -> Result<RefreshOutcome, ServiceError> {
        self.run_recorded_refresh(trigger).await
    }

    /// Stored suggestion for one deal, regenerated only when the gate allows.
    pub async fn suggestion_for_deal(
        &self,
        deal_id: &str,
        force_refresh: bool,
    ) -> Result<SuggestionRecord, ServiceError> {
        let snapshot = self.snapshot.get()?.ok_or(ServiceError::NoSnapshot)?;
        let deal = snapshot
            .data
            .iter()
            .find(|d| d.id == deal_id)
            .ok_or_else(|| ServiceError::UnknownDeal(deal_id.to_string()))?;
        Ok(self.suggestions.suggestion_for(deal, force_refresh).await?)
    }

    /// Recent refresh runs, most recent first.
    pub fn refresh_history(&self) -> Vec<RefreshRecord> {
        self.history.read().clone()
    }

    fn spawn_background_refresh(&self, trigger: RefreshTrigger) {
        let refresher = self.refresher.clone();
        let history = self.history.clone();
        tokio::spawn(async move {
            match Self::record_run(&refresher, &history, trigger).await {
                Ok(RefreshOutcome::AlreadyRunning) => {}
                Ok(outcome) => log::info!("background refresh finished: {:?}", outcome),
                // Background failures never reach the dashboard; the next
                // trigger retries.
                Err(e) => log::warn!("background refresh failed: {}", e),
            }
        });
    }

    async fn run_recorded_refresh(
        &self,
        trigger: RefreshTrigger,
    ) -> Result<RefreshOutcome, ServiceError> {
        Ok(Self::record_run(&self.refresher, &self.history, trigger).await?)
    }

    /// Run a refresh and append a diagnostic record, except for no-op
    /// triggers that found a run already in flight.
    async fn record_run(
        refresher: &Arc<PipelineRefresher>,
        history: &Arc<RwLock<Vec<RefreshRecord>>>,
        trigger: RefreshTrigger,
    ) -> Result<RefreshOutcome, crate::error::RefreshError> {
        let started_at = now_rfc3339();
        let result = refresher.refresh().await;

        if matches!(result, Ok(RefreshOutcome::AlreadyRunning)) {
            return result;
        }

        let mut record = RefreshRecord {
            id: uuid::Uuid::new_v4().to_string(),
            trigger,
            started_at,
            finished_at: Some(Utc::now().to_rfc3339()),
            deals_fetched: 0,
            deals_removed: 0,
            success: false,
            error: None,
        };
        match &result {
            Ok(RefreshOutcome::Unchanged { .. }) => {
                record.success = true;
            }
            Ok(RefreshOutcome::Updated { fetched, removed, .. }) => {
                record.success = true;
                record.deals_fetched = *fetched;
                record.deals_removed = *removed;
            }
            Ok(RefreshOutcome::Bootstrapped { deals, .. }) => {
                record.success = true;
                record.deals_fetched = *deals;
            }
            Ok(RefreshOutcome::AlreadyRunning) => unreachable!(),
            Err(e) => {
                record.error = Some(e.to_string());
            }
        }

        let mut guard = history.write();
        guard.insert(0, record);
        if guard.len() > MAX_REFRESH_HISTORY {
            guard.truncate(MAX_REFRESH_HISTORY);
        }
        drop(guard);

        result
    }
}

// ============================================================================
// Tests
// ============================================================================
