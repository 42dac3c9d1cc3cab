//! Native CRM REST client.
//!
//! The dashboard core never talks HTTP directly: it depends on the `CrmApi`
//! capability, so tests can script upstream responses and count calls, and
//! the HTTP implementation stays swappable per vendor.
//!
//! Modules:
//! - objects: typed fetchers over the generic REST surface

pub mod objects;

pub use objects::{DealDetail, DealMarker, HttpCrmClient, MeetingInfo};

use std::time::Duration;

use async_trait::async_trait;

use crate::types::{CompanyInfo, ContactInfo, EngagementRecord, StageInfo};

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CrmApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Token expired or revoked")]
    AuthExpired,
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid base URL '{0}': {1}")]
    InvalidBaseUrl(String, url::ParseError),
}

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    Retryable,
    NonRetryable,
}

fn retry_decision_for_status(status: reqwest::StatusCode) -> RetryDecision {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RetryDecision::Retryable
    } else {
        RetryDecision::NonRetryable
    }
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    // A Retry-After header from the rate limiter overrides the backoff curve.
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

pub(crate) async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, CrmApiError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(CrmApiError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                let decision = retry_decision_for_status(status);
                if decision == RetryDecision::Retryable && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "crm retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable_transport = err.is_timeout() || err.is_connect();
                if retryable_transport && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "crm retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(CrmApiError::Http(err));
            }
        }
    }

    Err(CrmApiError::ApiError {
        status: 0,
        message: "request exhausted retries".to_string(),
    })
}

// ============================================================================
// Capability trait
// ============================================================================

/// The upstream surface the reconciler and suggestion layer consume.
///
/// `list_deal_markers` is the cheap change-detection probe; everything else
/// is a detail fetch and the unit of work the batch scheduler paces.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// Cheap listing of every live deal: id plus modification marker only.
    async fn list_deal_markers(&self) -> Result<Vec<DealMarker>, CrmApiError>;

    /// Full detail for one deal, including its stage-change history and
    /// association ids.
    async fn fetch_deal_detail(&self, deal_id: &str) -> Result<DealDetail, CrmApiError>;

    async fn fetch_company(&self, company_id: &str) -> Result<CompanyInfo, CrmApiError>;

    async fn fetch_contact(&self, contact_id: &str) -> Result<ContactInfo, CrmApiError>;

    /// The pipeline-stage taxonomy.
    async fn fetch_stages(&self) -> Result<Vec<StageInfo>, CrmApiError>;

    /// Ids of the meetings associated with a company (unsorted).
    async fn company_meeting_ids(&self, company_id: &str) -> Result<Vec<String>, CrmApiError>;

    async fn fetch_meeting(&self, meeting_id: &str) -> Result<MeetingInfo, CrmApiError>;

    /// Most recent engagements for a company, newest first.
    async fn list_engagements(
        &self,
        company_id: &str,
        limit: usize,
    ) -> Result<Vec<EngagementRecord>, CrmApiError>;
}

// =============================================================================
// Shared test utilities
// =============================================================================

#[cfg(test)]
pub mod test_utils {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::objects::{DealDetail, DealMarker, MeetingInfo};
    use super::{CrmApi, CrmApiError};
    use crate::types::{CompanyInfo, ContactInfo, EngagementRecord, StageInfo};

    fn not_found(what: &str, id: &str) -> CrmApiError {
        CrmApiError::ApiError {
            status: 404,
            message: format!("{what} {id} not found"),
        }
    }

    /// Scriptable in-memory upstream with per-endpoint call counters.
    #[derive(Default)]
    pub struct MockCrm {
        pub markers: Mutex<Vec<DealMarker>>,
        pub details: Mutex<HashMap<String, DealDetail>>,
        pub companies: Mutex<HashMap<String, CompanyInfo>>,
        pub contacts: Mutex<HashMap<String, ContactInfo>>,
        pub stages: Mutex<Vec<StageInfo>>,
        pub company_meetings: Mutex<HashMap<String, Vec<String>>>,
        pub meetings: Mutex<HashMap<String, MeetingInfo>>,
        pub engagements: Mutex<HashMap<String, Vec<EngagementRecord>>>,

        pub fail_probe: Mutex<bool>,
        pub failing_details: Mutex<HashSet<String>>,

        pub probe_calls: AtomicUsize,
        pub detail_calls: AtomicUsize,
        pub detail_ids: Mutex<Vec<String>>,
        pub meeting_calls: AtomicUsize,
        pub engagement_calls: AtomicUsize,
    }

    impl MockCrm {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a deal with both its probe marker and its detail.
        pub fn add_deal(&self, detail: DealDetail) {
            self.markers.lock().push(DealMarker {
                id: detail.id.clone(),
                last_modified: detail.last_modified.clone(),
            });
            self.details.lock().insert(detail.id.clone(), detail);
        }

        /// Change a deal's marker (and detail) as if upstream edited it.
        pub fn touch_deal(&self, deal_id: &str, new_marker: &str) {
            if let Some(marker) = self.markers.lock().iter_mut().find(|m| m.id == deal_id) {
                marker.last_modified = new_marker.to_string();
            }
            if let Some(detail) = self.details.lock().get_mut(deal_id) {
                detail.last_modified = new_marker.to_string();
            }
        }

        /// Remove a deal from the live listing entirely.
        pub fn remove_deal(&self, deal_id: &str) {
            self.markers.lock().retain(|m| m.id != deal_id);
            self.details.lock().remove(deal_id);
        }

        pub fn detail_call_count(&self) -> usize {
            self.detail_calls.load(Ordering::SeqCst)
        }

        pub fn meeting_call_count(&self) -> usize {
            self.meeting_calls.load(Ordering::SeqCst)
        }

        pub fn fetched_detail_ids(&self) -> Vec<String> {
            self.detail_ids.lock().clone()
        }
    }

    #[async_trait]
    impl CrmApi for MockCrm {
        async fn list_deal_markers(&self) -> Result<Vec<DealMarker>, CrmApiError> {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail_probe.lock() {
                return Err(CrmApiError::ApiError {
                    status: 503,
                    message: "listing unavailable".to_string(),
                });
            }
            Ok(self.markers.lock().clone())
        }

        async fn fetch_deal_detail(&self, deal_id: &str) -> Result<DealDetail, CrmApiError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            self.detail_ids.lock().push(deal_id.to_string());
            if self.failing_details.lock().contains(deal_id) {
                return Err(CrmApiError::ApiError {
                    status: 500,
                    message: format!("detail fetch for {deal_id} exploded"),
                });
            }
            self.details
                .lock()
                .get(deal_id)
                .cloned()
                .ok_or_else(|| not_found("deal", deal_id))
        }

        async fn fetch_company(&self, company_id: &str) -> Result<CompanyInfo, CrmApiError> {
            self.companies
                .lock()
                .get(company_id)
                .cloned()
                .ok_or_else(|| not_found("company", company_id))
        }

        async fn fetch_contact(&self, contact_id: &str) -> Result<ContactInfo, CrmApiError> {
            self.contacts
                .lock()
                .get(contact_id)
                .cloned()
                .ok_or_else(|| not_found("contact", contact_id))
        }

        async fn fetch_stages(&self) -> Result<Vec<StageInfo>, CrmApiError> {
            Ok(self.stages.lock().clone())
        }

        async fn company_meeting_ids(&self, company_id: &str) -> Result<Vec<String>, CrmApiError> {
            Ok(self
                .company_meetings
                .lock()
                .get(company_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_meeting(&self, meeting_id: &str) -> Result<MeetingInfo, CrmApiError> {
            self.meeting_calls.fetch_add(1, Ordering::SeqCst);
            self.meetings
                .lock()
                .get(meeting_id)
                .cloned()
                .ok_or_else(|| not_found("meeting", meeting_id))
        }

        async fn list_engagements(
            &self,
            company_id: &str,
            limit: usize,
        ) -> Result<Vec<EngagementRecord>, CrmApiError> {
            self.engagement_calls.fetch_add(1, Ordering::SeqCst);
            let mut rows = self
                .engagements
                .lock()
                .get(company_id)
                .cloned()
                .unwrap_or_default();
            rows.truncate(limit);
            Ok(rows)
        }
    }
}
