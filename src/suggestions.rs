//! Next-step suggestion records and the regeneration gate.
//!
//! The generator is an external, slow, expensive capability. The gate in
//! front of it compares the stored generation-time engagement timestamp
//! against the company's current latest engagement timestamp (a cheap
//! aggregate on the engagement log, not an upstream fetch) and only lets a
//! regeneration through when something newer exists.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::cache::{CacheBacking, CacheError};
use crate::types::{Deal, EngagementRecord, SuggestionRecord};
use crate::util::{now_rfc3339, parse_timestamp};

/// Served when the generator fails or is not configured. A deal's other
/// data is never blocked by a suggestion failure.
pub const FALLBACK_SUGGESTION: &str =
    "No suggestion available right now. Review the latest activity and follow up directly.";

#[derive(Debug, thiserror::Error)]
pub enum SuggestionError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("generator error {status}: {message}")]
    Generator { status: u16, message: String },
    #[error("generator endpoint not configured")]
    NotConfigured,
}

/// The opaque suggestion capability. Must be called at most once per
/// regeneration decision.
#[async_trait]
pub trait SuggestionGenerator: Send + Sync {
    /// Produce a short "next step" recommendation from recent activity.
    async fn generate(
        &self,
        history: &[EngagementRecord],
        entity_label: &str,
    ) -> Result<String, SuggestionError>;
}

// ============================================================================
// HTTP generator
// ============================================================================

/// POSTs the activity digest to a configured endpoint.
pub struct HttpSuggestionGenerator {
    http: reqwest::Client,
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeneratorResponse {
    text: String,
}

impl HttpSuggestionGenerator {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl SuggestionGenerator for HttpSuggestionGenerator {
    async fn generate(
        &self,
        history: &[EngagementRecord],
        entity_label: &str,
    ) -> Result<String, SuggestionError> {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return Err(SuggestionError::NotConfigured);
        };

        let activity: Vec<serde_json::Value> = history
            .iter()
            .map(|r| {
                json!({
                    "kind": r.kind.as_str(),
                    "direction": r.direction.as_str(),
                    "occurredAt": r.occurred_at,
                    "subject": r.subject,
                    "preview": r.preview,
                })
            })
            .collect();

        let resp = self
            .http
            .post(endpoint)
            .json(&json!({ "entityLabel": entity_label, "activity": activity }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SuggestionError::Generator {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: GeneratorResponse = resp.json().await.map_err(SuggestionError::Http)?;
        Ok(body.text)
    }
}

// ============================================================================
// Gate + service
// ============================================================================

/// True when `current` is strictly newer than `stored`.
fn engagement_is_newer(current: Option<&str>, stored: Option<&str>) -> bool {
    match (
        current.and_then(parse_timestamp),
        stored.and_then(parse_timestamp),
    ) {
        // No current engagement at all: nothing new happened.
        (None, _) => false,
        // Engagements exist but the record predates engagement tracking.
        (Some(_), None) => true,
        (Some(current), Some(stored)) => current > stored,
    }
}

pub struct SuggestionService {
    backing: Arc<dyn CacheBacking>,
    generator: Arc<dyn SuggestionGenerator>,
    history_limit: usize,
}

impl SuggestionService {
    pub fn new(
        backing: Arc<dyn CacheBacking>,
        generator: Arc<dyn SuggestionGenerator>,
        history_limit: usize,
    ) -> Self {
        Self {
            backing,
            generator,
            history_limit,
        }
    }

    /// The cache gate. True when forced, when no record exists, or when an
    /// engagement newer than the record's generation-time timestamp exists.
    pub fn should_regenerate(
        &self,
        deal_id: &str,
        company_id: &str,
        force_refresh: bool,
    ) -> Result<bool, CacheError> {
        if force_refresh {
            return Ok(true);
        }
        let Some(record) = self.backing.get_suggestion(deal_id)? else {
            return Ok(true);
        };
        let current = self.backing.latest_engagement_at(company_id)?;
        Ok(engagement_is_newer(
            current.as_deref(),
            record.last_engagement_at_generation.as_deref(),
        ))
    }

    /// Serve the stored suggestion, regenerating first when the gate says
    /// the communication history moved on. Generator failure degrades to the
    /// fixed sentinel text instead of erroring.
    pub async fn suggestion_for(
        &self,
        deal: &Deal,
        force_refresh: bool,
    ) -> Result<SuggestionRecord, CacheError> {
        let company_id = deal.company_id.clone().unwrap_or_default();

        if !self.should_regenerate(&deal.id, &company_id, force_refresh)? {
            if let Some(existing) = self.backing.get_suggestion(&deal.id)? {
                log::debug!("suggestion for deal {} is current, serving cached", deal.id);
                return Ok(existing);
            }
        }

        // Pin the aggregate before generating: if a new engagement lands
        // during the (slow) generator call, the next gate check regenerates.
        let current = self.backing.latest_engagement_at(&company_id)?;
        let history = self.backing.engagements_for(&company_id, self.history_limit)?;

        let text = match self.generator.generate(&history, &deal.name).await {
            Ok(text) => text,
            Err(e) => {
                log::warn!("suggestion generation failed for deal {}: {}", deal.id, e);
                FALLBACK_SUGGESTION.to_string()
            }
        };

        let now = now_rfc3339();
        let record = SuggestionRecord {
            deal_id: deal.id.clone(),
            company_id,
            text,
            last_engagement_at_generation: current,
            generated_at: now.clone(),
            updated_at: now,
        };
        self.backing.put_suggestion(&record)?;
        Ok(record)
    }
}

// ============================================================================
// Tests
// ============================================================================
