//! Typed fetchers over the CRM's generic object REST surface.
//!
//! The wire shape is a paged collection endpoint with field selection
//! (`properties` query parameter, `after` cursor) plus single-object GETs
//! that can include per-property change history. Raw response structs are
//! kept separate from the normalized types the rest of the crate consumes;
//! all timestamps are normalized to UTC RFC 3339 at this boundary.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use super::{send_with_retry, CrmApi, CrmApiError, RetryPolicy};
use crate::types::{
    CompanyInfo, ContactInfo, Direction, EngagementKind, EngagementRecord, StageInfo,
    StageTransition,
};
use crate::util::parse_timestamp;

const PAGE_LIMIT: &str = "100";

// ============================================================================
// API response types (deserialized from CRM JSON)
// ============================================================================

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    results: Vec<ObjectRaw>,
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<PagingNext>,
}

#[derive(Debug, Deserialize)]
struct PagingNext {
    after: String,
}

#[derive(Debug, Deserialize)]
struct ObjectRaw {
    #[serde(default)]
    id: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectDetailRaw {
    #[serde(default)]
    id: String,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    properties_with_history: std::collections::HashMap<String, Vec<HistoryEntryRaw>>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntryRaw {
    #[serde(default)]
    value: String,
    #[serde(default)]
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct StagesResponse {
    #[serde(default)]
    results: Vec<StageRaw>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageRaw {
    #[serde(default)]
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    display_order: i64,
}

// ============================================================================
// Public types
// ============================================================================

/// One row of the cheap change-detection probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealMarker {
    pub id: String,
    /// Opaque modification marker, compared verbatim.
    pub last_modified: String,
}

/// Full detail for one deal as fetched from upstream, before joins.
#[derive(Debug, Clone)]
pub struct DealDetail {
    pub id: String,
    pub name: String,
    pub stage_id: String,
    pub amount: Option<f64>,
    pub company_id: Option<String>,
    pub primary_contact_id: Option<String>,
    pub last_modified: String,
    /// Stage-change history, used for stage-duration derivation.
    pub stage_history: Vec<StageTransition>,
}

/// A meeting as needed for recency derivation.
#[derive(Debug, Clone)]
pub struct MeetingInfo {
    pub id: String,
    pub title: Option<String>,
    pub occurred_at: Option<String>,
}

// ============================================================================
// Property helpers
// ============================================================================

fn prop_str(props: &Map<String, Value>, key: &str) -> Option<String> {
    props
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

fn prop_f64(props: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = props.get(key)?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Normalize an upstream timestamp to UTC RFC 3339 so string ordering
/// matches chronological ordering in the cache. Unparseable input is kept
/// verbatim (markers are compared verbatim anyway).
fn normalize_ts(s: &str) -> String {
    parse_timestamp(s)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| s.to_string())
}

// ============================================================================
// HTTP client
// ============================================================================

/// reqwest-backed `CrmApi` against a configurable REST base URL.
pub struct HttpCrmClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    policy: RetryPolicy,
}

impl HttpCrmClient {
    pub fn new(base_url: &str, token: String) -> Result<Self, CrmApiError> {
        // A trailing slash makes Url::join treat the base as a directory.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| CrmApiError::InvalidBaseUrl(base_url.to_string(), e))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token,
            policy: RetryPolicy::default(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T, CrmApiError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| CrmApiError::InvalidBaseUrl(path.to_string(), e))?;
        let request = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .query(query);

        let resp = send_with_retry(request, &self.policy).await?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CrmApiError::AuthExpired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CrmApiError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(resp.json().await?)
    }

    /// Fetch every page of a collection endpoint.
    async fn list_paged(
        &self,
        path: &str,
        base_query: &[(String, String)],
    ) -> Result<Vec<ObjectRaw>, CrmApiError> {
        let mut all = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut query: Vec<(String, String)> = base_query.to_vec();
            query.push(("limit".to_string(), PAGE_LIMIT.to_string()));
            if let Some(ref cursor) = after {
                query.push(("after".to_string(), cursor.clone()));
            }

            let page: ListResponse = self.get_json(path, &query).await?;
            all.extend(page.results);

            after = page.paging.and_then(|p| p.next).map(|n| n.after);
            if after.is_none() {
                break;
            }
        }

        Ok(all)
    }
}

fn detail_from_raw(raw: ObjectDetailRaw) -> DealDetail {
    let stage_history = raw
        .properties_with_history
        .get("stageId")
        .map(|entries| {
            entries
                .iter()
                .filter(|e| !e.value.is_empty() && !e.timestamp.is_empty())
                .map(|e| StageTransition {
                    stage_id: e.value.clone(),
                    occurred_at: normalize_ts(&e.timestamp),
                })
                .collect()
        })
        .unwrap_or_default();

    let props = &raw.properties;
    DealDetail {
        name: prop_str(props, "name").unwrap_or_else(|| "(unnamed deal)".to_string()),
        stage_id: prop_str(props, "stageId").unwrap_or_default(),
        amount: prop_f64(props, "amount"),
        company_id: prop_str(props, "companyId"),
        primary_contact_id: prop_str(props, "primaryContactId"),
        last_modified: prop_str(props, "lastModified")
            .map(|s| normalize_ts(&s))
            .unwrap_or_default(),
        stage_history,
        id: raw.id,
    }
}

fn engagement_from_raw(raw: &ObjectRaw, company_id: &str) -> Option<EngagementRecord> {
    let props = &raw.properties;
    if raw.id.is_empty() {
        return None;
    }

    let kind_str = prop_str(props, "kind")?;
    let Some(kind) = EngagementKind::parse(&kind_str) else {
        log::debug!("skipping engagement {} with unknown kind '{}'", raw.id, kind_str);
        return None;
    };

    // Records without a parseable timestamp cannot participate in recency
    // aggregates; skip them rather than poison the string-ordered log.
    let occurred_raw = prop_str(props, "occurredAt")?;
    let occurred_at = parse_timestamp(&occurred_raw)?.to_rfc3339();

    let direction = prop_str(props, "direction")
        .and_then(|d| Direction::parse(&d))
        .unwrap_or(match kind {
            EngagementKind::InboundEmail => Direction::Inbound,
            EngagementKind::OutboundEmail => Direction::Outbound,
            _ => Direction::None,
        });

    Some(EngagementRecord {
        id: raw.id.clone(),
        company_id: company_id.to_string(),
        kind,
        direction,
        occurred_at,
        subject: prop_str(props, "subject"),
        preview: prop_str(props, "preview"),
        participants: prop_str(props, "participants"),
    })
}

#[async_trait]
impl CrmApi for HttpCrmClient {
    async fn list_deal_markers(&self) -> Result<Vec<DealMarker>, CrmApiError> {
        let query = vec![("properties".to_string(), "lastModified".to_string())];
        let rows = self.list_paged("objects/deals", &query).await?;

        let mut markers = Vec::with_capacity(rows.len());
        for row in rows {
            if row.id.is_empty() {
                continue;
            }
            let Some(last_modified) = prop_str(&row.properties, "lastModified") else {
                log::warn!("deal {} has no modification marker, skipping probe row", row.id);
                continue;
            };
            markers.push(DealMarker {
                id: row.id,
                last_modified: normalize_ts(&last_modified),
            });
        }
        Ok(markers)
    }

    async fn fetch_deal_detail(&self, deal_id: &str) -> Result<DealDetail, CrmApiError> {
        let query = vec![
            (
                "properties".to_string(),
                "name,stageId,amount,companyId,primaryContactId,lastModified".to_string(),
            ),
            ("propertiesWithHistory".to_string(), "stageId".to_string()),
        ];
        let raw: ObjectDetailRaw = self
            .get_json(&format!("objects/deals/{deal_id}"), &query)
            .await?;
        Ok(detail_from_raw(raw))
    }

    async fn fetch_company(&self, company_id: &str) -> Result<CompanyInfo, CrmApiError> {
        let query = vec![("properties".to_string(), "name,domain".to_string())];
        let raw: ObjectRaw = self
            .get_json(&format!("objects/companies/{company_id}"), &query)
            .await?;
        Ok(CompanyInfo {
            name: prop_str(&raw.properties, "name").unwrap_or_else(|| raw.id.clone()),
            domain: prop_str(&raw.properties, "domain"),
            id: raw.id,
        })
    }

    async fn fetch_contact(&self, contact_id: &str) -> Result<ContactInfo, CrmApiError> {
        let query = vec![("properties".to_string(), "name,email".to_string())];
        let raw: ObjectRaw = self
            .get_json(&format!("objects/contacts/{contact_id}"), &query)
            .await?;
        Ok(ContactInfo {
            name: prop_str(&raw.properties, "name").unwrap_or_else(|| raw.id.clone()),
            email: prop_str(&raw.properties, "email"),
            id: raw.id,
        })
    }

    async fn fetch_stages(&self) -> Result<Vec<StageInfo>, CrmApiError> {
        let resp: StagesResponse = self.get_json("pipeline/stages", &[]).await?;
        let mut stages: Vec<StageInfo> = resp
            .results
            .into_iter()
            .filter(|s| !s.id.is_empty())
            .map(|s| StageInfo {
                label: if s.label.is_empty() { s.id.clone() } else { s.label },
                id: s.id,
                display_order: s.display_order,
            })
            .collect();
        stages.sort_by_key(|s| s.display_order);
        Ok(stages)
    }

    async fn company_meeting_ids(&self, company_id: &str) -> Result<Vec<String>, CrmApiError> {
        let rows = self
            .list_paged(&format!("objects/companies/{company_id}/associations/meetings"), &[])
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| r.id)
            .filter(|id| !id.is_empty())
            .collect())
    }

    async fn fetch_meeting(&self, meeting_id: &str) -> Result<MeetingInfo, CrmApiError> {
        let query = vec![("properties".to_string(), "title,occurredAt".to_string())];
        let raw: ObjectRaw = self
            .get_json(&format!("objects/meetings/{meeting_id}"), &query)
            .await?;
        Ok(MeetingInfo {
            title: prop_str(&raw.properties, "title"),
            occurred_at: prop_str(&raw.properties, "occurredAt").map(|s| normalize_ts(&s)),
            id: raw.id,
        })
    }

    async fn list_engagements(
        &self,
        company_id: &str,
        limit: usize,
    ) -> Result<Vec<EngagementRecord>, CrmApiError> {
        // Single newest-first page per cycle; historical backfill is not
        // this client's job.
        let query = vec![
            ("companyId".to_string(), company_id.to_string()),
            (
                "properties".to_string(),
                "kind,direction,occurredAt,subject,preview,participants".to_string(),
            ),
            ("sort".to_string(), "-occurredAt".to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let resp: ListResponse = self.get_json("objects/engagements", &query).await?;
        Ok(resp
            .results
            .iter()
            .filter_map(|raw| engagement_from_raw(raw, company_id))
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_response_deserialization() {
        let json = r#"{
            "results": [
                {
                    "id": "deal-1",
                    "properties": {"lastModified": "2026-03-01T10:00:00Z"}
                },
                {
                    "id": "deal-2",
                    "properties": {"lastModified": "2026-03-02T08:30:00Z"}
                }
            ],
            "paging": {"next": {"after": "cursor-3"}}
        }"#;

        let resp: ListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.results.len(), 2);
        assert_eq!(resp.results[0].id, "deal-1");
        assert_eq!(
            resp.paging.unwrap().next.unwrap().after,
            "cursor-3"
        );
    }

    #[test]
    fn test_list_response_without_paging() {
        let resp: ListResponse = serde_json::from_str(r#"{"results": []}"#).unwrap();
        assert!(resp.results.is_empty());
        assert!(resp.paging.is_none());
    }

    #[test]
    fn test_detail_from_raw_maps_properties_and_history() {
        let json = r#"{
            "id": "deal-9",
            "properties": {
                "name": "Acme expansion",
                "stageId": "negotiation",
                "amount": "42000.50",
                "companyId": "c-1",
                "lastModified": "2026-03-01T10:00:00Z"
            },
            "propertiesWithHistory": {
                "stageId": [
                    {"value": "discovery", "timestamp": "2026-01-10T09:00:00Z"},
                    {"value": "negotiation", "timestamp": "2026-02-20T16:00:00Z"}
                ]
            }
        }"#;

        let raw: ObjectDetailRaw = serde_json::from_str(json).unwrap();
        let detail = detail_from_raw(raw);

        assert_eq!(detail.id, "deal-9");
        assert_eq!(detail.name, "Acme expansion");
        assert_eq!(detail.stage_id, "negotiation");
        assert_eq!(detail.amount, Some(42000.50));
        assert_eq!(detail.company_id.as_deref(), Some("c-1"));
        assert!(detail.primary_contact_id.is_none());
        assert_eq!(detail.stage_history.len(), 2);
        assert_eq!(detail.stage_history[1].stage_id, "negotiation");
        // Normalized to an explicit UTC offset
        assert_eq!(detail.stage_history[1].occurred_at, "2026-02-20T16:00:00+00:00");
    }

    #[test]
    fn test_detail_without_history_or_name() {
        let raw: ObjectDetailRaw =
            serde_json::from_str(r#"{"id": "deal-0", "properties": {}}"#).unwrap();
        let detail = detail_from_raw(raw);
        assert_eq!(detail.name, "(unnamed deal)");
        assert!(detail.stage_history.is_empty());
    }

    #[test]
    fn test_engagement_from_raw_derives_direction_from_kind() {
        let raw: ObjectRaw = serde_json::from_str(
            r#"{
                "id": "e-1",
                "properties": {
                    "kind": "inbound_email",
                    "occurredAt": "2026-03-01T10:00:00Z",
                    "subject": "Re: pricing"
                }
            }"#,
        )
        .unwrap();

        let record = engagement_from_raw(&raw, "c-1").unwrap();
        assert_eq!(record.kind, EngagementKind::InboundEmail);
        assert_eq!(record.direction, Direction::Inbound);
        assert_eq!(record.company_id, "c-1");
        assert_eq!(record.occurred_at, "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_engagement_from_raw_skips_unparseable_timestamp() {
        let raw: ObjectRaw = serde_json::from_str(
            r#"{
                "id": "e-2",
                "properties": {"kind": "note", "occurredAt": "whenever"}
            }"#,
        )
        .unwrap();
        assert!(engagement_from_raw(&raw, "c-1").is_none());
    }

    #[test]
    fn test_engagement_from_raw_skips_unknown_kind() {
        let raw: ObjectRaw = serde_json::from_str(
            r#"{
                "id": "e-3",
                "properties": {"kind": "fax", "occurredAt": "2026-03-01T10:00:00Z"}
            }"#,
        )
        .unwrap();
        assert!(engagement_from_raw(&raw, "c-1").is_none());
    }

    #[test]
    fn test_client_rejects_invalid_base_url() {
        assert!(HttpCrmClient::new("not a url", "tok".to_string()).is_err());
        assert!(HttpCrmClient::new("https://crm.example.test/api/v3", "tok".to_string()).is_ok());
    }
}
