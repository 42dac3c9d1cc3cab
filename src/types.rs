//! Shared domain types for the pipeline mirror.
//!
//! Timestamps are RFC 3339 strings throughout: that is the storage format of
//! both cache backings, and upstream values are normalized to UTC RFC 3339
//! at the client boundary so string ordering matches chronological ordering.

use serde::{Deserialize, Serialize};

/// A pipeline entity (deal) as served to the dashboard.
///
/// Owned collectively by the snapshot. The joined fields (company name,
/// contact name, meeting recency, stage duration) are populated from the
/// sub-entity caches during reconciliation; a failed join leaves the field
/// `None` rather than failing the deal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub id: String,
    pub name: String,
    pub stage_id: String,
    pub stage_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_contact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_contact_name: Option<String>,
    /// Whole days since the most recent transition into the current stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_in_stage: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_meeting_at: Option<String>,
    /// Upstream modification marker, compared verbatim during diffing.
    pub last_modified: String,
}

/// One stage of the pipeline taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageInfo {
    pub id: String,
    pub label: String,
    pub display_order: i64,
}

/// One entry of a deal's stage-change history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTransition {
    pub stage_id: String,
    pub occurred_at: String,
}

/// A cached company row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// A cached contact row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Per-company meeting fingerprint.
///
/// Two identities are equal iff their sorted id sequences are byte-equal.
/// The zero-meetings case is stored as an explicit empty set so it is a
/// cache hit, not an absence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingIdentity {
    #[serde(default)]
    pub last_meeting_at: Option<String>,
    #[serde(default)]
    pub meeting_ids: Vec<String>,
}

/// Kind of a logged communication event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Note,
    OutboundEmail,
    InboundEmail,
    Call,
    MeetingLog,
}

impl EngagementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementKind::Note => "note",
            EngagementKind::OutboundEmail => "outbound_email",
            EngagementKind::InboundEmail => "inbound_email",
            EngagementKind::Call => "call",
            EngagementKind::MeetingLog => "meeting_log",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "note" => Some(EngagementKind::Note),
            "outbound_email" => Some(EngagementKind::OutboundEmail),
            "inbound_email" => Some(EngagementKind::InboundEmail),
            "call" => Some(EngagementKind::Call),
            "meeting_log" => Some(EngagementKind::MeetingLog),
            _ => None,
        }
    }
}

/// Direction of a communication event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    None,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            "none" => Some(Direction::None),
            _ => None,
        }
    }
}

/// One row of the communication-history log, upserted idempotently by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementRecord {
    pub id: String,
    pub company_id: String,
    pub kind: EngagementKind,
    pub direction: Direction,
    pub occurred_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// JSON array of participant emails, as upstream sends it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<String>,
}

/// A stored "next step" suggestion, one per deal, overwritten wholesale.
///
/// Servable without regeneration iff `last_engagement_at_generation` is at
/// least the company's current latest engagement timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionRecord {
    pub deal_id: String,
    pub company_id: String,
    pub text: String,
    #[serde(default)]
    pub last_engagement_at_generation: Option<String>,
    pub generated_at: String,
    pub updated_at: String,
}

/// What started a refresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshTrigger {
    Scheduled,
    Request,
    Manual,
    Bootstrap,
}

/// Diagnostic record of one refresh run, kept in a bounded in-memory ring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRecord {
    pub id: String,
    pub trigger: RefreshTrigger,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub deals_fetched: usize,
    pub deals_removed: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deal_serializes_camel_case() {
        let deal = Deal {
            id: "d-1".to_string(),
            name: "Acme expansion".to_string(),
            stage_id: "negotiation".to_string(),
            stage_label: "Negotiation".to_string(),
            amount: Some(42_000.0),
            company_id: Some("c-1".to_string()),
            company_name: Some("Acme Corp".to_string()),
            primary_contact_id: None,
            primary_contact_name: None,
            days_in_stage: Some(12),
            last_meeting_at: None,
            last_modified: "2026-03-01T10:00:00+00:00".to_string(),
        };

        let json = serde_json::to_string(&deal).unwrap();
        assert!(json.contains("\"stageLabel\":\"Negotiation\""));
        assert!(json.contains("\"daysInStage\":12"));
        // None fields are omitted, not serialized as null
        assert!(!json.contains("primaryContactId"));
    }

    #[test]
    fn test_engagement_kind_roundtrip() {
        for kind in [
            EngagementKind::Note,
            EngagementKind::OutboundEmail,
            EngagementKind::InboundEmail,
            EngagementKind::Call,
            EngagementKind::MeetingLog,
        ] {
            assert_eq!(EngagementKind::parse(kind.as_str()), Some(kind));
        }
        assert!(EngagementKind::parse("fax").is_none());
    }

    #[test]
    fn test_meeting_identity_tolerates_missing_fields() {
        let identity: MeetingIdentity = serde_json::from_str("{}").unwrap();
        assert!(identity.last_meeting_at.is_none());
        assert!(identity.meeting_ids.is_empty());
    }
}
