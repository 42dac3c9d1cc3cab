//! Runtime configuration, loaded from `~/.dealdesk/config.json`.
//!
//! The CRM bearer token deliberately never lives in the config file; it is
//! read from the `DEALDESK_CRM_TOKEN` environment variable at startup.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable holding the CRM bearer token.
pub const CRM_TOKEN_VAR: &str = "DEALDESK_CRM_TOKEN";

/// Which cache backing to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackingKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Base URL of the CRM REST API, e.g. `https://crm.example.com/api/v3`.
    pub crm_base_url: String,

    /// Endpoint of the suggestion service. Absent means suggestions fall
    /// back to the fixed sentinel text.
    #[serde(default)]
    pub suggestion_endpoint: Option<String>,

    #[serde(default = "default_backing")]
    pub cache_backing: BackingKind,

    /// How old the snapshot may get before a dashboard request triggers a
    /// background reconciliation.
    #[serde(default = "default_snapshot_max_age_minutes")]
    pub snapshot_max_age_minutes: i64,

    /// TTL for cached company and contact rows.
    #[serde(default = "default_sub_entity_ttl_hours")]
    pub sub_entity_ttl_hours: i64,

    /// TTL for the cached pipeline-stage taxonomy.
    #[serde(default = "default_stage_ttl_hours")]
    pub stage_ttl_hours: i64,

    /// Detail fetches per batch. Together with `batch_delay_ms` this must
    /// stay under the upstream fixed-window rate limit.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Cooldown between batches, in milliseconds.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Period of the scheduled background refresh loop.
    #[serde(default = "default_refresh_interval_minutes")]
    pub refresh_interval_minutes: u64,

    /// Engagements listed per company per reconciliation cycle.
    #[serde(default = "default_engagement_page_size")]
    pub engagement_page_size: usize,
}

fn default_backing() -> BackingKind {
    BackingKind::Sqlite
}

fn default_snapshot_max_age_minutes() -> i64 {
    10
}

fn default_sub_entity_ttl_hours() -> i64 {
    24
}

fn default_stage_ttl_hours() -> i64 {
    24
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_delay_ms() -> u64 {
    1_100
}

fn default_refresh_interval_minutes() -> u64 {
    15
}

fn default_engagement_page_size() -> usize {
    50
}

/// Get the canonical config file path (`~/.dealdesk/config.json`).
pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".dealdesk").join("config.json"))
}

impl Config {
    /// Load configuration from `~/.dealdesk/config.json`.
    pub fn load() -> Result<Config, String> {
        let path = config_path()?;

        if !path.exists() {
            return Err(format!(
                "Config file not found at {}. Create it with: {{ \"crmBaseUrl\": \"https://crm.example.com/api/v3\" }}",
                path.display()
            ));
        }

        let content =
            fs::read_to_string(&path).map_err(|e| format!("Failed to read config: {}", e))?;

        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// Read the CRM bearer token from the environment.
    pub fn crm_token(&self) -> Result<String, String> {
        std::env::var(CRM_TOKEN_VAR)
            .map_err(|_| format!("{} is not set", CRM_TOKEN_VAR))
            .and_then(|t| {
                if t.trim().is_empty() {
                    Err(format!("{} is empty", CRM_TOKEN_VAR))
                } else {
                    Ok(t)
                }
            })
    }

    pub fn snapshot_max_age(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.snapshot_max_age_minutes)
    }
}
