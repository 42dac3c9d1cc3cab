//! Orchestration error types.
//!
//! Layer errors (`CacheError`, `CrmApiError`, `SuggestionError`) live with
//! their layers; these enums classify how failures propagate through a
//! reconciliation pass and the service boundary. The policy: per-item
//! upstream failures never appear here (they are logged and mapped to
//! retained stale values at the smallest unit), while probe failures and
//! cache-backing failures fail the whole pass so the next trigger retries.

use thiserror::Error;

use crate::cache::CacheError;
use crate::crm_api::CrmApiError;

/// A reconciliation pass failed as a whole.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The change-detection probe could not be fetched; without it there is
    /// nothing to diff against.
    #[error("change probe failed: {0}")]
    Probe(#[source] CrmApiError),

    /// The first-ever full fetch failed. This is the only upstream error a
    /// dashboard caller ever sees.
    #[error("bootstrap fetch failed: {0}")]
    Bootstrap(#[source] CrmApiError),

    #[error("cache backing: {0}")]
    Cache(#[from] CacheError),
}

/// Errors surfaced at the service boundary.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error("cache backing: {0}")]
    Cache(#[from] CacheError),

    /// A snapshot was expected after a successful bootstrap but is absent.
    #[error("no pipeline snapshot available")]
    NoSnapshot,

    #[error("unknown deal: {0}")]
    UnknownDeal(String),
}
