//! Service layer called by the (external) route handlers.

pub mod dashboard;

pub use dashboard::{DashboardService, PipelineView};
