//! Dealdesk daemon: keeps the pipeline mirror warm on an interval.
//!
//! The HTTP route layer is wired separately; this binary owns the scheduled
//! reconciliation loop so the first dashboard request of the day never pays
//! for a cold fetch.

use std::sync::Arc;
use std::time::Duration;

use dealdesk::cache::CacheBacking;
use dealdesk::config::BackingKind;
use dealdesk::crm_api::{CrmApi, HttpCrmClient};
use dealdesk::reconcile::{PipelineRefresher, RefreshSettings};
use dealdesk::services::DashboardService;
use dealdesk::suggestions::{HttpSuggestionGenerator, SuggestionGenerator};
use dealdesk::types::RefreshTrigger;
use dealdesk::{Config, MemoryBacking, SqliteBacking};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };
    let token = match config.crm_token() {
        Ok(token) => token,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let backing: Arc<dyn CacheBacking> = match config.cache_backing {
        BackingKind::Memory => {
            log::info!("cache backing: in-memory (lost on restart)");
            Arc::new(MemoryBacking::default())
        }
        BackingKind::Sqlite => match SqliteBacking::open() {
            Ok(backing) => Arc::new(backing),
            Err(e) => {
                log::error!("failed to open cache database: {e}");
                std::process::exit(1);
            }
        },
    };

    let crm: Arc<dyn CrmApi> = match HttpCrmClient::new(&config.crm_base_url, token) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };
    let generator: Arc<dyn SuggestionGenerator> =
        Arc::new(HttpSuggestionGenerator::new(config.suggestion_endpoint.clone()));
    if config.suggestion_endpoint.is_none() {
        log::warn!("no suggestion endpoint configured; suggestions will use the fallback text");
    }

    let refresher = Arc::new(PipelineRefresher::new(
        crm,
        backing.clone(),
        RefreshSettings::from(&config),
    ));
    let service = Arc::new(DashboardService::new(
        refresher,
        backing,
        generator,
        &config,
    ));

    log::info!(
        "dealdesk started: refreshing every {}m against {}",
        config.refresh_interval_minutes,
        config.crm_base_url
    );

    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.refresh_interval_minutes.max(1) * 60));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match service.refresh_now(RefreshTrigger::Scheduled).await {
                    Ok(outcome) => log::info!("scheduled refresh: {:?}", outcome),
                    Err(e) => log::warn!("scheduled refresh failed: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                break;
            }
        }
    }
}
