//! Wiring of the shared services from configuration.

use std::path::PathBuf;
use std::sync::Arc;

use admitsync_extractor::Extractor;
use admitsync_shared::{AppConfig, CrawlConfig, LookupConfig, Result, validate_config};
use admitsync_storage::Storage;
use tracing::info;

use crate::catalog::Crawler;
use crate::locks::KeyLocks;
use crate::lookup::LookupService;
use crate::orchestrator::BatchOrchestrator;

/// Every long-lived service, built once per process.
pub struct Services {
    pub storage: Arc<Storage>,
    pub crawler: Arc<Crawler>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub lookup: LookupService,
}

impl Services {
    /// Validate `config`, open the store and build the services over it.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        validate_config(config)?;

        let db_path = PathBuf::from(&config.storage.db_path);
        let storage = Arc::new(Storage::open(&db_path).await?);
        let client = admitsync_discovery::build_client(&config.source)?;
        let extractor = Extractor::new(config, client.clone());
        let locks = Arc::new(KeyLocks::new());

        let crawler = Arc::new(Crawler::new(
            storage.clone(),
            extractor.clone(),
            client,
            &config.source.catalog_url,
            locks.clone(),
            CrawlConfig::from(config),
        ));
        let orchestrator = Arc::new(BatchOrchestrator::new(crawler.clone()));
        let lookup = LookupService::new(
            storage.clone(),
            extractor,
            locks,
            LookupConfig::from(config),
        );

        info!(
            db = %db_path.display(),
            strategies = ?lookup_strategies(config),
            "services ready"
        );
        Ok(Self {
            storage,
            crawler,
            orchestrator,
            lookup,
        })
    }
}

fn lookup_strategies(config: &AppConfig) -> Vec<&'static str> {
    let mut names = vec!["static_parse"];
    if config.browser.enabled {
        names.push("browser_automation");
    }
    if config.lookup.synthetic_fallback {
        names.push("synthetic_fallback");
    }
    names
}
