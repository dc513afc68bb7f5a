//! Single-entity and synchronous batch crawls: discover → extract → reconcile.

use std::sync::Arc;
use std::time::Duration;

use admitsync_extractor::Extractor;
use admitsync_shared::{AdmitError, CrawlConfig, InstitutionStub, Result};
use admitsync_storage::Storage;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::locks::KeyLocks;
use crate::reconcile::{ReconcileAction, UpsertOutcome, upsert_institution};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// A discovered stub plus whether it is already stored.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredStub {
    #[serde(flatten)]
    pub stub: InstitutionStub,
    pub exists: bool,
}

/// Running totals of a crawl loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTotals {
    /// Items finished without error (created + updated).
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl CrawlTotals {
    /// Share of attempted items that succeeded, 0–100. Skips are not attempts.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.processed + self.errors;
        if attempted == 0 {
            return 100.0;
        }
        (self.processed as f64 / attempted as f64 * 10_000.0).round() / 100.0
    }

    fn record(&mut self, action: ReconcileAction) {
        self.processed += 1;
        match action {
            ReconcileAction::Created => self.created += 1,
            ReconcileAction::Updated => self.updated += 1,
        }
    }
}

/// Outcome of one code in a synchronous batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Created,
    Updated,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub code: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program_delta: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-code results and totals of a synchronous batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub results: Vec<ItemResult>,
    pub totals: CrawlTotals,
    pub success_rate: f64,
}

// ---------------------------------------------------------------------------
// Pacing
// ---------------------------------------------------------------------------

/// Delay before the next request: `error_delay` after a failure, otherwise
/// `base_delay` plus uniform jitter.
pub(crate) fn next_delay(pacing: &CrawlConfig, failed: bool) -> Duration {
    if failed {
        return pacing.error_delay;
    }
    let jitter_ms = pacing.jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    pacing.base_delay + Duration::from_millis(jitter)
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

/// Crawls institutions from the catalog into the store.
pub struct Crawler {
    storage: Arc<Storage>,
    extractor: Extractor,
    client: Client,
    catalog_url: String,
    locks: Arc<KeyLocks>,
    pacing: CrawlConfig,
}

impl Crawler {
    pub fn new(
        storage: Arc<Storage>,
        extractor: Extractor,
        client: Client,
        catalog_url: impl Into<String>,
        locks: Arc<KeyLocks>,
        pacing: CrawlConfig,
    ) -> Self {
        Self {
            storage,
            extractor,
            client,
            catalog_url: catalog_url.into(),
            locks,
            pacing,
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn pacing(&self) -> &CrawlConfig {
        &self.pacing
    }

    /// Fetch the catalog index.
    pub async fn discover(&self) -> Result<Vec<InstitutionStub>> {
        admitsync_discovery::discover(&self.client, &self.catalog_url).await
    }

    /// Discover stubs and flag the ones already stored. Never writes.
    pub async fn discover_with_status(&self) -> Result<Vec<DiscoveredStub>> {
        let stubs = self.discover().await?;
        let existing = self.storage.existing_codes().await?;
        Ok(stubs
            .into_iter()
            .map(|stub| DiscoveredStub {
                exists: existing.contains(&stub.code),
                stub,
            })
            .collect())
    }

    /// Extract one stub and reconcile it into the store.
    #[instrument(skip_all, fields(code = %stub.code))]
    pub async fn crawl_stub(&self, stub: &InstitutionStub) -> Result<UpsertOutcome> {
        let Some((institution, provenance)) = self.extractor.extract_institution(stub).await?
        else {
            return Err(AdmitError::parse(format!(
                "no programs recognized at {}",
                stub.detail_url
            )));
        };
        info!(provenance = provenance.as_str(), programs = institution.programs.len(), "institution extracted");
        upsert_institution(&self.storage, &self.locks, institution).await
    }

    /// Crawl a single institution by code.
    pub async fn crawl_code(&self, code: &str) -> Result<UpsertOutcome> {
        let stubs = self.discover().await?;
        let stub = stubs
            .iter()
            .find(|s| s.code == code)
            .ok_or_else(|| AdmitError::NotFound(format!("institution {code} is not in the catalog")))?;
        self.crawl_stub(stub).await
    }

    /// Crawl the given codes one after another with inline pacing.
    ///
    /// Stored codes are skipped unless `force_update`. Per-code failures are
    /// reported in the result list; only a failed discovery aborts the batch.
    #[instrument(skip_all, fields(codes = codes.len(), force_update = force_update))]
    pub async fn crawl_batch(&self, codes: &[String], force_update: bool) -> Result<BatchReport> {
        let stubs = self.discover().await?;
        let existing = self.storage.existing_codes().await?;

        let mut totals = CrawlTotals::default();
        let mut results = Vec::with_capacity(codes.len());

        for (i, code) in codes.iter().enumerate() {
            if existing.contains(code) && !force_update {
                totals.skipped += 1;
                results.push(ItemResult {
                    code: code.clone(),
                    status: ItemStatus::Skipped,
                    program_delta: None,
                    error: None,
                });
                continue;
            }

            let outcome = match stubs.iter().find(|s| &s.code == code) {
                Some(stub) => self.crawl_stub(stub).await,
                None => Err(AdmitError::NotFound(format!(
                    "institution {code} is not in the catalog"
                ))),
            };

            let failed = outcome.is_err();
            match outcome {
                Ok(upsert) => {
                    totals.record(upsert.action);
                    results.push(ItemResult {
                        code: code.clone(),
                        status: match upsert.action {
                            ReconcileAction::Created => ItemStatus::Created,
                            ReconcileAction::Updated => ItemStatus::Updated,
                        },
                        program_delta: Some(upsert.program_delta),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(%code, error = %e, "crawl failed");
                    totals.errors += 1;
                    results.push(ItemResult {
                        code: code.clone(),
                        status: ItemStatus::Error,
                        program_delta: None,
                        error: Some(e.to_string()),
                    });
                }
            }

            if i + 1 < codes.len() {
                tokio::time::sleep(next_delay(&self.pacing, failed)).await;
            }
        }

        info!(
            processed = totals.processed,
            skipped = totals.skipped,
            errors = totals.errors,
            "batch finished"
        );
        Ok(BatchReport {
            success_rate: totals.success_rate(),
            results,
            totals,
        })
    }
}
