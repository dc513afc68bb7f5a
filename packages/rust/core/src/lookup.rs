//! On-demand candidate score lookup with store-first caching.

use std::sync::Arc;

use admitsync_extractor::Extractor;
use admitsync_shared::{Candidate, LookupConfig, Provenance, Result, validate_candidate_number};
use admitsync_storage::Storage;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::locks::KeyLocks;

/// Typed result of a lookup. Lookups never return an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LookupOutcome {
    InvalidKey { message: String },
    Found(Candidate),
    NotFound,
    Failed { error: String },
}

impl LookupOutcome {
    pub fn candidate(&self) -> Option<&Candidate> {
        match self {
            Self::Found(candidate) => Some(candidate),
            _ => None,
        }
    }
}

/// Store-first candidate lookups backed by the extractor chain.
#[derive(Clone)]
pub struct LookupService {
    storage: Arc<Storage>,
    extractor: Extractor,
    locks: Arc<KeyLocks>,
    config: LookupConfig,
}

impl LookupService {
    pub fn new(
        storage: Arc<Storage>,
        extractor: Extractor,
        locks: Arc<KeyLocks>,
        config: LookupConfig,
    ) -> Self {
        Self {
            storage,
            extractor,
            locks,
            config,
        }
    }

    fn region<'a>(&'a self, region: Option<&'a str>) -> &'a str {
        region
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(self.config.default_region.as_str())
    }

    /// Return the stored record when complete, else extract and persist.
    #[instrument(skip_all, fields(number = %number))]
    pub async fn lookup(&self, number: &str, region: Option<&str>) -> LookupOutcome {
        if let Err(e) = validate_candidate_number(number) {
            return LookupOutcome::InvalidKey {
                message: e.to_string(),
            };
        }
        let region = self.region(region);

        match self.stored(number).await {
            Ok(Some(candidate)) => return LookupOutcome::Found(candidate),
            Ok(None) => {}
            Err(e) => return failed(e),
        }

        let _guard = self.locks.lock(number).await;
        // Another request may have filled the store while we waited.
        match self.stored(number).await {
            Ok(Some(candidate)) => LookupOutcome::Found(candidate),
            Ok(None) => self.fetch_and_store(number, region).await,
            Err(e) => failed(e),
        }
    }

    /// Discard any stored record and extract again.
    #[instrument(skip_all, fields(number = %number))]
    pub async fn refresh(&self, number: &str, region: Option<&str>) -> LookupOutcome {
        if let Err(e) = validate_candidate_number(number) {
            return LookupOutcome::InvalidKey {
                message: e.to_string(),
            };
        }
        let region = self.region(region);
        let _guard = self.locks.lock(number).await;
        self.fetch_and_store(number, region).await
    }

    /// Remove a stored candidate. Returns whether one existed.
    pub async fn delete(&self, number: &str) -> Result<bool> {
        validate_candidate_number(number)?;
        let _guard = self.locks.lock(number).await;
        let removed = self.storage.delete_candidate(number).await?;
        info!(%number, removed, "candidate deleted");
        Ok(removed)
    }

    /// Trigger extraction in the background and poll the store for the
    /// result, up to the configured number of attempts.
    #[instrument(skip_all, fields(number = %number))]
    pub async fn lookup_delegated(&self, number: &str, region: Option<&str>) -> LookupOutcome {
        if let Err(e) = validate_candidate_number(number) {
            return LookupOutcome::InvalidKey {
                message: e.to_string(),
            };
        }
        match self.stored(number).await {
            Ok(Some(candidate)) => return LookupOutcome::Found(candidate),
            Ok(None) => {}
            Err(e) => return failed(e),
        }

        let task = {
            let this = self.clone();
            let number = number.to_string();
            let region = self.region(region).to_string();
            tokio::spawn(async move {
                let _guard = this.locks.lock(&number).await;
                match this.stored(&number).await {
                    Ok(Some(candidate)) => LookupOutcome::Found(candidate),
                    _ => this.fetch_and_store(&number, &region).await,
                }
            })
        };

        for attempt in 1..=self.config.poll_attempts {
            tokio::time::sleep(self.config.poll_interval).await;
            match self.stored(number).await {
                Ok(Some(candidate)) => return LookupOutcome::Found(candidate),
                Ok(None) => debug!(attempt, "candidate not stored yet"),
                Err(e) => return failed(e),
            }
            // A finished extraction that stored nothing will not store later.
            if task.is_finished() {
                break;
            }
        }

        if task.is_finished() {
            if let Ok(outcome @ LookupOutcome::Failed { .. }) = task.await {
                return outcome;
            }
        }
        LookupOutcome::NotFound
    }

    /// A complete stored record, tagged as served from the store.
    async fn stored(&self, number: &str) -> Result<Option<Candidate>> {
        Ok(self
            .storage
            .get_candidate(number)
            .await?
            .filter(Candidate::is_complete)
            .map(|mut candidate| {
                candidate.provenance = Provenance::Store;
                candidate
            }))
    }

    /// Drop the stale record, run the chain, persist what it returns.
    /// Callers hold the key lock.
    async fn fetch_and_store(&self, number: &str, region: &str) -> LookupOutcome {
        if let Err(e) = self.storage.delete_candidate(number).await {
            return failed(e);
        }

        match self.extractor.extract_candidate(number, region).await {
            Ok(Some(candidate)) => {
                if let Err(e) = self.storage.replace_candidate(&candidate).await {
                    return failed(e);
                }
                info!(
                    provenance = candidate.provenance.as_str(),
                    rankings = candidate.rankings.len(),
                    "candidate extracted"
                );
                LookupOutcome::Found(candidate)
            }
            Ok(None) => LookupOutcome::NotFound,
            Err(e) => failed(e),
        }
    }
}

fn failed(e: admitsync_shared::AdmitError) -> LookupOutcome {
    warn!(error = %e, "lookup failed");
    LookupOutcome::Failed {
        error: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{test_config, test_storage};
    use admitsync_shared::Combination;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SCORE_PAGE: &str = r#"<h2>Kết quả thi năm 2024</h2>
        <table>
          <tr><td>Toán</td><td>8.4</td></tr>
          <tr><td>Vật lí</td><td>7.75</td></tr>
          <tr><td>Hóa học</td><td>8.0</td></tr>
          <tr><td>Ngữ văn</td><td>7.5</td></tr>
          <tr><td>Tiếng Anh</td><td>9.2</td></tr>
        </table>"#;

    async fn service(server: &MockServer) -> LookupService {
        let config = test_config(server);
        let client = admitsync_discovery::build_client(&config.source).unwrap();
        let mut lookup = LookupConfig::from(&config);
        lookup.poll_interval = Duration::from_millis(50);
        LookupService::new(
            test_storage().await,
            Extractor::new(&config, client),
            Arc::new(KeyLocks::new()),
            lookup,
        )
    }

    async fn mount_scores(server: &MockServer, body: &str) {
        Mock::given(method("GET"))
            .and(path("/diem-thi"))
            .and(query_param("sbd", "12345678"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn malformed_keys_are_rejected_before_any_fetch() {
        let server = MockServer::start().await;
        let service = service(&server).await;
        for key in ["00000000", "0", "1234567", "1234567a", "11111111"] {
            let outcome = service.lookup(key, None).await;
            assert!(
                matches!(outcome, LookupOutcome::InvalidKey { .. }),
                "{key} should be invalid"
            );
        }
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn static_parse_lookup_persists_ranks_then_serves_from_store() {
        let server = MockServer::start().await;
        mount_scores(&server, SCORE_PAGE).await;
        let service = service(&server).await;

        let outcome = service.lookup("12345678", Some("ha-noi")).await;
        let candidate = outcome.candidate().expect("found").clone();
        assert_eq!(candidate.provenance, Provenance::StrategyA);
        let mut combos: Vec<_> = candidate.rankings.iter().map(|r| r.combination).collect();
        combos.sort();
        assert_eq!(
            combos,
            vec![
                Combination::A00,
                Combination::A01,
                Combination::C01,
                Combination::D01,
                Combination::D07
            ]
        );

        let stored = service.storage.get_candidate("12345678").await.unwrap().unwrap();
        assert_eq!(stored.rankings.len(), 5);

        let again = service.lookup("12345678", None).await;
        assert_eq!(again.candidate().unwrap().provenance, Provenance::Store);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refresh_re_extracts_and_delete_removes() {
        let server = MockServer::start().await;
        mount_scores(&server, SCORE_PAGE).await;
        let service = service(&server).await;

        service.lookup("12345678", None).await;
        let refreshed = service.refresh("12345678", None).await;
        assert_eq!(refreshed.candidate().unwrap().provenance, Provenance::StrategyA);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);

        assert!(service.delete("12345678").await.unwrap());
        assert!(!service.delete("12345678").await.unwrap());
        assert!(service.storage.get_candidate("12345678").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_result_marker_is_not_found() {
        let server = MockServer::start().await;
        mount_scores(&server, "<p>Không tìm thấy thí sinh với số báo danh này</p>").await;
        let service = service(&server).await;

        assert_eq!(service.lookup("12345678", None).await, LookupOutcome::NotFound);
    }

    #[tokio::test]
    async fn upstream_failure_is_failed() {
        let server = MockServer::start().await;
        Mock::given(path("/diem-thi"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let service = service(&server).await;

        assert!(matches!(
            service.lookup("12345678", None).await,
            LookupOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn delegated_lookup_polls_the_store() {
        let server = MockServer::start().await;
        mount_scores(&server, SCORE_PAGE).await;
        let service = service(&server).await;

        let outcome = service.lookup_delegated("12345678", None).await;
        let candidate = outcome.candidate().expect("found after polling");
        assert_eq!(candidate.provenance, Provenance::Store);
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(LookupOutcome::NotFound).unwrap();
        assert_eq!(json["status"], "not_found");
        let json = serde_json::to_value(LookupOutcome::InvalidKey {
            message: "bad".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "invalid_key");
    }
}
