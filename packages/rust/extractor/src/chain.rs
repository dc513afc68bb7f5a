//! The priority-ordered strategy chain.

use admitsync_shared::{
    AppConfig, Candidate, Institution, InstitutionStub, Provenance, Result,
};
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use crate::browser::BrowserStrategy;
use crate::ranking::assemble_candidate;
use crate::static_parse::StaticParser;
use crate::synthetic::synthesize;

// ---------------------------------------------------------------------------
// Targets & records
// ---------------------------------------------------------------------------

/// What to extract.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Institution(&'a InstitutionStub),
    Candidate { number: &'a str, region: &'a str },
}

impl Target<'_> {
    fn key(&self) -> &str {
        match self {
            Self::Institution(stub) => &stub.code,
            Self::Candidate { number, .. } => number,
        }
    }
}

/// An extracted record of either kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Institution(Institution),
    Candidate(Candidate),
}

impl Record {
    /// Minimal completeness: an institution needs one program with a score or
    /// combination tag, a candidate needs one subject score.
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Institution(inst) => inst
                .programs
                .iter()
                .any(|p| !p.scores.is_empty() || p.combinations.is_some()),
            Self::Candidate(candidate) => !candidate.scores.is_empty(),
        }
    }
}

/// A complete record plus the strategy that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub record: Record,
    pub provenance: Provenance,
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Extraction strategies, in default priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    StaticParse,
    BrowserAutomation,
    SyntheticFallback,
}

impl Strategy {
    pub fn provenance(&self) -> Provenance {
        match self {
            Self::StaticParse => Provenance::StrategyA,
            Self::BrowserAutomation => Provenance::StrategyB,
            Self::SyntheticFallback => Provenance::Synthetic,
        }
    }

    /// Browser and synthetic strategies only serve candidates.
    pub fn supports(&self, target: &Target<'_>) -> bool {
        match self {
            Self::StaticParse => true,
            Self::BrowserAutomation | Self::SyntheticFallback => {
                matches!(target, Target::Candidate { .. })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Runs the strategy chain; first complete record wins.
#[derive(Debug, Clone)]
pub struct Extractor {
    strategies: Vec<Strategy>,
    static_parser: StaticParser,
    browser: BrowserStrategy,
}

impl Extractor {
    /// Build the chain from config. The browser strategy joins when
    /// `[browser] enabled`, the synthetic one when `[lookup] synthetic_fallback`.
    pub fn new(config: &AppConfig, client: Client) -> Self {
        let mut strategies = vec![Strategy::StaticParse];
        if config.browser.enabled {
            strategies.push(Strategy::BrowserAutomation);
        }
        if config.lookup.synthetic_fallback {
            strategies.push(Strategy::SyntheticFallback);
        }

        Self {
            strategies,
            static_parser: StaticParser::new(client, &config.source.score_url_template),
            browser: BrowserStrategy::new(config.browser.clone(), &config.source.lookup_form_url),
        }
    }

    /// Replace the strategy order.
    pub fn with_strategies(mut self, strategies: Vec<Strategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// Try each supporting strategy in order.
    ///
    /// A strategy error is logged and the chain moves on. If every strategy
    /// that ran failed, the last error is returned; otherwise an incomplete
    /// or missing result is `Ok(None)`.
    #[instrument(skip_all, fields(key = %target.key()))]
    pub async fn extract(&self, target: Target<'_>) -> Result<Option<Extracted>> {
        let mut last_err = None;
        let mut any_ok = false;

        for strategy in &self.strategies {
            if !strategy.supports(&target) {
                continue;
            }
            match self.run(*strategy, target).await {
                Ok(Some(record)) if record.is_complete() => {
                    info!(strategy = ?strategy, "extraction succeeded");
                    return Ok(Some(Extracted {
                        record,
                        provenance: strategy.provenance(),
                    }));
                }
                Ok(_) => {
                    debug!(strategy = ?strategy, "no complete record");
                    any_ok = true;
                }
                Err(e) => {
                    warn!(strategy = ?strategy, error = %e, "strategy failed");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if !any_ok => Err(e),
            _ => Ok(None),
        }
    }

    /// Institution convenience wrapper.
    pub async fn extract_institution(
        &self,
        stub: &InstitutionStub,
    ) -> Result<Option<(Institution, Provenance)>> {
        Ok(self
            .extract(Target::Institution(stub))
            .await?
            .and_then(|e| match e.record {
                Record::Institution(inst) => Some((inst, e.provenance)),
                Record::Candidate(_) => None,
            }))
    }

    /// Candidate convenience wrapper. The candidate's provenance is set.
    pub async fn extract_candidate(&self, number: &str, region: &str) -> Result<Option<Candidate>> {
        Ok(self
            .extract(Target::Candidate { number, region })
            .await?
            .and_then(|e| match e.record {
                Record::Candidate(candidate) => Some(candidate),
                Record::Institution(_) => None,
            }))
    }

    async fn run(&self, strategy: Strategy, target: Target<'_>) -> Result<Option<Record>> {
        match (strategy, target) {
            (Strategy::StaticParse, Target::Institution(stub)) => Ok(Some(Record::Institution(
                self.static_parser.institution(stub).await?,
            ))),
            (Strategy::StaticParse, Target::Candidate { number, region }) => Ok(self
                .static_parser
                .candidate(number, region)
                .await?
                .map(|sheet| candidate(number, region, sheet, strategy))),
            (Strategy::BrowserAutomation, Target::Candidate { number, region }) => Ok(self
                .browser
                .lookup(number)
                .await?
                .map(|sheet| candidate(number, region, sheet, strategy))),
            (Strategy::SyntheticFallback, Target::Candidate { number, region }) => {
                Ok(synthesize(number).map(|sheet| candidate(number, region, sheet, strategy)))
            }
            (Strategy::BrowserAutomation | Strategy::SyntheticFallback, Target::Institution(_)) => {
                Ok(None)
            }
        }
    }
}

fn candidate(
    number: &str,
    region: &str,
    sheet: crate::scores::ScoreSheet,
    strategy: Strategy,
) -> Record {
    Record::Candidate(assemble_candidate(
        number,
        region,
        sheet,
        strategy.provenance(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use admitsync_shared::{AdmitError, SourceConfig};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> AppConfig {
        let mut config = AppConfig::default();
        config.source = SourceConfig {
            score_url_template: format!("{}/diem-thi?sbd={{number}}&region={{region}}", server.uri()),
            timeout_secs: 5,
            ..SourceConfig::default()
        };
        config.browser.enabled = false;
        config
    }

    fn extractor(server: &MockServer) -> Extractor {
        let config = config(server);
        let client = admitsync_discovery::build_client(&config.source).unwrap();
        Extractor::new(&config, client)
    }

    fn stub(server: &MockServer) -> InstitutionStub {
        InstitutionStub {
            code: "NTH".into(),
            name: "Ngoại thương".into(),
            detail_url: format!("{}/truong/NTH", server.uri()),
        }
    }

    #[test]
    fn chain_order_follows_config() {
        let mut config = AppConfig::default();
        let client = Client::new();
        assert_eq!(
            Extractor::new(&config, client.clone()).strategies(),
            &[Strategy::StaticParse, Strategy::BrowserAutomation]
        );

        config.browser.enabled = false;
        config.lookup.synthetic_fallback = true;
        assert_eq!(
            Extractor::new(&config, client).strategies(),
            &[Strategy::StaticParse, Strategy::SyntheticFallback]
        );
    }

    #[tokio::test]
    async fn institution_from_static_parse() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/truong/NTH"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<h1>Đại học Ngoại thương</h1>
                <table data-year="2024">
                  <tr><td>1</td><td>7310101</td><td>Kinh tế</td><td>A00; D01</td><td>27.8</td></tr>
                </table>"#,
            ))
            .mount(&server)
            .await;

        let (inst, provenance) = extractor(&server)
            .extract_institution(&stub(&server))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(provenance, Provenance::StrategyA);
        assert_eq!(inst.programs.len(), 1);
        assert_eq!(inst.programs[0].scores.get(&2024), Some(&27.8));
    }

    #[tokio::test]
    async fn page_without_programs_is_none() {
        let server = MockServer::start().await;
        Mock::given(path("/truong/NTH"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<h1>Ngoại thương</h1>"))
            .mount(&server)
            .await;

        let result = extractor(&server).extract_institution(&stub(&server)).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn sole_failing_strategy_surfaces_its_error() {
        let server = MockServer::start().await;
        Mock::given(path("/truong/NTH"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = extractor(&server)
            .extract_institution(&stub(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmitError::Fetch(_)));
    }

    #[tokio::test]
    async fn failing_static_parse_falls_through_to_synthetic() {
        let server = MockServer::start().await;
        Mock::given(path("/diem-thi"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let candidate = extractor(&server)
            .with_strategies(vec![Strategy::StaticParse, Strategy::SyntheticFallback])
            .extract_candidate("12345678", "ha-noi")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(candidate.provenance, Provenance::Synthetic);
        assert!(candidate.is_complete());
    }

    #[tokio::test]
    async fn candidate_from_static_score_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/diem-thi"))
            .and(query_param("sbd", "12345678"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<table>
                  <tr><td>Toán</td><td>8.4</td></tr>
                  <tr><td>Ngữ văn</td><td>7.5</td></tr>
                  <tr><td>Tiếng Anh</td><td>9.2</td></tr>
                </table>"#,
            ))
            .mount(&server)
            .await;

        let candidate = extractor(&server)
            .extract_candidate("12345678", "ha-noi")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(candidate.provenance, Provenance::StrategyA);
        assert_eq!(candidate.scores.len(), 3);
        assert_eq!(candidate.rankings.len(), 1);
    }
}
