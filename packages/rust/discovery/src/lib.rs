//! Catalog discovery: enumerate institution stubs from the index page.
//!
//! Discovery is the first pass of every batch crawl. It fetches the catalog
//! root once and turns its anchors into `(code, name, detail_url)` stubs.
//! The HTTP helpers here are shared with the extractor so both speak to the
//! source with the same client settings.

mod parser;

use std::time::Duration;

use admitsync_shared::{AdmitError, InstitutionStub, Result, SourceConfig};
use reqwest::Client;
use tracing::{debug, info, instrument};
use url::Url;

pub use parser::{extract_code, parse_catalog};

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// Maximum response size we consider valid (10 MB).
const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;

/// Default User-Agent string for source requests.
const USER_AGENT: &str = concat!("admitsync/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Build a reqwest client with the source's timeout and user agent.
pub fn build_client(source: &SourceConfig) -> Result<Client> {
    Client::builder()
        .user_agent(source.user_agent.as_deref().unwrap_or(USER_AGENT))
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(source.timeout_secs))
        .build()
        .map_err(|e| AdmitError::Fetch(format!("failed to build HTTP client: {e}")))
}

/// Fetch a page body as text. Non-success statuses are fetch errors.
pub async fn fetch_html(client: &Client, url: &str) -> Result<String> {
    debug!(%url, "fetching page");

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AdmitError::Fetch(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AdmitError::Fetch(format!("{url}: HTTP {status}")));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_RESPONSE_SIZE {
            return Err(AdmitError::Fetch(format!(
                "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
            )));
        }
    }

    response
        .text()
        .await
        .map_err(|e| AdmitError::Fetch(format!("{url}: failed to read body: {e}")))
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Discover every institution listed on the catalog index.
///
/// A failure to fetch the index is returned as [`AdmitError::Fetch`]; callers
/// that need a full pass (the batch orchestrator) treat it as fatal.
#[instrument(skip_all, fields(catalog_url = %catalog_url))]
pub async fn discover(client: &Client, catalog_url: &str) -> Result<Vec<InstitutionStub>> {
    let base = Url::parse(catalog_url)
        .map_err(|e| AdmitError::validation(format!("invalid catalog URL {catalog_url}: {e}")))?;

    let body = fetch_html(client, catalog_url).await?;
    let stubs = parse_catalog(&body, &base);

    info!(stubs = stubs.len(), "catalog discovered");
    Ok(stubs)
}
