//! Catalog index parser.
//!
//! The index page is a long list of anchors, one per institution, whose
//! links end with the institution code:
//! - `/diem-chuan/dai-hoc-bach-khoa-ha-noi-BKA.html`
//! - `/truong/QHI`
//! - `/diem-chuan?code=KHA`

use std::collections::HashSet;
use std::sync::LazyLock;

use admitsync_shared::InstitutionStub;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

/// Trailing upper-case token of a path segment, after `-`, `_` or nothing.
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[-_])([A-Z0-9]{2,6})$").expect("code regex"));

/// File extensions stripped before matching.
static EXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.(?:html?|php|aspx?)$").expect("extension regex"));

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Query parameters that carry the code directly.
const CODE_PARAMS: [&str; 3] = ["code", "ma", "ma_truong"];

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse every anchor of the index into de-duplicated stubs.
///
/// Order follows the document; the first anchor for a code wins. Anchors
/// whose code cannot be parsed are dropped.
pub fn parse_catalog(html: &str, base_url: &Url) -> Vec<InstitutionStub> {
    let doc = Html::parse_document(html);
    let anchor_sel = Selector::parse("a[href]").expect("anchor selector");

    let mut seen: HashSet<String> = HashSet::new();
    let mut stubs = Vec::new();

    for el in doc.select(&anchor_sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:")
        {
            continue;
        }
        let Ok(mut detail_url) = base_url.join(href) else {
            continue;
        };
        detail_url.set_fragment(None);

        let Some(code) = extract_code(&detail_url) else {
            continue;
        };
        if !seen.insert(code.clone()) {
            continue;
        }

        let text = WS_RE
            .replace_all(el.text().collect::<String>().trim(), " ")
            .into_owned();
        let name = if !text.is_empty() {
            text
        } else {
            el.value()
                .attr("title")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| code.clone())
        };

        stubs.push(InstitutionStub {
            code,
            name,
            detail_url: detail_url.to_string(),
        });
    }

    stubs
}

/// Pull the institution code out of a detail link.
pub fn extract_code(url: &Url) -> Option<String> {
    for (key, value) in url.query_pairs() {
        if CODE_PARAMS.contains(&key.as_ref()) && is_code(&value) {
            return Some(value.into_owned());
        }
    }

    let segment = url
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()?;
    let stem = EXT_RE.replace(segment, "");
    let caps = CODE_RE.captures(&stem)?;
    let code = caps[1].to_string();
    is_code(&code).then_some(code)
}

/// A code is 2–6 upper-case alphanumerics with at least one letter.
fn is_code(s: &str) -> bool {
    (2..=6).contains(&s.len())
        && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        && s.chars().any(|c| c.is_ascii_uppercase())
}
