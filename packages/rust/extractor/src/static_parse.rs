//! Strategy A: one fetch, then table heuristics over the static HTML.
//!
//! Detail pages list programs in plain tables. Column order varies a little
//! between institutions, so rows are read positionally:
//!
//! ```text
//! [ordinal] [program code] name  combination  score  note...
//! ```
//!
//! The ordinal and code columns are optional and recognized by shape.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::LazyLock;

use admitsync_discovery::fetch_html;
use admitsync_shared::{
    Institution, InstitutionStub, Program, ProgramKey, Result, Subject, canonical_subject,
};
use chrono::{Datelike, Utc};
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};

use crate::scores::{SUBJECT_SCORE_RANGE, ScoreSheet, score_sheet_from_rows};

/// Plausible range of an admission benchmark score.
pub const BENCHMARK_SCORE_RANGE: RangeInclusive<f64> = 0.0..=50.0;

/// First cells that mark a header row rather than a program.
const HEADER_BLOCKLIST: &[&str] = &[
    "stt",
    "tt",
    "tên ngành",
    "mã ngành",
    "ngành",
    "ngành học",
    "tổ hợp",
    "tổ hợp môn",
    "điểm chuẩn",
    "ghi chú",
    "no",
    "no.",
    "#",
    "name",
    "major",
    "code",
];

/// Text fragments that mean the score page has no record for the number.
const NO_RESULT_MARKERS: &[&str] = &[
    "không tìm thấy",
    "không có kết quả",
    "số báo danh không tồn tại",
    "not found",
    "no result",
];

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

static ORDINAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}\.?$").expect("ordinal regex"));

/// Digits with an optional letter suffix, e.g. `7480201` or `7480201CLC`.
static PROGRAM_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4,10}[A-Za-z_]{0,5}$").expect("program code regex"));

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(20\d{2})\b").expect("year regex"));

/// A standalone number: not glued to a preceding letter (so `A00` is not `0`).
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\p{L}\d])(\d+(?:[.,]\d+)?)").expect("number regex")
});

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

// ---------------------------------------------------------------------------
// Numeric helpers
// ---------------------------------------------------------------------------

/// Parse the first standalone number of a cell and range-check it.
///
/// A decimal comma is converted to a point; everything outside `[0-9.]` is
/// stripped before parsing.
pub fn parse_number(raw: &str, range: RangeInclusive<f64>) -> Option<f64> {
    let caps = NUMBER_RE.captures(raw.trim())?;
    let cleaned: String = caps[1]
        .replace(',', ".")
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = cleaned.parse().ok()?;
    (value.is_finite() && range.contains(&value)).then_some(value)
}

fn parse_quota(raw: &str) -> Option<u32> {
    let digits: String = raw
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()?
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn first_year(text: &str) -> Option<i32> {
    YEAR_RE.captures(text).and_then(|c| c[1].parse().ok())
}

fn normalize(text: &str) -> String {
    WS_RE.replace_all(text.trim(), " ").into_owned()
}

fn element_text(el: ElementRef<'_>) -> String {
    normalize(&el.text().collect::<Vec<_>>().join(" "))
}

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

// ---------------------------------------------------------------------------
// Institution pages
// ---------------------------------------------------------------------------

/// Parse an institution detail page into an [`Institution`].
///
/// The returned value may have no programs; completeness is judged by the
/// caller.
pub fn parse_institution_page(html: &str, stub: &InstitutionStub) -> Institution {
    let doc = Html::parse_document(html);

    let name = doc
        .select(&sel("h1"))
        .map(element_text)
        .find(|t| !t.is_empty())
        .unwrap_or_else(|| stub.name.clone());

    let mut institution = Institution::new(&stub.code, name);
    apply_labelled_fields(&doc, &mut institution);

    institution.description = doc
        .select(&sel(r#"meta[name="description"]"#))
        .filter_map(|m| m.value().attr("content"))
        .map(normalize)
        .find(|d| !d.is_empty());

    let heading_year = doc
        .select(&sel("h1, h2"))
        .find_map(|h| first_year(&element_text(h)));
    let fallback_year = heading_year.unwrap_or_else(|| Utc::now().year());

    institution.programs = parse_program_tables(&doc, &stub.code, fallback_year);
    debug!(
        code = %stub.code,
        programs = institution.programs.len(),
        "parsed institution page"
    );
    institution
}

/// Fill scalars from `Label: value` lines and two-cell label/value rows.
/// The first occurrence of each label wins.
fn apply_labelled_fields(doc: &Html, institution: &mut Institution) {
    let mut pairs: Vec<(String, String)> = Vec::new();

    for el in doc.select(&sel("p, li, dd, span")) {
        let text = element_text(el);
        if let Some((label, value)) = text.split_once([':', '：']) {
            pairs.push((label.trim().to_lowercase(), value.trim().to_string()));
        }
    }
    for row in doc.select(&sel("tr")) {
        let cells: Vec<String> = row.select(&sel("th, td")).map(element_text).collect();
        if let [label, value] = cells.as_slice() {
            let label = label.trim_end_matches([':', '：']).trim().to_lowercase();
            pairs.push((label, value.clone()));
        }
    }

    for (label, value) in pairs {
        if value.is_empty() {
            continue;
        }
        match label.as_str() {
            "tên đầy đủ" | "tên trường" | "tên tiếng việt" | "full name" => {
                institution.full_name.get_or_insert(value);
            }
            "địa chỉ" | "khu vực" | "tỉnh/thành" | "address" | "location" => {
                institution.location.get_or_insert(value);
            }
            "loại hình" | "loại trường" | "category" | "type" => {
                institution.category.get_or_insert(value);
            }
            "website" | "trang web" | "trang chủ" => {
                institution.website.get_or_insert(value);
            }
            "chỉ tiêu" | "tổng chỉ tiêu" | "quota" => {
                if institution.quota.is_none() {
                    institution.quota = parse_quota(&value);
                }
            }
            _ => {}
        }
    }
}

/// Read every table into programs, merging year scores of repeated keys.
fn parse_program_tables(doc: &Html, institution_code: &str, fallback_year: i32) -> Vec<Program> {
    let mut programs: Vec<Program> = Vec::new();
    let mut index: HashMap<ProgramKey, usize> = HashMap::new();

    for table in doc.select(&sel("table")) {
        let year = table
            .value()
            .attr("data-year")
            .and_then(|y| y.trim().parse().ok())
            .or_else(|| {
                table
                    .select(&sel("caption"))
                    .find_map(|c| first_year(&element_text(c)))
            })
            .unwrap_or(fallback_year);

        for row in table.select(&sel("tr")) {
            let cells: Vec<String> = row.select(&sel("th, td")).map(element_text).collect();
            let Some(program) = parse_program_row(&cells, institution_code, year) else {
                continue;
            };

            match index.get(&program.key()) {
                Some(&i) => {
                    let existing = &mut programs[i];
                    existing.scores.extend(program.scores);
                    if existing.code.is_none() {
                        existing.code = program.code;
                    }
                    if existing.combinations.is_none() {
                        existing.combinations = program.combinations;
                    }
                }
                None => {
                    index.insert(program.key(), programs.len());
                    programs.push(program);
                }
            }
        }
    }

    programs
}

/// Apply the column heuristics to one row. `None` for header or short rows.
fn parse_program_row(cells: &[String], institution_code: &str, year: i32) -> Option<Program> {
    if cells.len() < 3 {
        return None;
    }
    let first = cells[0].to_lowercase();
    if HEADER_BLOCKLIST.contains(&first.as_str()) {
        return None;
    }

    let mut rest = cells;
    if ORDINAL_RE.is_match(&rest[0]) {
        rest = &rest[1..];
    }
    let mut code = None;
    if let Some(cell) = rest.first() {
        if (5..=10).contains(&cell.len()) && PROGRAM_CODE_RE.is_match(cell) {
            code = Some(cell.clone());
            rest = &rest[1..];
        }
    }

    let name = rest.first().map(|s| s.trim()).filter(|s| !s.is_empty())?;
    if HEADER_BLOCKLIST.contains(&name.to_lowercase().as_str()) {
        return None;
    }

    let mut program = Program::new(institution_code, name);
    program.code = code;
    program.combinations = rest
        .get(1)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(score) = rest.get(2).and_then(|s| parse_number(s, BENCHMARK_SCORE_RANGE)) {
        program.scores.insert(year, score);
    }
    program.note = rest
        .get(3..)
        .map(|notes| {
            notes
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    Some(program)
}

// ---------------------------------------------------------------------------
// Candidate score pages
// ---------------------------------------------------------------------------

/// Parse a static score page. `None` when the page says the number is unknown.
pub fn parse_score_page(html: &str) -> Option<ScoreSheet> {
    let doc = Html::parse_document(html);

    let body = doc
        .select(&sel("body"))
        .next()
        .map(element_text)
        .unwrap_or_default()
        .to_lowercase();
    if NO_RESULT_MARKERS.iter().any(|m| body.contains(m)) {
        return None;
    }

    let mut rows: Vec<String> = doc
        .select(&sel("tr"))
        .map(|row| {
            row.select(&sel("th, td"))
                .map(element_text)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();
    rows.extend(doc.select(&sel("li, p")).map(element_text));

    let mut sheet = score_sheet_from_rows(rows.iter().map(String::as_str));
    for (subject, value) in column_scores(&doc) {
        sheet.scores.entry(subject).or_insert(value);
    }
    sheet.exam_year = doc
        .select(&sel("h1, h2, caption"))
        .find_map(|h| first_year(&element_text(h)));
    Some(sheet)
}

/// Scores laid out in columns: a row of subject labels over a row of values.
fn column_scores(doc: &Html) -> BTreeMap<Subject, f64> {
    let mut scores = BTreeMap::new();
    for table in doc.select(&sel("table")) {
        let rows: Vec<Vec<String>> = table
            .select(&sel("tr"))
            .map(|row| row.select(&sel("th, td")).map(element_text).collect())
            .collect();
        for pair in rows.windows(2) {
            let labels: Vec<Option<Subject>> =
                pair[0].iter().map(|cell| canonical_subject(cell)).collect();
            if labels.iter().flatten().count() < 2 {
                continue;
            }
            for (label, cell) in labels.into_iter().zip(&pair[1]) {
                let Some(subject) = label else { continue };
                if let Some(value) = parse_number(cell, SUBJECT_SCORE_RANGE) {
                    scores.entry(subject).or_insert(value);
                }
            }
        }
    }
    scores
}

/// Substitute `{number}` and `{region}` into the score URL template.
pub fn score_url(template: &str, number: &str, region: &str) -> String {
    let region: String = url::form_urlencoded::byte_serialize(region.as_bytes()).collect();
    template
        .replace("{number}", number)
        .replace("{region}", &region)
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Fetch-and-parse strategy over plain HTTP.
#[derive(Debug, Clone)]
pub struct StaticParser {
    client: Client,
    score_url_template: String,
}

impl StaticParser {
    pub fn new(client: Client, score_url_template: impl Into<String>) -> Self {
        Self {
            client,
            score_url_template: score_url_template.into(),
        }
    }

    /// Fetch and parse an institution's detail page.
    #[instrument(skip_all, fields(code = %stub.code))]
    pub async fn institution(&self, stub: &InstitutionStub) -> Result<Institution> {
        let html = fetch_html(&self.client, &stub.detail_url).await?;
        Ok(parse_institution_page(&html, stub))
    }

    /// Fetch and parse a candidate's static score page.
    #[instrument(skip_all, fields(number = %number))]
    pub async fn candidate(&self, number: &str, region: &str) -> Result<Option<ScoreSheet>> {
        let url = score_url(&self.score_url_template, number, region);
        let html = fetch_html(&self.client, &url).await?;
        Ok(parse_score_page(&html))
    }
}
