//! Multi-strategy extraction of institution pages and candidate score lookups.
//!
//! This crate provides:
//! - [`Extractor`]: the priority-ordered strategy chain
//! - [`static_parse`]: Strategy A, table heuristics over static HTML
//! - [`browser`]: Strategy B, a headless-browser state machine
//! - [`synthetic`]: Strategy C, deterministic reference data
//! - [`ranking`]: combination totals, percentiles and rank estimates

pub mod browser;
pub mod chain;
pub mod ranking;
pub mod scores;
pub mod static_parse;
pub mod synthetic;

pub use chain::{Extracted, Extractor, Record, Strategy, Target};
pub use ranking::{assemble_candidate, build_rankings, eligible_combinations};
pub use scores::{PeerCounts, ScoreSheet};
pub use static_parse::{StaticParser, parse_institution_page, parse_score_page};
