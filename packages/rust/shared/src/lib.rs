//! Shared types, error model, and configuration for admitsync.
//!
//! This crate is the foundation depended on by all other admitsync crates.
//! It provides:
//! - [`AdmitError`]: the unified error type
//! - Domain types ([`Institution`], [`Program`], [`Candidate`], [`Provenance`])
//! - Fixed lookup tables ([`Subject`], [`Combination`])
//! - Configuration ([`AppConfig`], [`CrawlConfig`], config loading)

pub mod config;
pub mod error;
pub mod subjects;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BrowserSettings, CrawlConfig, CrawlPoliciesConfig, LookupConfig, LookupSettings,
    ServerConfig, SourceConfig, StorageConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, validate_config,
};
pub use error::{AdmitError, Result};
pub use subjects::{
    ALL_COMBINATIONS, ALL_SUBJECTS, Combination, CombinationStats, Distribution, Subject,
    canonical_subject,
};
pub use types::{
    CANDIDATE_NUMBER_LEN, Candidate, CombinationRank, Institution, InstitutionStub, Program,
    ProgramKey, Provenance, validate_candidate_number,
};
