//! Crawl and lookup orchestration for admitsync.
//!
//! This crate ties discovery, extraction and storage together:
//! - [`reconcile`] merges extracted institutions into the store
//! - [`catalog::Crawler`] crawls one code or a synchronous list of codes
//! - [`orchestrator::BatchOrchestrator`] runs the background full crawl
//! - [`lookup::LookupService`] serves candidate lookups store-first
//! - [`context::Services`] builds all of the above from config

pub mod catalog;
pub mod context;
pub mod locks;
pub mod lookup;
pub mod orchestrator;
pub mod reconcile;

pub use catalog::{BatchReport, CrawlTotals, Crawler, DiscoveredStub, ItemResult, ItemStatus};
pub use context::Services;
pub use locks::KeyLocks;
pub use lookup::{LookupOutcome, LookupService};
pub use orchestrator::{BatchOrchestrator, CrawlMode, JobHandle, JobSnapshot, JobStatus, StartOutcome};
pub use reconcile::{ReconcileAction, UpsertOutcome, reconcile, upsert_institution};
