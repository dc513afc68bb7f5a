//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::time::Duration;

use admitsync_core::{CrawlMode, JobSnapshot, JobStatus, LookupOutcome, Services};
use admitsync_shared::{AppConfig, Candidate, init_config, load_config, load_config_from};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// admitsync: keep a local store of university admission data in sync.
#[derive(Parser)]
#[command(
    name = "admitsync",
    version,
    about = "Crawl university admission benchmarks and look up exam candidates.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.admitsync/admitsync.toml).
    #[arg(long, global = true, env = "ADMITSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// List institutions on the catalog index and whether each is stored.
    Discover,

    /// Crawl one institution by code.
    Crawl {
        /// Institution code, e.g. BKA.
        code: String,
    },

    /// Crawl the whole catalog in the foreground. Ctrl-C cancels.
    CrawlAll {
        /// Re-crawl institutions that are already stored.
        #[arg(long)]
        force: bool,

        /// Skip institutions that are already stored.
        #[arg(long)]
        skip_existing: bool,
    },

    /// Look up an exam candidate's scores and rankings.
    Lookup {
        /// Candidate number (8 digits).
        number: String,

        /// Exam region; defaults to `[lookup] default_region`.
        #[arg(short, long)]
        region: Option<String>,

        /// Ignore the stored record and extract again.
        #[arg(long)]
        refresh: bool,

        /// Print the raw JSON outcome.
        #[arg(long)]
        json: bool,
    },

    /// How to start the HTTP server.
    Serve,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "admitsync=info",
        1 => "admitsync=debug",
        _ => "admitsync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Discover => cmd_discover(&config(config_path.as_ref())?).await,
        Command::Crawl { code } => cmd_crawl(&config(config_path.as_ref())?, &code).await,
        Command::CrawlAll {
            force,
            skip_existing,
        } => {
            let mode = CrawlMode {
                force_update: force,
                skip_existing,
            };
            cmd_crawl_all(&config(config_path.as_ref())?, mode).await
        }
        Command::Lookup {
            number,
            region,
            refresh,
            json,
        } => {
            cmd_lookup(
                &config(config_path.as_ref())?,
                &number,
                region.as_deref(),
                refresh,
                json,
            )
            .await
        }
        Command::Serve => cmd_serve(),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config(config_path.as_ref())?),
        },
    }
}

fn config(path: Option<&PathBuf>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_discover(config: &AppConfig) -> Result<()> {
    let services = Services::from_config(config).await?;
    let stubs = services.crawler.discover_with_status().await?;

    let stored = stubs.iter().filter(|s| s.exists).count();
    for s in &stubs {
        let mark = if s.exists { "✓" } else { " " };
        println!("  {mark} {:<8} {}", s.stub.code, s.stub.name);
    }
    println!();
    println!("  {} institutions, {stored} stored", stubs.len());
    Ok(())
}

async fn cmd_crawl(config: &AppConfig, code: &str) -> Result<()> {
    let services = Services::from_config(config).await?;
    info!(code, "crawling institution");

    let outcome = services.crawler.crawl_code(code).await?;
    let institution = &outcome.institution;
    println!();
    println!("  {} {}", institution.code, institution.name);
    println!("  Action:   {:?}", outcome.action);
    println!("  Programs: {} ({:+})", institution.programs.len(), outcome.program_delta);
    println!();
    Ok(())
}

async fn cmd_crawl_all(config: &AppConfig, mode: CrawlMode) -> Result<()> {
    let services = Services::from_config(config).await?;
    let orchestrator = services.orchestrator.clone();

    let handle = orchestrator.start(mode).into_handle()?;
    info!(job_id = %handle.job_id, ?mode, "full crawl started");

    let progress = CliProgress::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut cancelling = false;
    let wait = handle.wait();
    tokio::pin!(wait);

    let snapshot = loop {
        tokio::select! {
            done = &mut wait => break done?,
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                cancelling = true;
                orchestrator.stop();
                progress.spinner.set_message("Cancelling after the current institution…");
            }
            _ = ticker.tick(), if !cancelling => progress.update(&orchestrator.status()),
        }
    };
    progress.spinner.finish_and_clear();

    print_summary(&snapshot);
    match snapshot.status {
        JobStatus::Failed => Err(eyre!(
            "crawl failed: {}",
            snapshot.error.as_deref().unwrap_or("unknown error")
        )),
        _ => Ok(()),
    }
}

fn print_summary(snapshot: &JobSnapshot) {
    let t = &snapshot.totals;
    println!();
    println!("  Crawl {}", snapshot.status.as_str());
    println!("  Discovered: {}", snapshot.total);
    println!("  Created:    {}", t.created);
    println!("  Updated:    {}", t.updated);
    println!("  Skipped:    {}", t.skipped);
    println!("  Errors:     {}", t.errors);
    println!("  Success:    {:.1}%", snapshot.success_rate);
    println!();
}

async fn cmd_lookup(
    config: &AppConfig,
    number: &str,
    region: Option<&str>,
    refresh: bool,
    json: bool,
) -> Result<()> {
    let services = Services::from_config(config).await?;
    let outcome = if refresh {
        services.lookup.refresh(number, region).await
    } else {
        services.lookup.lookup(number, region).await
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match outcome {
        LookupOutcome::Found(candidate) => {
            print_candidate(&candidate);
            Ok(())
        }
        LookupOutcome::NotFound => {
            println!("No results for candidate {number}.");
            Ok(())
        }
        LookupOutcome::InvalidKey { message } => Err(eyre!("invalid candidate number: {message}")),
        LookupOutcome::Failed { error } => Err(eyre!("lookup failed: {error}")),
    }
}

fn print_candidate(candidate: &Candidate) {
    println!();
    println!(
        "  Candidate {} ({}, {})",
        candidate.number, candidate.region, candidate.exam_year
    );
    println!("  Source: {}", candidate.provenance);
    if !candidate.provenance.is_authoritative() {
        println!("  Note: synthetic reference data, not an official result");
    }
    println!();
    for (subject, score) in &candidate.scores {
        println!("  {:<12} {score:>5.2}", subject.key());
    }
    if !candidate.rankings.is_empty() {
        println!();
        println!("  Combo  Total   Rank / Pool          Percentile");
        for r in &candidate.rankings {
            let est = if r.estimated { " (est.)" } else { "" };
            println!(
                "  {}    {:>5.2}  {:>7} / {:<9}  {:>6.2}{est}",
                r.combination, r.total_score, r.rank_position, r.total_candidates, r.percentile
            );
        }
    }
    println!();
}

fn cmd_serve() -> Result<()> {
    println!("The HTTP API ships as a separate binary:");
    println!();
    println!("  admitsync-server [--config <path>]");
    println!();
    println!("It binds to `[server] bind` from the config file.");
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Spinner fed by the orchestrator's progress counters.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(style);
        spinner.set_message("Discovering institutions");
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn update(&self, snapshot: &JobSnapshot) {
        if snapshot.total == 0 {
            return;
        }
        let t = &snapshot.totals;
        let done = t.processed + t.skipped + t.errors;
        self.spinner.set_message(format!(
            "Crawling [{done}/{}] created {} updated {} skipped {} errors {}",
            snapshot.total, t.created, t.updated, t.skipped, t.errors
        ));
    }
}
