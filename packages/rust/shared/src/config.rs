//! Application configuration for admitsync.
//!
//! User config lives at `~/.admitsync/admitsync.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdmitError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "admitsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".admitsync";

// ---------------------------------------------------------------------------
// Config structs (matching admitsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// External catalog site endpoints.
    #[serde(default)]
    pub source: SourceConfig,

    /// Batch crawl pacing.
    #[serde(default)]
    pub crawl: CrawlPoliciesConfig,

    /// Headless browser settings (Strategy B).
    #[serde(default)]
    pub browser: BrowserSettings,

    /// On-demand lookup settings.
    #[serde(default)]
    pub lookup: LookupSettings,

    /// Local store.
    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP server.
    #[serde(default)]
    pub server: ServerConfig,
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Catalog index page listing every institution.
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,

    /// Static score page; `{number}` and `{region}` are substituted.
    #[serde(default = "default_score_url")]
    pub score_url_template: String,

    /// Client-rendered lookup form used by the browser strategy.
    #[serde(default = "default_lookup_form_url")]
    pub lookup_form_url: String,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Override the User-Agent header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            catalog_url: default_catalog_url(),
            score_url_template: default_score_url(),
            lookup_form_url: default_lookup_form_url(),
            timeout_secs: default_timeout_secs(),
            user_agent: None,
        }
    }
}

fn default_catalog_url() -> String {
    "https://tuyensinh.example.vn/diem-chuan".into()
}
fn default_score_url() -> String {
    "https://tuyensinh.example.vn/diem-thi?sbd={number}&region={region}".into()
}
fn default_lookup_form_url() -> String {
    "https://tuyensinh.example.vn/tra-cuu-diem-thi".into()
}
fn default_timeout_secs() -> u64 {
    20
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPoliciesConfig {
    /// Base delay between successful requests, in ms.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound of the random jitter added to the base delay, in ms.
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,

    /// Backoff after a failed item, in ms.
    #[serde(default = "default_error_delay")]
    pub error_delay_ms: u64,

    /// Log progress every N items.
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
}

impl Default for CrawlPoliciesConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            jitter_ms: default_jitter(),
            error_delay_ms: default_error_delay(),
            progress_every: default_progress_every(),
        }
    }
}

fn default_base_delay() -> u64 {
    1500
}
fn default_jitter() -> u64 {
    1000
}
fn default_error_delay() -> u64 {
    5000
}
fn default_progress_every() -> usize {
    10
}

/// `[browser]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSettings {
    /// Whether the browser strategy participates in the chain.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Run without a visible window.
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Path to a Chrome/Chromium binary (auto-detected when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,

    /// Maximum time to wait for results after submission, in seconds.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// DOM polling interval, in ms.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            headless: true,
            executable: None,
            poll_timeout_secs: default_poll_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_poll_timeout() -> u64 {
    15
}
fn default_poll_interval() -> u64 {
    500
}

/// `[lookup]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupSettings {
    /// Default exam region when the caller gives none.
    #[serde(default = "default_region")]
    pub default_region: String,

    /// Enable the synthetic fallback (demo/offline data only).
    #[serde(default)]
    pub synthetic_fallback: bool,

    /// Store polls in the delegated-trigger variant.
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    /// Interval between store polls, in ms.
    #[serde(default = "default_lookup_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for LookupSettings {
    fn default() -> Self {
        Self {
            default_region: default_region(),
            synthetic_fallback: false,
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_lookup_poll_interval(),
        }
    }
}

fn default_region() -> String {
    "ha-noi".into()
}
fn default_poll_attempts() -> u32 {
    5
}
fn default_lookup_poll_interval() -> u64 {
    1000
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "var/admitsync.db".into()
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the HTTP server binds to.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (derived from AppConfig)
// ---------------------------------------------------------------------------

/// Runtime crawl pacing, shared by the batch and synchronous loops.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub base_delay: Duration,
    pub jitter: Duration,
    pub error_delay: Duration,
    pub progress_every: usize,
}

impl CrawlConfig {
    /// No pacing at all (tests, local fixtures).
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            error_delay: Duration::ZERO,
            progress_every: 10,
        }
    }
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.crawl.base_delay_ms),
            jitter: Duration::from_millis(config.crawl.jitter_ms),
            error_delay: Duration::from_millis(config.crawl.error_delay_ms),
            progress_every: config.crawl.progress_every.max(1),
        }
    }
}

/// Runtime lookup configuration.
#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub default_region: String,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

impl From<&AppConfig> for LookupConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            default_region: config.lookup.default_region.clone(),
            poll_attempts: config.lookup.poll_attempts,
            poll_interval: Duration::from_millis(config.lookup.poll_interval_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.admitsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| AdmitError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.admitsync/admitsync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| AdmitError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| AdmitError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| AdmitError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| AdmitError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| AdmitError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check the source URLs parse and the lookup template carries its placeholders.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    for (field, value) in [
        ("source.catalog_url", &config.source.catalog_url),
        ("source.lookup_form_url", &config.source.lookup_form_url),
    ] {
        url::Url::parse(value)
            .map_err(|e| AdmitError::config(format!("{field} is not a valid URL: {e}")))?;
    }

    if !config.source.score_url_template.contains("{number}") {
        return Err(AdmitError::config(
            "source.score_url_template must contain a {number} placeholder",
        ));
    }

    if config.lookup.poll_attempts == 0 {
        return Err(AdmitError::config("lookup.poll_attempts must be at least 1"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("catalog_url"));
        assert!(toml_str.contains("{number}"));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[crawl]
base_delay_ms = 0

[lookup]
synthetic_fallback = true
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.crawl.base_delay_ms, 0);
        assert_eq!(config.crawl.error_delay_ms, 5000);
        assert!(config.lookup.synthetic_fallback);
        assert_eq!(config.lookup.poll_attempts, 5);
        assert!(config.browser.enabled);
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let app = AppConfig::default();
        let crawl = CrawlConfig::from(&app);
        assert_eq!(crawl.base_delay, Duration::from_millis(1500));
        assert_eq!(crawl.progress_every, 10);

        let lookup = LookupConfig::from(&app);
        assert_eq!(lookup.poll_attempts, 5);
        assert_eq!(lookup.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn validation_rejects_template_without_placeholder() {
        let mut config = AppConfig::default();
        assert!(validate_config(&config).is_ok());

        config.source.score_url_template = "https://example.vn/scores".into();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("{number}"));
    }
}
