use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::schema::{ColumnSpec, CompiledSchema};
use crate::ingest::FilePattern;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    pub schema: SchemaConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

/// Where to watch and where to store
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Directory scanned and watched for input files
    pub watch_dir: PathBuf,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    pub db_path: PathBuf,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Also watch sub-directories of watch_dir
    #[serde(default)]
    pub recursive: bool,
}

fn default_pattern() -> String {
    "*.csv".to_string()
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// File change detector tuning
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Quiet period a file's size and mtime must hold before it is emitted
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_true")]
    pub rescan_on_start: bool,
    /// Delay before re-establishing a failed watch
    #[serde(default = "default_watch_retry_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            rescan_on_start: true,
            retry_backoff_ms: default_watch_retry_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_watch_retry_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// What to do with a row that fails coercion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadRowPolicy {
    /// Reject the whole file, reporting the row index
    Abort,
    /// Drop the row with a warning
    Skip,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_bad_row_policy")]
    pub on_bad_row: BadRowPolicy,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Keep columns not declared in the schema as strings
    #[serde(default = "default_true")]
    pub allow_extra_columns: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size(),
            on_bad_row: default_bad_row_policy(),
            delimiter: default_delimiter(),
            allow_extra_columns: true,
        }
    }
}

fn default_max_file_size() -> u64 {
    64 * 1024 * 1024
}

fn default_bad_row_policy() -> BadRowPolicy {
    BadRowPolicy::Abort
}

fn default_delimiter() -> char {
    ','
}

/// Declared destination table and columns
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    #[serde(default = "default_retry_backoff_cap_ms")]
    pub retry_backoff_cap_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_max_wait_ms: default_batch_max_wait_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_cap_ms: default_retry_backoff_cap_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_batch_max_wait_ms() -> u64 {
    250
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_base_ms() -> u64 {
    200
}

fn default_retry_backoff_cap_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Age after which an in-progress claim may be taken over
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    /// Backoff before re-checking a hash claimed by another attempt
    #[serde(default = "default_requeue_backoff_ms")]
    pub requeue_backoff_ms: u64,
    #[serde(default = "default_requeue_backoff_cap_ms")]
    pub requeue_backoff_cap_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            claim_timeout_secs: default_claim_timeout_secs(),
            requeue_backoff_ms: default_requeue_backoff_ms(),
            requeue_backoff_cap_ms: default_requeue_backoff_cap_ms(),
        }
    }
}

fn default_claim_timeout_secs() -> u64 {
    600
}

fn default_requeue_backoff_ms() -> u64 {
    500
}

fn default_requeue_backoff_cap_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Files processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Budget for the Parsing+Syncing span of one file
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// How long Synced/Failed files stay visible in the registry
    #[serde(default = "default_retain_terminal_secs")]
    pub retain_terminal_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default)]
    pub health_file: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            file_timeout_secs: default_file_timeout_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            retain_terminal_secs: default_retain_terminal_secs(),
            health_interval_secs: default_health_interval_secs(),
            health_file: None,
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_file_timeout_secs() -> u64 {
    300
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_retain_terminal_secs() -> u64 {
    3600
}

fn default_health_interval_secs() -> u64 {
    30
}

/// Downstream subscribers
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    /// Append each event as a JSON line to this file
    #[serde(default)]
    pub event_log: Option<PathBuf>,
    /// POST each event as JSON to this URL
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,
    #[serde(default = "default_webhook_max_attempts")]
    pub webhook_max_attempts: u32,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            event_log: None,
            webhook_url: None,
            webhook_timeout_ms: default_webhook_timeout_ms(),
            webhook_max_attempts: default_webhook_max_attempts(),
        }
    }
}

fn default_webhook_timeout_ms() -> u64 {
    5000
}

fn default_webhook_max_attempts() -> u32 {
    3
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in TABSYNC_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("TABSYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml_str(&config_str)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        config.validate_watch_dir()?;
        Ok(config)
    }

    /// Parse and validate everything except the watch directory's existence.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        FilePattern::new(&self.pipeline.pattern)?;
        self.compiled_schema()?;

        if !self.parser.delimiter.is_ascii() {
            anyhow::bail!("parser.delimiter must be a single ASCII character");
        }
        if self.parser.max_file_size_bytes == 0 {
            anyhow::bail!("parser.max_file_size_bytes must be greater than 0");
        }
        if self.sync.batch_size == 0 {
            anyhow::bail!("sync.batch_size must be greater than 0");
        }
        if self.sync.retry_max_attempts == 0 {
            anyhow::bail!("sync.retry_max_attempts must be at least 1");
        }
        if self.sync.retry_backoff_base_ms > self.sync.retry_backoff_cap_ms {
            anyhow::bail!("sync.retry_backoff_base_ms must not exceed sync.retry_backoff_cap_ms");
        }
        if self.ledger.requeue_backoff_ms > self.ledger.requeue_backoff_cap_ms {
            anyhow::bail!("ledger.requeue_backoff_ms must not exceed ledger.requeue_backoff_cap_ms");
        }
        if self.ledger.claim_timeout_secs == 0 {
            anyhow::bail!("ledger.claim_timeout_secs must be greater than 0");
        }
        if self.coordinator.workers == 0 {
            anyhow::bail!("coordinator.workers must be greater than 0");
        }
        if self.coordinator.file_timeout_secs == 0 {
            anyhow::bail!("coordinator.file_timeout_secs must be greater than 0");
        }
        if self.notifications.webhook_max_attempts == 0 {
            anyhow::bail!("notifications.webhook_max_attempts must be at least 1");
        }
        Ok(())
    }

    /// The watch directory must exist at startup; failure here is fatal.
    pub fn validate_watch_dir(&self) -> Result<()> {
        let dir = &self.pipeline.watch_dir;
        if !dir.exists() {
            anyhow::bail!(
                "watch_dir path does not exist: {}. Set pipeline.watch_dir in config.toml to your drop folder.",
                dir.display()
            );
        }
        if !dir.is_dir() {
            anyhow::bail!("watch_dir must be a directory, not a file: {}", dir.display());
        }
        std::fs::read_dir(dir).with_context(|| format!("Cannot read watch_dir: {}", dir.display()))?;
        Ok(())
    }

    pub fn compiled_schema(&self) -> Result<CompiledSchema> {
        Ok(CompiledSchema::compile(&self.schema.table, &self.schema.columns)?)
    }

    pub fn file_pattern(&self) -> Result<FilePattern> {
        Ok(FilePattern::new(&self.pipeline.pattern)?)
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.pipeline.db_path
    }

    pub fn watch_dir(&self) -> &Path {
        &self.pipeline.watch_dir
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.pipeline.migrations_dir
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.detector.debounce_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger.claim_timeout_secs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn sample_toml(watch_dir: &Path, db_path: &Path) -> String {
        let esc = |p: &Path| p.to_str().unwrap().replace('\\', "\\\\");
        format!(
            r#"
[pipeline]
watch_dir = "{}"
db_path = "{}"
log_level = "debug"

[detector]
debounce_ms = 50

[schema]
table = "products"
columns = [
    {{ name = "product_id", type = "string" }},
    {{ name = "price", type = "number" }},
    {{ name = "listed_at", type = "timestamp" }},
    {{ name = "rating", type = "number", required = false }},
]

[sync]
batch_size = 2
"#,
            esc(watch_dir),
            esc(db_path)
        )
    }

    fn with_config_env(config_path: &Path, f: impl FnOnce()) {
        let original = std::env::var("TABSYNC_CONFIG").ok();
        std::env::set_var("TABSYNC_CONFIG", config_path.to_str().unwrap());
        f();
        std::env::remove_var("TABSYNC_CONFIG");
        if let Some(val) = original {
            std::env::set_var("TABSYNC_CONFIG", val);
        }
    }

    #[test]
    fn test_config_load_success() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, sample_toml(temp_dir.path(), &temp_dir.path().join("t.db"))).unwrap();
        with_config_env(&config_path, || {
            let config = Config::load();
            assert!(config.is_ok(), "Config::load() failed: {:?}", config.err());
            let config = config.unwrap();
            assert_eq!(config.pipeline.log_level, "debug");
            assert_eq!(config.pipeline.pattern, "*.csv");
            assert_eq!(config.detector.debounce_ms, 50);
            assert_eq!(config.sync.batch_size, 2);
            assert_eq!(config.sync.retry_max_attempts, 5);
            assert_eq!(config.parser.on_bad_row, BadRowPolicy::Abort);
            assert_eq!(config.coordinator.workers, 4);
            assert_eq!(config.compiled_schema().unwrap().columns.len(), 4);
        });
    }

    #[test]
    fn test_config_missing_watch_dir_is_fatal() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let missing = temp_dir.path().join("does-not-exist");
        fs::write(&config_path, sample_toml(&missing, &temp_dir.path().join("t.db"))).unwrap();
        with_config_env(&config_path, || {
            let err = Config::load().unwrap_err();
            assert!(err.to_string().contains("watch_dir"));
        });
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        with_config_env(Path::new("nonexistent.toml"), || {
            assert!(Config::load().is_err());
        });
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let temp_dir = TempDir::new().unwrap();
        let base = sample_toml(temp_dir.path(), &temp_dir.path().join("t.db"));

        let zero_batch = base.replace("batch_size = 2", "batch_size = 0");
        assert!(Config::from_toml_str(&zero_batch).is_err());

        let bad_type = base.replace(r#"type = "number" },"#, r#"type = "decimal" },"#);
        assert!(Config::from_toml_str(&bad_type).is_err());

        let bad_pattern = base.replace(
            "log_level = \"debug\"",
            "log_level = \"debug\"\npattern = \"[\"",
        );
        assert!(Config::from_toml_str(&bad_pattern).is_err());

        let inverted = base.replace(
            "batch_size = 2",
            "batch_size = 2\nretry_backoff_base_ms = 500\nretry_backoff_cap_ms = 100",
        );
        assert!(Config::from_toml_str(&inverted).is_err());
    }

    #[test]
    fn test_bad_row_policy_parses() {
        let temp_dir = TempDir::new().unwrap();
        let toml = sample_toml(temp_dir.path(), &temp_dir.path().join("t.db"))
            + "\n[parser]\non_bad_row = \"skip\"\ndelimiter = \";\"\n";
        let config = Config::from_toml_str(&toml).unwrap();
        assert_eq!(config.parser.on_bad_row, BadRowPolicy::Skip);
        assert_eq!(config.parser.delimiter, ';');
    }
}
