//! Configuration management.
//!
//! streamline configuration can come from:
//! - Environment variables (STREAMLINE_*)
//! - Config file (~/.config/streamline/config.toml)

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// streamline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Step executor limits
    #[serde(default)]
    pub engine: EngineConfig,

    /// Schedule sweep configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Outgoing email
    #[serde(default)]
    pub email: EmailConfig,

    /// E-signature provider
    #[serde(default)]
    pub esign: EsignConfig,

    /// Prometheus exporter
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Step executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout for synchronous web-request steps (seconds)
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,

    /// Execution budget for script steps (milliseconds)
    #[serde(default = "default_script_budget")]
    pub script_budget_ms: u64,

    /// Steps run in a single turn before the executor yields
    #[serde(default = "default_max_steps_per_turn")]
    pub max_steps_per_turn: usize,

    /// Swapped or spawned instances run in the same `advance` call
    #[serde(default = "default_max_follow_ups")]
    pub max_follow_ups: usize,

    /// Published definitions kept in memory
    #[serde(default = "default_definition_cache_capacity")]
    pub definition_cache_capacity: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_timeout_seconds: default_http_timeout(),
            script_budget_ms: default_script_budget(),
            max_steps_per_turn: default_max_steps_per_turn(),
            max_follow_ups: default_max_follow_ups(),
            definition_cache_capacity: default_definition_cache_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn script_budget(&self) -> Duration {
        Duration::from_millis(self.script_budget_ms)
    }
}

fn default_http_timeout() -> u64 {
    30
}

fn default_script_budget() -> u64 {
    120_000
}

fn default_max_steps_per_turn() -> usize {
    64
}

fn default_max_follow_ups() -> usize {
    16
}

fn default_definition_cache_capacity() -> u64 {
    256
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Six-field cron expression (with seconds) for the sweep job
    #[serde(default = "default_sweep_cron")]
    pub sweep_cron: String,

    /// Attempts before a scheduled execution is permanently failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timezone for schedules that do not declare one
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_cron: default_sweep_cron(),
            max_retries: default_max_retries(),
            default_timezone: default_timezone(),
        }
    }
}

fn default_sweep_cron() -> String {
    "0 * * * * *".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Email provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// "log", "resend" or "sendgrid"
    #[serde(default = "default_email_provider")]
    pub provider: String,

    /// Sender address
    #[serde(default = "default_email_from")]
    pub from: String,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: default_email_provider(),
            from: default_email_from(),
            api_key: None,
        }
    }
}

fn default_email_provider() -> String {
    "log".to_string()
}

fn default_email_from() -> String {
    "no-reply@streamline.local".to_string()
}

/// E-signature provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EsignConfig {
    /// Envelope endpoint; e-sign steps fail when unset
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address for the Prometheus scrape endpoint
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Load configuration from an explicit file, then apply env overrides.
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let partial: PartialConfig = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::default();
        config.apply_partial(partial);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("streamline"))
            .unwrap_or_else(|| PathBuf::from(".streamline"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("streamline"))
            .unwrap_or_else(|| PathBuf::from(".streamline"))
    }

    /// Resolved database path.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("streamline.db"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STREAMLINE_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Ok(timeout) = std::env::var("STREAMLINE_HTTP_TIMEOUT_SECONDS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                self.engine.http_timeout_seconds = parsed;
            }
        }
        if let Ok(budget) = std::env::var("STREAMLINE_SCRIPT_BUDGET_MS") {
            if let Ok(parsed) = budget.parse::<u64>() {
                self.engine.script_budget_ms = parsed;
            }
        }
        if let Ok(cron) = std::env::var("STREAMLINE_SWEEP_CRON") {
            self.scheduler.sweep_cron = cron;
        }
        if let Ok(retries) = std::env::var("STREAMLINE_MAX_RETRIES") {
            if let Ok(parsed) = retries.parse::<u32>() {
                self.scheduler.max_retries = parsed;
            }
        }
        if let Ok(provider) = std::env::var("STREAMLINE_EMAIL_PROVIDER") {
            self.email.provider = provider;
        }
        if let Ok(from) = std::env::var("STREAMLINE_EMAIL_FROM") {
            self.email.from = from;
        }
        if let Ok(key) = std::env::var("STREAMLINE_EMAIL_API_KEY") {
            self.email.api_key = Some(key);
        }
        if let Ok(endpoint) = std::env::var("STREAMLINE_ESIGN_ENDPOINT") {
            self.esign.endpoint = Some(endpoint);
        }
        if let Ok(key) = std::env::var("STREAMLINE_ESIGN_API_KEY") {
            self.esign.api_key = Some(key);
        }
        if let Ok(listen) = std::env::var("STREAMLINE_METRICS_LISTEN") {
            if let Ok(parsed) = listen.parse::<SocketAddr>() {
                self.metrics.listen = Some(parsed);
            }
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(scheduler) = partial.scheduler {
            self.scheduler = scheduler;
        }
        if let Some(email) = partial.email {
            self.email = email;
        }
        if let Some(esign) = partial.esign {
            self.esign = esign;
        }
        if let Some(metrics) = partial.metrics {
            self.metrics = metrics;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    storage: Option<StorageConfig>,
    engine: Option<EngineConfig>,
    scheduler: Option<SchedulerConfig>,
    email: Option<EmailConfig>,
    esign: Option<EsignConfig>,
    metrics: Option<MetricsConfig>,
}
