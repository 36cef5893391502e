//! Layered configuration: a TOML file plus `ASKESIS_`-prefixed environment
//! overrides, loaded once into a `OnceCell<AppConfig>` global. Every tunable
//! named in spec.md §6 (debounce windows, retry counts, PBKDF2 iterations,
//! archive threshold, boot timeout, worker timeout) gets its own
//! `#[serde(default = "...")]` field so a deployment can override exactly one
//! knob without restating the whole section.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

static CONFIG: OnceCell<AppConfig> = OnceCell::new();

/// Vault server bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

/// CORS configuration for the vault server's HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "CorsConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default = "CorsConfig::default_allow_credentials")]
    pub allow_credentials: bool,
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

impl CorsConfig {
    fn default_enabled() -> bool {
        false
    }

    fn default_allow_credentials() -> bool {
        false
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            allowed_origins: Vec::new(),
            allowed_methods: Vec::new(),
            allowed_headers: Vec::new(),
            expose_headers: Vec::new(),
            allow_credentials: Self::default_allow_credentials(),
            max_age_secs: None,
        }
    }
}

/// Graceful-shutdown timing for the vault server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "ShutdownConfig::default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "ShutdownConfig::default_force")]
    pub force_quit: bool,
    #[serde(default = "ShutdownConfig::default_force_delay")]
    pub force_delay_secs: u64,
}

impl ShutdownConfig {
    fn default_timeout() -> u64 {
        30
    }
    fn default_force() -> bool {
        true
    }
    fn default_force_delay() -> u64 {
        10
    }

    pub fn timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    pub fn force_delay_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.force_delay_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout(),
            force_quit: Self::default_force(),
            force_delay_secs: Self::default_force_delay(),
        }
    }
}

/// Where the split-store SQLite database lives on disk (spec.md §4.3/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "PersistenceConfig::default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "PersistenceConfig::default_save_debounce_ms")]
    pub save_debounce_ms: u64,
}

impl PersistenceConfig {
    fn default_sqlite_path() -> String {
        "./askesis-state.db".to_string()
    }
    fn default_save_debounce_ms() -> u64 {
        800
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            sqlite_path: Self::default_sqlite_path(),
            save_debounce_ms: Self::default_save_debounce_ms(),
        }
    }
}

/// PBKDF2/AES-GCM parameters. Mirrors the literal constants in
/// `crate::crypto::codec` (spec.md §6 treats these as binding, not
/// operator-tunable); kept here so deployments can see/assert the values a
/// given build was compiled with without reading source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default = "CryptoConfig::default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
    #[serde(default = "CryptoConfig::default_salt_len")]
    pub salt_len: usize,
    #[serde(default = "CryptoConfig::default_iv_len")]
    pub iv_len: usize,
}

impl CryptoConfig {
    fn default_pbkdf2_iterations() -> u32 {
        100_000
    }
    fn default_salt_len() -> usize {
        16
    }
    fn default_iv_len() -> usize {
        12
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: Self::default_pbkdf2_iterations(),
            salt_len: Self::default_salt_len(),
            iv_len: Self::default_iv_len(),
        }
    }
}

/// Sync push/pull tuning (spec.md §4.5/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "SyncConfig::default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "SyncConfig::default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "SyncConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "SyncConfig::default_base_backoff_ms")]
    pub base_backoff_ms: u64,
}

impl SyncConfig {
    fn default_debounce_ms() -> u64 {
        2000
    }
    fn default_http_timeout_secs() -> u64 {
        15
    }
    fn default_max_retries() -> u32 {
        2
    }
    fn default_base_backoff_ms() -> u64 {
        500
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: Self::default_debounce_ms(),
            http_timeout_secs: Self::default_http_timeout_secs(),
            max_retries: Self::default_max_retries(),
            base_backoff_ms: Self::default_base_backoff_ms(),
        }
    }
}

/// Archival threshold (spec.md §4.6 `performArchivalCheck`, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "ArchiveConfig::default_threshold_days")]
    pub threshold_days: i64,
}

impl ArchiveConfig {
    fn default_threshold_days() -> i64 {
        90
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            threshold_days: Self::default_threshold_days(),
        }
    }
}

/// Bootstrapper tuning (spec.md §4.7/§6: max attempts, boot sync timeout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    #[serde(default = "BootConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "BootConfig::default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

impl BootConfig {
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_sync_timeout_ms() -> u64 {
        4000
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            sync_timeout_ms: Self::default_sync_timeout_ms(),
        }
    }
}

/// Worker-bridge task timeout (spec.md §5/§6: 30s safety timeout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "WorkerConfig::default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl WorkerConfig {
    fn default_task_timeout_secs() -> u64 {
        30
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: Self::default_task_timeout_secs(),
        }
    }
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Loads `config.toml` (if present) layered under `ASKESIS_`-prefixed
    /// environment variables, e.g. `ASKESIS_SERVER_PORT=4000`.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path();
        tracing::info!(path = ?config_path, "loading configuration");

        let builder = ConfigBuilder::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3939)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "full")?
            .add_source(File::with_name(config_path.to_str().unwrap_or("config")).required(false))
            .add_source(
                Environment::with_prefix("ASKESIS")
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?;

        builder.try_deserialize()
    }

    pub fn global() -> &'static AppConfig {
        CONFIG.get().expect("config not initialized; call init_global() first")
    }

    pub fn init_global() -> Result<(), ConfigError> {
        let config = Self::load()?;
        CONFIG
            .set(config)
            .map_err(|_| ConfigError::Message("config already initialized".to_string()))?;
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3939,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "full".to_string(),
            },
            cors: CorsConfig::default(),
            shutdown: ShutdownConfig::default(),
            persistence: PersistenceConfig::default(),
            crypto: CryptoConfig::default(),
            sync: SyncConfig::default(),
            archive: ArchiveConfig::default(),
            boot: BootConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl AppConfig {
    fn get_config_path() -> PathBuf {
        PathBuf::from(std::env::var("ASKESIS_CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_mandated_constants() {
        let config = AppConfig::default();
        assert_eq!(config.crypto.pbkdf2_iterations, 100_000);
        assert_eq!(config.crypto.salt_len, 16);
        assert_eq!(config.crypto.iv_len, 12);
        assert_eq!(config.archive.threshold_days, 90);
        assert_eq!(config.boot.max_attempts, 3);
        assert_eq!(config.worker.task_timeout_secs, 30);
        assert_eq!(config.persistence.save_debounce_ms, 800);
        assert_eq!(config.sync.debounce_ms, 2000);
        assert_eq!(config.sync.max_retries, 2);
    }

    #[test]
    fn server_addr_combines_host_and_port() {
        let config = AppConfig::default();
        assert_eq!(config.server_addr(), "0.0.0.0:3939");
    }
}
