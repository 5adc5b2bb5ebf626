use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the image store
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Chunked storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Which implementation backs the chunked blob store
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

/// What happens to older records once an upload completes.
///
/// The store API can hold many records, but the service runs it as a single
/// slot unless told otherwise: each successful upload supersedes everything
/// else in the bucket.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMode {
    /// Keep only the most recent upload
    SingleActive,
    /// Keep every upload
    KeepAll,
}

/// Chunked storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Store implementation
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Logical partition every record lives in
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Size of every chunk except the last, in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
    /// Retention policy applied after each upload
    #[serde(default = "default_retention")]
    pub retention: RetentionMode,
    /// Maximum concurrent deletions during reconciliation
    #[serde(default = "default_reconcile_concurrency")]
    pub reconcile_concurrency: usize,
    /// Upper bound on an upload request body
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "image-store".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_database_url() -> String {
    "postgres://localhost/profilepic".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_backend() -> StorageBackend {
    StorageBackend::Postgres
}

fn default_bucket() -> String {
    "uploads".to_string()
}

fn default_chunk_size() -> usize {
    255 * 1024 // 261120 bytes
}

fn default_retention() -> RetentionMode {
    RetentionMode::SingleActive
}

fn default_reconcile_concurrency() -> usize {
    4
}

fn default_max_upload_bytes() -> usize {
    16 * 1024 * 1024 // 16MB
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(
                config::File::with_name("config/image-store")
                    .required(false)
            )
            .add_source(
                config::File::with_name("/etc/image-store/config")
                    .required(false)
            )
            // Override with environment variables
            // IMAGE_STORE__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("IMAGE_STORE")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.storage.chunk_size_bytes > 0,
            "storage.chunk_size_bytes must be greater than zero"
        );
        anyhow::ensure!(
            i32::try_from(self.storage.chunk_size_bytes).is_ok(),
            "storage.chunk_size_bytes must fit in 32 bits"
        );
        anyhow::ensure!(
            self.storage.reconcile_concurrency > 0,
            "storage.reconcile_concurrency must be greater than zero"
        );
        anyhow::ensure!(
            !self.storage.bucket.is_empty(),
            "storage.bucket must not be empty"
        );
        Ok(())
    }
}

impl DatabaseConfig {
    /// How long to wait for a pooled connection
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// How long an unused connection stays open
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_true(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            bucket: default_bucket(),
            chunk_size_bytes: default_chunk_size(),
            retention: default_retention(),
            reconcile_concurrency: default_reconcile_concurrency(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}
