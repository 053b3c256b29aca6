//! Worker configuration loading
//!
//! Resolution follows the same layering for every field:
//! 1. Command-line flag (applied by the binary after loading)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable naming an explicit TOML config file
pub const CONFIG_PATH_ENV: &str = "NEURODX_CONFIG";

/// Complete worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub redis: RedisConfig,
    pub postgres: PostgresConfig,
    pub storage: StorageConfig,
    pub model: ModelConfig,
    pub pipeline: PipelineConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
}

/// Task queue connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    /// List the producer pushes scan tasks onto
    pub queue: String,
    /// Blocking pop timeout; bounds how long shutdown waits on an idle queue
    pub poll_timeout_secs: u64,
    /// Pause after a queue error before popping again
    pub reconnect_delay_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            queue: "mri_tasks".to_string(),
            poll_timeout_secs: 5,
            reconnect_delay_ms: 1000,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Result database connection
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "mri".to_string(),
            max_connections: 2,
        }
    }
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// S3-compatible object store holding scans and artifacts
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `host:port`, or a full URL with scheme
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// Use HTTPS when the endpoint carries no scheme
    pub secure: bool,
    pub region: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            bucket: "mri-scans".to_string(),
            secure: false,
            region: "us-east-1".to_string(),
        }
    }
}

impl StorageConfig {
    /// Endpoint as a URL (scheme derived from `secure` when missing)
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else if self.secure {
            format!("https://{}", self.endpoint)
        } else {
            format!("http://{}", self.endpoint)
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("secure", &self.secure)
            .field("region", &self.region)
            .finish()
    }
}

/// Classifier weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// burn named-MessagePack record, or a PyTorch `state_dict` (`.pth`/`.pt`)
    pub weights_path: PathBuf,
    /// Optional JSON architecture override (DenseNet-121 otherwise)
    pub config_path: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            weights_path: PathBuf::from("./model/densenet121.mpk"),
            config_path: None,
        }
    }
}

/// Diagnostic pipeline parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Axial slices taken around the volume center
    pub num_slices: usize,
    /// Feature layer whose activations drive the localization map
    pub target_layer: String,
    /// Map values below this become zero (disabled when <= 0)
    pub threshold: f32,
    pub apply_blur: bool,
    pub blur_sigma: f32,
    /// Dump preprocessed slices as PNGs for inspection
    pub save_debug_slices: bool,
    pub debug_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_slices: 15,
            target_layer: "features.denseblock3".to_string(),
            threshold: 0.3,
            apply_blur: true,
            blur_sigma: 2.0,
            save_debug_slices: false,
            debug_dir: PathBuf::from("./debug_slices"),
        }
    }
}

/// Local working folders
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Downloaded volumes
    pub scan_dir: PathBuf,
    /// Rendered localization artifacts before upload
    pub artifact_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            scan_dir: PathBuf::from("./mri_scans"),
            artifact_dir: PathBuf::from("./gradcams"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level for the worker's own crates ("trace" .. "error")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration: TOML file (if any), then environment overrides, then validation
    pub fn load(cli_config: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_config_path(cli_config) {
            Some(path) => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::from_toml_file(&path)?
            }
            None => Self::default(),
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file; missing sections and fields take defaults
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Apply environment variable overrides
    ///
    /// Variable names match the ones the rest of the platform already exports.
    pub fn apply_env(&mut self) -> Result<()> {
        env_override("REDIS_HOST", &mut self.redis.host)?;
        env_override("REDIS_PORT", &mut self.redis.port)?;
        env_override("REDIS_QUEUE", &mut self.redis.queue)?;

        env_override("USER_DB_HOST", &mut self.postgres.host)?;
        env_override("USER_DB_PORT", &mut self.postgres.port)?;
        env_override("USER_DB_USER", &mut self.postgres.user)?;
        env_override("USER_DB_PASSWORD", &mut self.postgres.password)?;
        env_override("USER_DB_NAME", &mut self.postgres.database)?;

        env_override("MINIO_ENDPOINT", &mut self.storage.endpoint)?;
        env_override("MINIO_ACCESS_KEY", &mut self.storage.access_key)?;
        env_override("MINIO_SECRET_KEY", &mut self.storage.secret_key)?;
        env_override("MINIO_BUCKET", &mut self.storage.bucket)?;
        env_flag("MINIO_SECURE", &mut self.storage.secure)?;
        env_override("MINIO_REGION", &mut self.storage.region)?;

        env_override("NEURODX_MODEL_WEIGHTS", &mut self.model.weights_path)?;
        if let Ok(path) = std::env::var("NEURODX_MODEL_CONFIG") {
            if !path.trim().is_empty() {
                self.model.config_path = Some(PathBuf::from(path.trim()));
            }
        }

        env_override("NEURODX_NUM_SLICES", &mut self.pipeline.num_slices)?;
        env_override("NEURODX_TARGET_LAYER", &mut self.pipeline.target_layer)?;
        env_override("NEURODX_CAM_THRESHOLD", &mut self.pipeline.threshold)?;
        env_flag("NEURODX_CAM_BLUR", &mut self.pipeline.apply_blur)?;
        env_override("NEURODX_CAM_SIGMA", &mut self.pipeline.blur_sigma)?;
        env_flag("NEURODX_SAVE_DEBUG_SLICES", &mut self.pipeline.save_debug_slices)?;
        env_override("NEURODX_DEBUG_DIR", &mut self.pipeline.debug_dir)?;

        env_override("NEURODX_SCAN_DIR", &mut self.paths.scan_dir)?;
        env_override("NEURODX_ARTIFACT_DIR", &mut self.paths.artifact_dir)?;

        env_override("NEURODX_LOG_LEVEL", &mut self.logging.level)?;

        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.num_slices == 0 {
            return Err(Error::Config("pipeline.num_slices must be >= 1".to_string()));
        }
        if self.pipeline.apply_blur && !(self.pipeline.blur_sigma > 0.0) {
            return Err(Error::Config(format!(
                "pipeline.blur_sigma must be > 0 when blur is enabled (got {})",
                self.pipeline.blur_sigma
            )));
        }
        if !(self.pipeline.threshold < 1.0) {
            return Err(Error::Config(format!(
                "pipeline.threshold must be < 1.0 (got {})",
                self.pipeline.threshold
            )));
        }
        if self.pipeline.target_layer.trim().is_empty() {
            return Err(Error::Config("pipeline.target_layer is empty".to_string()));
        }
        if self.storage.bucket.trim().is_empty() {
            return Err(Error::Config("storage.bucket is empty".to_string()));
        }
        if self.redis.queue.trim().is_empty() {
            return Err(Error::Config("redis.queue is empty".to_string()));
        }
        Ok(())
    }
}

/// Config file resolution priority:
/// 1. Command-line argument
/// 2. `NEURODX_CONFIG` environment variable
/// 3. `~/.config/neurodx/worker.toml`
/// 4. `/etc/neurodx/worker.toml`
///
/// Returns `None` when no file applies (defaults + environment only).
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("neurodx").join("worker.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/neurodx/worker.toml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Overwrite `target` with the parsed value of `name`, if set
fn env_override<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{}={:?}: {}", name, raw, e)))?;
    }
    Ok(())
}

/// Boolean flags accept true/false, 1/0, yes/no (any case)
fn env_flag(name: &str, target: &mut bool) -> Result<()> {
    if let Ok(raw) = std::env::var(name) {
        *target = parse_flag(&raw)
            .ok_or_else(|| Error::Config(format!("{}={:?}: expected true or false", name, raw)))?;
    }
    Ok(())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
