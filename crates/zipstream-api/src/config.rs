//! Server configuration, read from environment variables.
//!
//! Every knob is an environment key; an optional dotenv-style file is
//! loaded by `main` before this module reads the environment. Malformed
//! values are startup errors, not silent defaults.

use std::path::PathBuf;
use std::time::Duration;

use zipstream_core::breaker::BreakerConfig;
use zipstream_core::db::{Engine, StoreConfig};
use zipstream_core::storage::{RetryPolicy, S3Options};
use zipstream_core::{Error, Result};

/// Object storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// S3-compatible object store.
    S3,
    /// Local filesystem rooted at `STORAGE_PATH`.
    Local,
}

/// Configuration for the zipstream server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Manifest store connection URL (`DB_URL`, required).
    pub db_url: String,
    /// Manifest store engine, inferred from the URL scheme unless
    /// `DB_ENGINE` overrides it.
    pub db_engine: Engine,
    /// Manifest store pool size (`DB_MAX_CONNECTIONS`).
    pub db_max_connections: u32,
    /// Table holding manifests (`TABLE_NAME`, tabular family).
    pub table_name: String,
    /// Id column name (`ID_FIELD`, tabular family).
    pub id_field: String,
    /// Key prefix (`KEY_PREFIX`, key-value family).
    pub key_prefix: String,

    /// Object backend selection (`STORAGE_TYPE`; auto-detected from
    /// `STORAGE_PATH` when unset).
    pub storage_type: StorageType,
    /// Base directory for the filesystem backend (`STORAGE_PATH`).
    pub storage_path: Option<PathBuf>,
    /// S3 connection options (`S3_*`).
    pub s3: S3Options,

    /// Require a valid signature on every request (`ENFORCE_SIGNING`).
    pub enforce_signing: bool,
    /// HMAC secret (`SIGNING_SECRET`).
    pub signing_secret: Vec<u8>,

    /// Skip missing objects instead of failing the download
    /// (`IGNORE_MISSING`).
    pub ignore_missing: bool,
    /// Per-request fetch parallelism (`MAX_CONCURRENT_FETCHES`, >= 1).
    pub max_concurrent_fetches: usize,
    /// Global concurrent-download cap (`MAX_ACTIVE_DOWNLOADS`, 0 = off).
    pub max_active_downloads: usize,
    /// Per-request object count cap (`MAX_FILES_PER_REQUEST`, 0 = off).
    pub max_files_per_request: usize,
    /// Per-IP token rate in requests/second (`RATE_LIMIT_PER_IP`, 0 = off).
    pub rate_limit_per_ip: f64,

    /// Extension allow list (`ALLOWED_EXTENSIONS`; empty = allow all).
    pub allowed_extensions: Vec<String>,
    /// Extension block list (`BLOCKED_EXTENSIONS`; wins over allow).
    pub blocked_extensions: Vec<String>,

    /// Accept manifests with passwords (`ALLOW_PASSWORD_PROTECTED`).
    ///
    /// The streaming encoder carries no per-entry encryption, so this flag
    /// only controls whether a warning is logged; see DESIGN.md.
    pub allow_password_protected: bool,
    /// Append `-YYYYMMDD` to archive names (`APPEND_YMD`).
    pub append_ymd: bool,
    /// Sanitize archive names (`SANITIZE_FILENAMES`).
    pub sanitize_filenames: bool,

    /// Manifest lookup deadline (`DATABASE_QUERY_TIMEOUT`).
    pub database_query_timeout: Duration,
    /// Per-attempt object fetch deadline (`STORAGE_FETCH_TIMEOUT`).
    pub storage_fetch_timeout: Duration,
    /// Whole-request deadline (`REQUEST_TIMEOUT`).
    pub request_timeout: Duration,

    /// Extra fetch attempts on transient failures (`STORAGE_MAX_RETRIES`).
    pub storage_max_retries: u32,
    /// Base retry backoff (`STORAGE_RETRY_DELAY`).
    pub storage_retry_delay: Duration,

    /// Failures before the breaker opens (`CIRCUIT_BREAKER_THRESHOLD`).
    pub circuit_breaker_threshold: u32,
    /// Open duration before probing (`CIRCUIT_BREAKER_TIMEOUT`).
    pub circuit_breaker_timeout: Duration,
    /// Probe budget while half-open (`CIRCUIT_BREAKER_MAX_REQUESTS`).
    pub circuit_breaker_max_requests: u32,

    /// Callback retry budget (`CALLBACK_MAX_RETRIES`).
    pub callback_max_retries: u32,
    /// Callback base retry delay (`CALLBACK_RETRY_DELAY`).
    pub callback_retry_delay: Duration,

    /// HTTP listen port (`PORT`).
    pub port: u16,
    /// Basic auth user for `/metrics` (`METRICS_USERNAME`).
    pub metrics_username: Option<String>,
    /// Basic auth password for `/metrics` (`METRICS_PASSWORD`).
    pub metrics_password: Option<String>,
}

impl Config {
    /// Reads configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when a required key is missing, a
    /// value cannot be parsed, or the combination is invalid.
    pub fn from_env() -> Result<Self> {
        let db_url = env_string("DB_URL")
            .ok_or_else(|| Error::InvalidInput("DB_URL is required".to_string()))?;
        let db_engine = match env_string("DB_ENGINE") {
            Some(engine) => Engine::from_scheme(&engine)?,
            None => Engine::from_scheme(url_scheme(&db_url)?)?,
        };

        let storage_path = env_string("STORAGE_PATH").map(PathBuf::from);
        let storage_type = match env_string("STORAGE_TYPE").as_deref() {
            Some("s3") => StorageType::S3,
            Some("local") => StorageType::Local,
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "unsupported storage type: {other}"
                )))
            }
            // Auto-detect: a configured path means local, otherwise s3.
            None if storage_path.is_some() => StorageType::Local,
            None => StorageType::S3,
        };

        let config = Self {
            db_url,
            db_engine,
            db_max_connections: env_u32("DB_MAX_CONNECTIONS")?.unwrap_or(20),
            table_name: env_string("TABLE_NAME").unwrap_or_else(|| "downloads".to_string()),
            id_field: env_string("ID_FIELD").unwrap_or_else(|| "id".to_string()),
            key_prefix: env_string("KEY_PREFIX").unwrap_or_default(),
            storage_type,
            storage_path,
            s3: S3Options {
                endpoint: env_string("S3_ENDPOINT"),
                region: env_string("S3_REGION").unwrap_or_else(|| "auto".to_string()),
                access_key_id: env_string("S3_ACCESS_KEY_ID"),
                secret_access_key: env_string("S3_SECRET_ACCESS_KEY"),
                use_path_style: env_bool("S3_USE_PATH_STYLE")?.unwrap_or(false),
            },
            enforce_signing: env_bool("ENFORCE_SIGNING")?.unwrap_or(false),
            signing_secret: env_string("SIGNING_SECRET")
                .map(String::into_bytes)
                .unwrap_or_default(),
            ignore_missing: env_bool("IGNORE_MISSING")?.unwrap_or(false),
            max_concurrent_fetches: env_usize("MAX_CONCURRENT_FETCHES")?.unwrap_or(10),
            max_active_downloads: env_usize("MAX_ACTIVE_DOWNLOADS")?.unwrap_or(0),
            max_files_per_request: env_usize("MAX_FILES_PER_REQUEST")?.unwrap_or(0),
            rate_limit_per_ip: env_f64("RATE_LIMIT_PER_IP")?.unwrap_or(0.0),
            allowed_extensions: env_list("ALLOWED_EXTENSIONS"),
            blocked_extensions: env_list("BLOCKED_EXTENSIONS"),
            allow_password_protected: env_bool("ALLOW_PASSWORD_PROTECTED")?.unwrap_or(false),
            append_ymd: env_bool("APPEND_YMD")?.unwrap_or(false),
            sanitize_filenames: env_bool("SANITIZE_FILENAMES")?.unwrap_or(false),
            database_query_timeout: env_duration("DATABASE_QUERY_TIMEOUT")?
                .unwrap_or(Duration::from_secs(5)),
            storage_fetch_timeout: env_duration("STORAGE_FETCH_TIMEOUT")?
                .unwrap_or(Duration::from_secs(60)),
            request_timeout: env_duration("REQUEST_TIMEOUT")?
                .unwrap_or(Duration::from_secs(300)),
            storage_max_retries: env_u32("STORAGE_MAX_RETRIES")?.unwrap_or(3),
            storage_retry_delay: env_duration("STORAGE_RETRY_DELAY")?
                .unwrap_or(Duration::from_secs(1)),
            circuit_breaker_threshold: env_u32("CIRCUIT_BREAKER_THRESHOLD")?.unwrap_or(5),
            circuit_breaker_timeout: env_duration("CIRCUIT_BREAKER_TIMEOUT")?
                .unwrap_or(Duration::from_secs(60)),
            circuit_breaker_max_requests: env_u32("CIRCUIT_BREAKER_MAX_REQUESTS")?.unwrap_or(2),
            callback_max_retries: env_u32("CALLBACK_MAX_RETRIES")?.unwrap_or(3),
            callback_retry_delay: env_duration("CALLBACK_RETRY_DELAY")?
                .unwrap_or(Duration::from_secs(5)),
            port: env_u16("PORT")?.unwrap_or(8080),
            metrics_username: env_string("METRICS_USERNAME"),
            metrics_password: env_string("METRICS_PASSWORD"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] on an invalid combination.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_fetches < 1 {
            return Err(Error::InvalidInput(
                "MAX_CONCURRENT_FETCHES must be at least 1".to_string(),
            ));
        }
        if self.enforce_signing && self.signing_secret.is_empty() {
            return Err(Error::InvalidInput(
                "SIGNING_SECRET is required when ENFORCE_SIGNING=true".to_string(),
            ));
        }
        if self.rate_limit_per_ip < 0.0 || !self.rate_limit_per_ip.is_finite() {
            return Err(Error::InvalidInput(
                "RATE_LIMIT_PER_IP must be a non-negative number".to_string(),
            ));
        }
        if self.storage_type == StorageType::Local && self.storage_path.is_none() {
            return Err(Error::InvalidInput(
                "STORAGE_PATH is required for local storage".to_string(),
            ));
        }
        if self.metrics_username.is_some() != self.metrics_password.is_some() {
            return Err(Error::InvalidInput(
                "METRICS_USERNAME and METRICS_PASSWORD must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Manifest store settings derived from this configuration.
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            url: self.db_url.clone(),
            engine: self.db_engine,
            table: self.table_name.clone(),
            id_field: self.id_field.clone(),
            key_prefix: self.key_prefix.clone(),
            max_connections: self.db_max_connections,
            query_timeout: self.database_query_timeout,
        }
    }

    /// Object fetch retry policy derived from this configuration.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.storage_max_retries,
            base_delay: self.storage_retry_delay,
            attempt_timeout: self.storage_fetch_timeout,
        }
    }

    /// Circuit breaker tuning derived from this configuration.
    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.circuit_breaker_threshold,
            open_timeout: self.circuit_breaker_timeout,
            max_probes: self.circuit_breaker_max_requests,
        }
    }
}

fn url_scheme(url: &str) -> Result<&str> {
    url.split_once("://")
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| Error::InvalidInput(format!("invalid DB_URL: {url}")))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::InvalidInput(format!("{name} must be a boolean"))),
    }
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be an integer: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be an integer: {e}")))
}

fn env_f64(name: &str) -> Result<Option<f64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<f64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a number: {e}")))
}

/// Durations are given in seconds, fractions allowed (`0.5`, `30`).
fn env_duration(name: &str) -> Result<Option<Duration>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    let seconds = v
        .parse::<f64>()
        .map_err(|e| Error::InvalidInput(format!("{name} must be seconds: {e}")))?;
    if seconds < 0.0 || !seconds.is_finite() {
        return Err(Error::InvalidInput(format!(
            "{name} must be a non-negative number of seconds"
        )));
    }
    Ok(Some(Duration::from_secs_f64(seconds)))
}

fn env_list(name: &str) -> Vec<String> {
    env_string(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
