//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lectern_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_JOB_MAX_RETRIES, DEFAULT_JOB_POLL_INTERVAL_MS,
    DEFAULT_JOB_RETENTION_DAYS, DEFAULT_JOB_RETRY_BASE_DELAY_SECS,
    DEFAULT_JOB_RETRY_MAX_DELAY_SECS, DEFAULT_JOB_STALE_TIMEOUT_SECS, DEFAULT_LICENSE_TTL_DAYS,
    DEFAULT_MAX_DEVICES_PER_USER, DEFAULT_OFFLINE_GRACE_SECS, DEFAULT_PRESIGN_TTL_SECS, DEFAULT_RATE_LIMIT_BASE_BLOCK_SECS,
    DEFAULT_RATE_LIMIT_MAX_BLOCK_SECS, DEFAULT_RATE_LIMIT_THRESHOLD,
    DEFAULT_RATE_LIMIT_WINDOW_SECS, DEFAULT_WORKER_CONCURRENCY,
};

/// Failed-validation policy applied per device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Consecutive failures that trigger a block.
    /// Env: `RATE_LIMIT_THRESHOLD`
    pub threshold: u32,
    /// A quiet period longer than this starts a fresh count.
    /// Env: `RATE_LIMIT_WINDOW_SECS`
    pub window: Duration,
    /// Block length when the threshold is first reached.
    /// Env: `RATE_LIMIT_BASE_BLOCK_SECS`
    pub base_block: Duration,
    /// Upper bound for the doubling block length.
    /// Env: `RATE_LIMIT_MAX_BLOCK_SECS`
    pub max_block: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_RATE_LIMIT_THRESHOLD,
            window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            base_block: Duration::from_secs(DEFAULT_RATE_LIMIT_BASE_BLOCK_SECS),
            max_block: Duration::from_secs(DEFAULT_RATE_LIMIT_MAX_BLOCK_SECS),
        }
    }
}

/// Encryption job queue tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueConfig {
    /// Env: `WORKER_CONCURRENCY`
    pub concurrency: usize,
    /// Env: `JOB_POLL_INTERVAL_MS`
    pub poll_interval: Duration,
    /// A job processing for longer than this is considered abandoned.
    /// Env: `JOB_STALE_TIMEOUT_SECS`
    pub stale_timeout: Duration,
    /// Env: `JOB_MAX_RETRIES`
    pub max_retries: u32,
    /// Env: `JOB_RETRY_BASE_DELAY_SECS`
    pub retry_base_delay: Duration,
    /// Env: `JOB_RETRY_MAX_DELAY_SECS`
    pub retry_max_delay: Duration,
    /// Completed jobs older than this are deleted.
    /// Env: `JOB_RETENTION_DAYS`
    pub retention: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval: Duration::from_millis(DEFAULT_JOB_POLL_INTERVAL_MS),
            stale_timeout: Duration::from_secs(DEFAULT_JOB_STALE_TIMEOUT_SECS),
            max_retries: DEFAULT_JOB_MAX_RETRIES,
            retry_base_delay: Duration::from_secs(DEFAULT_JOB_RETRY_BASE_DELAY_SECS),
            retry_max_delay: Duration::from_secs(DEFAULT_JOB_RETRY_MAX_DELAY_SECS),
            retention: Duration::from_secs(DEFAULT_JOB_RETENTION_DAYS * 24 * 60 * 60),
        }
    }
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./data/lectern.db`
    pub database_path: PathBuf,

    /// Root directory of the filesystem object store.
    /// Env: `STORAGE_PATH`
    /// Default: `./objects`
    pub storage_path: PathBuf,

    /// Base URL presigned links are built on.
    /// Env: `PUBLIC_STORAGE_URL`
    /// Default: `http://localhost:8080/objects`
    pub public_storage_url: String,

    /// Bucket holding plaintext source materials (read-only to us).
    /// Env: `SOURCE_BUCKET`
    pub source_bucket: String,

    /// Bucket holding protected artifacts.
    /// Env: `ENCRYPTED_BUCKET`
    pub encrypted_bucket: String,

    /// Key encryption key (hex-encoded, 64 chars).
    /// Env: `KEK_HEX`
    /// Default: all-zeros (development only).
    pub kek: [u8; 32],

    /// Version byte stamped on every wrap made with `kek`.
    /// Env: `KEK_VERSION`
    pub kek_version: u8,

    /// Secret for signing presigned URLs (hex-encoded, 64 chars).
    /// Env: `PRESIGN_SECRET_HEX`
    /// Default: derived from the KEK.
    pub presign_secret: Option<[u8; 32]>,

    /// Env: `PRESIGN_TTL_SECS`
    pub presign_ttl: Duration,

    /// Env: `MAX_DEVICES_PER_USER`
    pub max_devices_per_user: u32,

    /// Term of an issued or renewed license.
    /// Env: `LICENSE_TTL_DAYS`
    /// Default: 30 days
    pub license_ttl: Duration,

    /// Longest a device may go without validating before it must renew.
    /// Env: `OFFLINE_GRACE_SECS`
    /// Default: 72 hours
    pub offline_grace: Duration,

    pub rate_limit: RateLimitPolicy,

    pub jobs: JobQueueConfig,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("storage_path", &self.storage_path)
            .field("public_storage_url", &self.public_storage_url)
            .field("source_bucket", &self.source_bucket)
            .field("encrypted_bucket", &self.encrypted_bucket)
            .field("kek", &"<redacted>")
            .field("kek_version", &self.kek_version)
            .field("presign_ttl", &self.presign_ttl)
            .field("max_devices_per_user", &self.max_devices_per_user)
            .field("license_ttl", &self.license_ttl)
            .field("offline_grace", &self.offline_grace)
            .field("rate_limit", &self.rate_limit)
            .field("jobs", &self.jobs)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./data/lectern.db"),
            storage_path: PathBuf::from("./objects"),
            public_storage_url: format!("http://localhost:{DEFAULT_HTTP_PORT}/objects"),
            source_bucket: "materials".to_string(),
            encrypted_bucket: "materials-encrypted".to_string(),
            kek: [0u8; 32],
            kek_version: 1,
            presign_secret: None,
            presign_ttl: Duration::from_secs(DEFAULT_PRESIGN_TTL_SECS),
            max_devices_per_user: DEFAULT_MAX_DEVICES_PER_USER,
            license_ttl: Duration::from_secs(DEFAULT_LICENSE_TTL_DAYS * 24 * 60 * 60),
            offline_grace: Duration::from_secs(DEFAULT_OFFLINE_GRACE_SECS),
            rate_limit: RateLimitPolicy::default(),
            jobs: JobQueueConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        set_parsed(&var, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(path) = var("STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }
        if let Some(url) = var("PUBLIC_STORAGE_URL") {
            config.public_storage_url = url.trim_end_matches('/').to_string();
        }
        if let Some(bucket) = var("SOURCE_BUCKET") {
            config.source_bucket = bucket;
        }
        if let Some(bucket) = var("ENCRYPTED_BUCKET") {
            config.encrypted_bucket = bucket;
        }

        match var("KEK_HEX") {
            Some(hex_key) => match parse_hex_key(&hex_key) {
                Ok(key) => config.kek = key,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid KEK_HEX, using default (dev-only)");
                }
            },
            None => {
                tracing::warn!("KEK_HEX not set, using all-zero development KEK");
            }
        }
        set_parsed(&var, "KEK_VERSION", &mut config.kek_version);

        if let Some(hex_key) = var("PRESIGN_SECRET_HEX") {
            match parse_hex_key(&hex_key) {
                Ok(key) => config.presign_secret = Some(key),
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid PRESIGN_SECRET_HEX, deriving from KEK");
                }
            }
        }

        set_secs(&var, "PRESIGN_TTL_SECS", &mut config.presign_ttl);
        set_parsed(&var, "MAX_DEVICES_PER_USER", &mut config.max_devices_per_user);
        if let Some(days) = parsed::<u64>(&var, "LICENSE_TTL_DAYS") {
            config.license_ttl = Duration::from_secs(days * 24 * 60 * 60);
        }
        set_secs(&var, "OFFLINE_GRACE_SECS", &mut config.offline_grace);

        // -- Rate limiting --
        set_parsed(&var, "RATE_LIMIT_THRESHOLD", &mut config.rate_limit.threshold);
        set_secs(&var, "RATE_LIMIT_WINDOW_SECS", &mut config.rate_limit.window);
        set_secs(&var, "RATE_LIMIT_BASE_BLOCK_SECS", &mut config.rate_limit.base_block);
        set_secs(&var, "RATE_LIMIT_MAX_BLOCK_SECS", &mut config.rate_limit.max_block);

        // -- Job queue --
        set_parsed(&var, "WORKER_CONCURRENCY", &mut config.jobs.concurrency);
        if let Some(ms) = parsed::<u64>(&var, "JOB_POLL_INTERVAL_MS") {
            config.jobs.poll_interval = Duration::from_millis(ms);
        }
        set_secs(&var, "JOB_STALE_TIMEOUT_SECS", &mut config.jobs.stale_timeout);
        set_parsed(&var, "JOB_MAX_RETRIES", &mut config.jobs.max_retries);
        set_secs(&var, "JOB_RETRY_BASE_DELAY_SECS", &mut config.jobs.retry_base_delay);
        set_secs(&var, "JOB_RETRY_MAX_DELAY_SECS", &mut config.jobs.retry_max_delay);
        if let Some(days) = parsed::<u64>(&var, "JOB_RETENTION_DAYS") {
            config.jobs.retention = Duration::from_secs(days * 24 * 60 * 60);
        }

        if config.jobs.concurrency == 0 {
            tracing::warn!("WORKER_CONCURRENCY must be at least 1, using 1");
            config.jobs.concurrency = 1;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Secret used to sign presigned URLs.
    pub fn presign_key(&self) -> [u8; 32] {
        self.presign_secret.unwrap_or_else(|| {
            lectern_shared::crypto::derive_key(
                lectern_shared::constants::KDF_CONTEXT_PRESIGN,
                &self.kek,
            )
        })
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = var(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(value = %raw, "Invalid {name}, using default");
            None
        }
    }
}

fn set_parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    if let Some(v) = parsed(var, name) {
        *slot = v;
    }
}

fn set_secs(var: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut Duration) {
    if let Some(secs) = parsed::<u64>(var, name) {
        *slot = Duration::from_secs(secs);
    }
}

/// Parse a 64-character hex string into a 32-byte array.
fn parse_hex_key(value: &str) -> Result<[u8; 32], String> {
    let value = value.trim();
    if value.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", value.len()));
    }
    let bytes = hex::decode(value).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
