/// Application name
pub const APP_NAME: &str = "Lectern";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (KEK and content keys)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Device fingerprint bounds, in bytes
pub const MIN_FINGERPRINT_LEN: usize = 32;
pub const MAX_FINGERPRINT_LEN: usize = 512;

/// Maximum device display name length in bytes
pub const MAX_DEVICE_NAME_LEN: usize = 255;

/// Active devices a single user may hold
pub const DEFAULT_MAX_DEVICES_PER_USER: u32 = 5;

/// Plaintext bytes per artifact chunk (1 MiB)
pub const ARTIFACT_CHUNK_SIZE: usize = 1024 * 1024;

/// Leading bytes of every protected artifact
pub const ARTIFACT_MAGIC: &[u8; 4] = b"LCTN";

/// Artifact container format revision
pub const ARTIFACT_FORMAT_VERSION: u8 = 1;

/// Validation failures tolerated before a device is blocked
pub const DEFAULT_RATE_LIMIT_THRESHOLD: u32 = 5;

/// Window inside which consecutive failures accumulate (1 hour)
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60 * 60;

/// First block duration once the threshold is reached (1 hour)
pub const DEFAULT_RATE_LIMIT_BASE_BLOCK_SECS: u64 = 60 * 60;

/// Upper bound for repeated-offense blocks (24 hours)
pub const DEFAULT_RATE_LIMIT_MAX_BLOCK_SECS: u64 = 24 * 60 * 60;

/// Encryption job retries before a job is terminally failed
pub const DEFAULT_JOB_MAX_RETRIES: u32 = 3;

/// A processing job older than this is considered abandoned (30 minutes)
pub const DEFAULT_JOB_STALE_TIMEOUT_SECS: u64 = 30 * 60;

/// Queue poll interval for idle workers
pub const DEFAULT_JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Concurrent encryption workers per process
pub const DEFAULT_WORKER_CONCURRENCY: usize = 2;

/// Retry backoff bounds
pub const DEFAULT_JOB_RETRY_BASE_DELAY_SECS: u64 = 1;
pub const DEFAULT_JOB_RETRY_MAX_DELAY_SECS: u64 = 5 * 60;

/// Completed jobs are kept this long before housekeeping deletes them
pub const DEFAULT_JOB_RETENTION_DAYS: u64 = 7;

/// Lifetime of an issued or renewed license (30 days)
pub const DEFAULT_LICENSE_TTL_DAYS: u64 = 30;

/// How long a device may stay offline between validations (72 hours)
pub const DEFAULT_OFFLINE_GRACE_SECS: u64 = 72 * 60 * 60;

/// Lifetime of presigned artifact download URLs (1 hour)
pub const DEFAULT_PRESIGN_TTL_SECS: u64 = 60 * 60;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Key derivation / associated-data contexts (BLAKE3)
pub const KDF_CONTEXT_PRESIGN: &str = "lectern-presign-v1";
pub const AAD_CONTEXT_MATERIAL_KEY: &[u8] = b"lectern-material-key-v1";
pub const AAD_CONTEXT_DEVICE_KEY: &[u8] = b"lectern-device-cek-v1";
