//! # lectern-server
//!
//! Offline content-protection and licensing engine.
//!
//! - **Device Registry** binds fingerprints to users and revokes devices
//! - **Rate Limiter** blocks devices after repeated failed validations
//! - **Key Vault** wraps and unwraps keys under the server KEK
//! - **License Manager** issues per-device CEKs and validates licenses
//! - **Job Queue** re-encrypts source material into protected artifacts
//! - **Audit Log** records every security-relevant decision
//!
//! The binary in `main.rs` wires these to SQLite, a filesystem object store
//! and a small axum API.

pub mod api;
pub mod audit;
pub mod config;
pub mod db;
pub mod devices;
pub mod error;
pub mod jobs;
pub mod key_vault;
pub mod license;
pub mod rate_limit;
pub mod storage;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use lectern_store::Database;
use tokio::sync::watch;

use crate::audit::AuditLog;
use crate::config::ServerConfig;
use crate::db::Db;
use crate::devices::DeviceRegistry;
use crate::jobs::{EncryptionWorker, JobQueue, WorkerPool, WorkerSettings};
use crate::key_vault::KeyVault;
use crate::license::{LicenseManager, LicenseSettings};
use crate::rate_limit::DeviceRateLimiter;
use crate::storage::ObjectStore;

pub use crate::audit::Actor;
pub use crate::error::{ErrorKind, OfflineError};

/// Every component, built over one database handle, one object store and
/// one Key Vault.
#[derive(Clone)]
pub struct Engine {
    pub devices: DeviceRegistry,
    pub licenses: LicenseManager,
    pub limiter: DeviceRateLimiter,
    pub audit: AuditLog,
    pub worker: Arc<EncryptionWorker>,
    pub storage: Arc<dyn ObjectStore>,
    db: Db,
}

impl Engine {
    pub fn new(
        config: &ServerConfig,
        database: Database,
        storage: Arc<dyn ObjectStore>,
        vault: Arc<KeyVault>,
    ) -> Self {
        let db = Db::new(database);
        let audit = AuditLog::new(db.clone());
        let limiter = DeviceRateLimiter::new(db.clone(), config.rate_limit.clone());
        let devices = DeviceRegistry::new(db.clone(), audit.clone(), config.max_devices_per_user);

        let licenses = LicenseManager::new(
            db.clone(),
            Arc::clone(&vault),
            Arc::clone(&storage),
            limiter.clone(),
            devices.clone(),
            audit.clone(),
            LicenseSettings {
                encrypted_bucket: config.encrypted_bucket.clone(),
                presign_ttl: config.presign_ttl,
                max_retries: config.jobs.max_retries,
                license_ttl: config.license_ttl,
                offline_grace: config.offline_grace,
            },
        );

        let queue = JobQueue::new(db.clone(), config.jobs.clone());
        let worker = Arc::new(EncryptionWorker::new(
            queue,
            db.clone(),
            vault,
            Arc::clone(&storage),
            audit.clone(),
            WorkerSettings::new(&config.source_bucket, &config.encrypted_bucket),
        ));

        Self {
            devices,
            licenses,
            limiter,
            audit,
            worker,
            storage,
            db,
        }
    }

    /// Start the encryption worker pool; it stops when `shutdown` turns true.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> WorkerPool {
        WorkerPool::spawn(Arc::clone(&self.worker), shutdown)
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}
