//! Fixtures shared by the unit tests of this crate.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use lectern_shared::types::{Platform, UserId};
use lectern_store::{Database, Device};

use crate::audit::Actor;
use crate::config::ServerConfig;
use crate::key_vault::KeyVault;
use crate::storage::{source_key, FsObjectStore, ObjectStore};
use crate::Engine;

pub(crate) struct Harness {
    pub engine: Engine,
    pub config: ServerConfig,
    pub store: Arc<FsObjectStore>,
    _dir: TempDir,
}

pub(crate) fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.kek = [7; 32];
    config.jobs.retry_base_delay = Duration::ZERO;
    config.jobs.retry_max_delay = Duration::ZERO;
    config
}

pub(crate) async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub(crate) async fn harness_with(config: ServerConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let database = Database::open_at(&dir.path().join("lectern.db")).unwrap();
    let store = Arc::new(
        FsObjectStore::new(dir.path().join("objects"), "http://localhost/objects", config.presign_key())
            .await
            .unwrap(),
    );
    let vault = Arc::new(KeyVault::new(config.kek, config.kek_version));
    let storage: Arc<dyn ObjectStore> = store.clone();
    let engine = Engine::new(&config, database, storage, vault);

    Harness {
        engine,
        config,
        store,
        _dir: dir,
    }
}

impl Harness {
    pub fn register(&self, actor: &Actor, fingerprint_char: char) -> Device {
        self.engine
            .devices
            .register(actor, &fingerprint_char.to_string().repeat(32), "Test device", Platform::Android)
            .unwrap()
    }

    pub async fn put_source(&self, material: lectern_shared::types::MaterialId, data: &'static [u8]) {
        self.store
            .put_object(
                &self.config.source_bucket,
                &source_key(material),
                Bytes::from_static(data),
                "application/pdf",
            )
            .await
            .unwrap();
    }
}

pub(crate) fn actor() -> Actor {
    Actor::user(UserId::new())
}
