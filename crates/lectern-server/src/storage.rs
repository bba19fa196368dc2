//! Object storage capability and its filesystem backend.
//!
//! The engine only talks to [`ObjectStore`]. [`FsObjectStore`] lays objects
//! out as `<root>/<bucket>/<key>` and signs download links with a keyed
//! BLAKE3 hash, which is enough for a single-node deployment.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use lectern_shared::types::MaterialId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Metadata returned by [`ObjectStore::stat_object`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Bucket-oriented blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError>;

    /// Store `data`. Readers never observe a partially written object.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError>;

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        match self.stat_object(bucket, key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// A URL granting read access to one object until `ttl` elapses.
    fn presigned_get_url(&self, bucket: &str, key: &str, ttl: Duration)
        -> Result<String, StorageError>;

    /// Check a link produced by [`presigned_get_url`](Self::presigned_get_url).
    /// Backends whose links are verified elsewhere keep the default.
    fn verify_presigned_get(&self, _bucket: &str, _key: &str, _expires: i64, _signature: &str) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Object key layout
// ---------------------------------------------------------------------------

/// Key of a material's plaintext source in the source bucket.
pub fn source_key(material: MaterialId) -> String {
    material.to_string()
}

/// Key of the protected artifact for one key version.
pub fn artifact_key(material: MaterialId, key_version: u32) -> String {
    format!("materials/{material}/v{key_version}.lct")
}

/// Key of the manifest written next to [`artifact_key`].
pub fn manifest_key(material: MaterialId, key_version: u32) -> String {
    format!("materials/{material}/v{key_version}.manifest.json")
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

/// Verify that a resolved path stays within the expected base directory.
/// Prevents path traversal attacks.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, StorageError> {
    let mut resolved = base.to_path_buf();
    for component in target.components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(StorageError::InvalidKey("path traversal detected".into()));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidKey("absolute path".into()));
            }
            Component::CurDir => {}
        }
    }
    if !resolved.starts_with(base) || resolved == base {
        return Err(StorageError::InvalidKey("path traversal detected".into()));
    }
    Ok(resolved)
}

fn validate_bucket(bucket: &str) -> Result<(), StorageError> {
    if bucket.is_empty()
        || bucket.contains('/')
        || bucket.contains('\\')
        || bucket.contains("..")
    {
        return Err(StorageError::InvalidKey(format!("bad bucket name {bucket:?}")));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty()
        || key.contains('\\')
        || key
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(StorageError::InvalidKey(format!("bad object key {key:?}")));
    }
    Ok(())
}

fn unavailable(op: &str, path: &Path, e: std::io::Error) -> StorageError {
    StorageError::Unavailable(format!("{op} '{}': {e}", path.display()))
}

pub struct FsObjectStore {
    root: PathBuf,
    public_base_url: String,
    signing_key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for FsObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsObjectStore")
            .field("root", &self.root)
            .field("public_base_url", &self.public_base_url)
            .finish_non_exhaustive()
    }
}

impl FsObjectStore {
    pub async fn new(
        root: PathBuf,
        public_base_url: impl Into<String>,
        signing_key: [u8; 32],
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(&root)
            .await
            .map_err(|e| unavailable("create storage root", &root, e))?;
        let root = root
            .canonicalize()
            .map_err(|e| unavailable("resolve storage root", &root, e))?;

        info!(path = %root.display(), "Object store initialized");

        Ok(Self {
            root,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            signing_key: Zeroizing::new(signing_key),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        ensure_within(&self.root, &Path::new(bucket).join(key))
    }

    fn signature(&self, bucket: &str, key: &str, expires: i64) -> blake3::Hash {
        let message = format!("{bucket}\n{key}\n{expires}");
        blake3::keyed_hash(&self.signing_key, message.as_bytes())
    }

    fn verify_at(&self, bucket: &str, key: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        if expires < now.timestamp() {
            return false;
        }
        let Ok(given) = hex::decode(signature) else {
            return false;
        };
        let expected = self.signature(bucket, key, expires);
        bool::from(expected.as_bytes()[..].ct_eq(&given[..]))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(data) => {
                debug!(bucket, key, size = data.len(), "Read object");
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(unavailable("read", &path, e)),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| unavailable("create directory", parent, e))?;

        // Write beside the target and rename, so the object appears whole.
        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        if let Err(e) = fs::write(&tmp, &data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(unavailable("write", &tmp, e));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(unavailable("rename", &path, e));
        }

        debug!(bucket, key, size = data.len(), content_type, "Stored object");
        Ok(())
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        let path = self.object_path(bucket, key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(ObjectInfo {
                size: meta.len(),
                modified: meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
            }),
            Ok(_) => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(unavailable("stat", &path, e)),
        }
    }

    fn presigned_get_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| StorageError::InvalidKey("presign ttl out of range".into()))?;
        let expires = (Utc::now() + ttl).timestamp();
        let signature = self.signature(bucket, key, expires).to_hex();
        Ok(format!(
            "{}/{bucket}/{key}?expires={expires}&signature={signature}",
            self.public_base_url
        ))
    }

    fn verify_presigned_get(&self, bucket: &str, key: &str, expires: i64, signature: &str) -> bool {
        self.verify_at(bucket, key, expires, signature, Utc::now())
    }
}
