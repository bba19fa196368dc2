//! Key Vault: the only place the KEK is used.
//!
//! Wrapped layout: `kek_version (1) || nonce (24) || ciphertext+tag`. Every
//! wrap is bound to a [`KeyContext`] through the AEAD associated data, so a
//! wrapped key moved to a different row no longer opens.

use lectern_shared::constants::{AAD_CONTEXT_DEVICE_KEY, AAD_CONTEXT_MATERIAL_KEY};
use lectern_shared::crypto::{decrypt_with_aad, encrypt_with_aad, ContentKey};
use lectern_shared::types::{DeviceId, MaterialId, UserId};
use lectern_store::{Database, StoreError};
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::error::OfflineError;

/// What a wrapped key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyContext {
    /// The shared key of one material version.
    Material { material_id: MaterialId, key_version: u32 },
    /// One device's copy of a material version key.
    Device {
        owner: UserId,
        material_id: MaterialId,
        device_id: DeviceId,
        key_version: u32,
    },
}

impl KeyContext {
    fn aad(&self) -> Vec<u8> {
        match self {
            KeyContext::Material { material_id, key_version } => {
                let mut aad = AAD_CONTEXT_MATERIAL_KEY.to_vec();
                aad.extend_from_slice(material_id.as_uuid().as_bytes());
                aad.extend_from_slice(&key_version.to_be_bytes());
                aad
            }
            KeyContext::Device { owner, material_id, device_id, key_version } => {
                let mut aad = AAD_CONTEXT_DEVICE_KEY.to_vec();
                aad.extend_from_slice(owner.as_uuid().as_bytes());
                aad.extend_from_slice(material_id.as_uuid().as_bytes());
                aad.extend_from_slice(device_id.as_uuid().as_bytes());
                aad.extend_from_slice(&key_version.to_be_bytes());
                aad
            }
        }
    }
}

/// Holds the KEK for the lifetime of the process.
pub struct KeyVault {
    kek: Zeroizing<[u8; 32]>,
    version: u8,
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl KeyVault {
    pub fn new(kek: [u8; 32], version: u8) -> Self {
        Self {
            kek: Zeroizing::new(kek),
            version,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn wrap_key(&self, key: &ContentKey, ctx: &KeyContext) -> Result<Vec<u8>, OfflineError> {
        let sealed = encrypt_with_aad(&self.kek, key.as_bytes(), &ctx.aad()).map_err(|e| {
            error!(error = %e, "key wrap failed");
            OfflineError::WrapFailed
        })?;

        let mut out = Vec::with_capacity(1 + sealed.len());
        out.push(self.version);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Any mismatch (KEK version, context, truncation, tampering) is
    /// [`OfflineError::UnwrapFailed`]; wrong bytes are never returned.
    pub fn unwrap_key(&self, wrapped: &[u8], ctx: &KeyContext) -> Result<ContentKey, OfflineError> {
        let Some((&version, sealed)) = wrapped.split_first() else {
            return Err(OfflineError::UnwrapFailed);
        };
        if version != self.version {
            warn!(expected = self.version, found = version, "KEK version mismatch");
            return Err(OfflineError::UnwrapFailed);
        }

        let plain = Zeroizing::new(
            decrypt_with_aad(&self.kek, sealed, &ctx.aad()).map_err(|_| OfflineError::UnwrapFailed)?,
        );
        ContentKey::from_slice(&plain).map_err(|_| OfflineError::UnwrapFailed)
    }

    /// Re-wrap a key produced by `old` under this vault.
    pub fn rewrap(&self, old: &KeyVault, wrapped: &[u8], ctx: &KeyContext) -> Result<Vec<u8>, OfflineError> {
        let key = old.unwrap_key(wrapped, ctx)?;
        self.wrap_key(&key, ctx)
    }
}

/// Counts reported by [`rewrap_all`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RewrapReport {
    pub rewrapped: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Out-of-band KEK rotation: move every stored wrap from `from` to `to`.
///
/// Rows already at `to`'s version are skipped; rows that do not open under
/// `from` are counted as failed and left untouched.
pub fn rewrap_all(db: &Database, from: &KeyVault, to: &KeyVault) -> Result<RewrapReport, StoreError> {
    let mut report = RewrapReport::default();

    for key in db.list_material_keys()? {
        if key.kek_version == to.version() {
            report.skipped += 1;
            continue;
        }
        let ctx = KeyContext::Material {
            material_id: key.material_id,
            key_version: key.key_version,
        };
        match to.rewrap(from, &key.wrapped_key, &ctx) {
            Ok(wrapped) => {
                db.update_material_key_wrap(key.material_id, key.key_version, &wrapped, to.version())?;
                report.rewrapped += 1;
            }
            Err(_) => {
                error!(material_id = %key.material_id, key_version = key.key_version, "material key did not unwrap during rotation");
                report.failed += 1;
            }
        }
    }

    for cek in db.list_all_ceks()? {
        if cek.kek_version == to.version() {
            report.skipped += 1;
            continue;
        }
        let ctx = KeyContext::Device {
            owner: cek.owner_user_id,
            material_id: cek.material_id,
            device_id: cek.device_id,
            key_version: cek.key_version,
        };
        match to.rewrap(from, &cek.wrapped_key, &ctx) {
            Ok(wrapped) => {
                db.update_cek_wrap(cek.id, &wrapped, to.version())?;
                report.rewrapped += 1;
            }
            Err(_) => {
                error!(cek_id = %cek.id, "CEK did not unwrap during rotation");
                report.failed += 1;
            }
        }
    }

    info!(
        rewrapped = report.rewrapped,
        skipped = report.skipped,
        failed = report.failed,
        "KEK rotation finished"
    );
    Ok(report)
}
