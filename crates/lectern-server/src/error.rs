use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use lectern_shared::constants::{MAX_DEVICE_NAME_LEN, MAX_FINGERPRINT_LEN, MIN_FINGERPRINT_LEN};
use lectern_store::StoreError;

use crate::storage::StorageError;

/// Coarse classification every caller can rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Security,
    Dependency,
    Exhausted,
}

/// Errors returned by the licensing engine. Display text is safe to show to
/// callers: driver and storage details are logged where they occur and never
/// carried in the message.
#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("Fingerprint must be between {} and {} bytes", MIN_FINGERPRINT_LEN, MAX_FINGERPRINT_LEN)]
    InvalidFingerprint,

    #[error("Device name must be non-empty and at most {} bytes", MAX_DEVICE_NAME_LEN)]
    InvalidDeviceName,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Device not found")]
    DeviceNotFound,

    #[error("No license for this material on this device")]
    NoLicense,

    #[error("Job not found")]
    JobNotFound,

    #[error("Device already registered")]
    DuplicateDevice,

    #[error("Device limit of {max} reached")]
    DeviceLimitExceeded { max: u32 },

    #[error("Device blocked until {until}")]
    DeviceBlocked { until: DateTime<Utc> },

    #[error("Device is not active")]
    DeviceNotActive,

    #[error("License expired at {expired_at}; renew it to keep offline access")]
    LicenseExpired { expired_at: DateTime<Utc> },

    #[error("Offline grace period lapsed; renew the license to keep offline access")]
    OfflineGraceExpired,

    #[error("Key could not be unwrapped")]
    UnwrapFailed,

    #[error("Key could not be wrapped")]
    WrapFailed,

    #[error("Object storage unavailable")]
    StorageUnavailable,

    #[error("Persistence unavailable")]
    PersistenceUnavailable,

    #[error("Protected artifact could not be produced")]
    EncryptionUnavailable,
}

impl OfflineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFingerprint | Self::InvalidDeviceName | Self::InvalidRequest(_) => {
                ErrorKind::Validation
            }
            Self::DeviceNotFound | Self::NoLicense | Self::JobNotFound => ErrorKind::NotFound,
            Self::DuplicateDevice | Self::DeviceLimitExceeded { .. } => ErrorKind::Conflict,
            Self::DeviceBlocked { .. }
            | Self::DeviceNotActive
            | Self::LicenseExpired { .. }
            | Self::OfflineGraceExpired
            | Self::UnwrapFailed
            | Self::WrapFailed => ErrorKind::Security,
            Self::StorageUnavailable | Self::PersistenceUnavailable => ErrorKind::Dependency,
            Self::EncryptionUnavailable => ErrorKind::Exhausted,
        }
    }

    /// Stable machine-readable code, also written to audit entries.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFingerprint => "INVALID_FINGERPRINT",
            Self::InvalidDeviceName => "INVALID_DEVICE_NAME",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::DeviceNotFound => "DEVICE_NOT_FOUND",
            Self::NoLicense => "NO_LICENSE",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::DuplicateDevice => "DUPLICATE_DEVICE",
            Self::DeviceLimitExceeded { .. } => "DEVICE_LIMIT_EXCEEDED",
            Self::DeviceBlocked { .. } => "DEVICE_BLOCKED",
            Self::DeviceNotActive => "DEVICE_NOT_ACTIVE",
            Self::LicenseExpired { .. } => "LICENSE_EXPIRED",
            Self::OfflineGraceExpired => "OFFLINE_GRACE_EXPIRED",
            Self::UnwrapFailed => "UNWRAP_FAILED",
            Self::WrapFailed => "WRAP_FAILED",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::PersistenceUnavailable => "PERSISTENCE_UNAVAILABLE",
            Self::EncryptionUnavailable => "ENCRYPTION_UNAVAILABLE",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::DeviceBlocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => match self.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Security => StatusCode::FORBIDDEN,
                ErrorKind::Dependency => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Exhausted => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<StoreError> for OfflineError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "persistence failure");
        OfflineError::PersistenceUnavailable
    }
}

impl From<StorageError> for OfflineError {
    fn from(e: StorageError) -> Self {
        tracing::error!(error = %e, "object storage failure");
        OfflineError::StorageUnavailable
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocked_until: Option<&'a DateTime<Utc>>,
}

impl IntoResponse for OfflineError {
    fn into_response(self) -> Response {
        let blocked_until = match &self {
            OfflineError::DeviceBlocked { until } => Some(until),
            _ => None,
        };
        let body = serde_json::json!({
            "error": ErrorBody {
                code: self.code(),
                kind: self.kind(),
                message: self.to_string(),
                blocked_until,
            },
        });

        (self.status(), axum::Json(body)).into_response()
    }
}
