use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Malformed artifact: {0}")]
    MalformedArtifact(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown platform: {0}")]
    Platform(String),

    #[error("Unknown job status: {0}")]
    JobStatus(String),

    #[error("Job priority out of range: {0}")]
    JobPriority(i64),
}
