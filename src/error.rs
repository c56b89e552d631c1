//! Crate-wide error types and retry classification.

use thiserror::Error;

/// Top-level error type returned by every component in this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Object-store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encryption/decryption failure.
    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    /// Metadata-store failure.
    #[error("database error: {0}")]
    Db(#[from] DbError),

    /// Local filesystem I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Schedule expression could not be parsed and no fallback applied.
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// The manifest at the canonical key is missing, unreadable, or inconsistent.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Operation was cooperatively cancelled. Never surfaced as a run failure.
    #[error("operation cancelled")]
    Cancelled,

    /// Run state transition was attempted from an invalid state.
    #[error("invalid run state transition: {0}")]
    InvalidState(String),

    /// Catch-all for conditions that don't fit the above.
    #[error("error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the operation that produced this error is safe to retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(e) => e.is_retryable(),
            Error::Db(e) => e.is_retryable(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Object-store specific errors, classified per §4.1's retryable/permanent split.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("invalid bucket name: {0}")]
    InvalidBucketName(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("multipart upload failed: {0}")]
    MultipartFailed(String),

    #[error("server error ({code}): {message}")]
    ServerError { code: u16, message: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("size mismatch after upload: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::ConnectionFailed(_)
            | StorageError::Timeout(_)
            | StorageError::Network(_) => true,
            StorageError::ServerError { code, message } => {
                matches!(*code, 500..=599 | 408 | 429) || contains_transient_hint(message)
            }
            StorageError::UploadFailed(msg)
            | StorageError::DownloadFailed(msg)
            | StorageError::MultipartFailed(msg) => contains_transient_hint(msg),
            StorageError::AuthenticationFailed(_)
            | StorageError::AccessDenied(_)
            | StorageError::BucketNotFound(_)
            | StorageError::InvalidBucketName(_)
            | StorageError::ObjectNotFound(_)
            | StorageError::MalformedRequest(_)
            | StorageError::SizeMismatch { .. } => false,
        }
    }
}

fn contains_transient_hint(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    const HINTS: &[&str] = &[
        "timeout",
        "connection",
        "network",
        "temporary",
        "throttl",
        "rate limit",
        "nosuchupload",
        "invalidupload",
        "serviceunavailable",
        "internalerror",
        "slowdown",
    ];
    HINTS.iter().any(|h| lower.contains(h))
}

/// Encryption-specific errors.
#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid key length")]
    InvalidKey,

    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("authentication failed (ciphertext tampered or wrong key)")]
    AuthenticationFailed,
}

/// Metadata-store specific errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("pool error: {0}")]
    Pool(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("connection timeout")]
    Timeout,
}

impl DbError {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, DbError::Pool(_) | DbError::Timeout | DbError::Sql(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::Sql(err) => err.as_database_error().is_none(),
            DbError::Pool(_) | DbError::Timeout => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
