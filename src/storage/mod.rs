//! Object-store client abstraction.

pub mod s3;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Target storage class, mapped onto the underlying object store's tiers in the
/// backend implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum StorageClass {
    Hot,
    CoolIr,
    CoolFlex,
    Deep,
}

impl StorageClass {
    /// True for the tiers that require a cold-retrieval handshake before reads.
    pub fn is_cold(&self) -> bool {
        matches!(self, StorageClass::CoolFlex | StorageClass::Deep)
    }

    /// Maps onto an AWS S3 storage-class string.
    pub fn as_s3_storage_class(&self) -> aws_sdk_s3::types::StorageClass {
        use aws_sdk_s3::types::StorageClass as S3Class;
        match self {
            StorageClass::Hot => S3Class::Standard,
            StorageClass::CoolIr => S3Class::StandardIa,
            StorageClass::CoolFlex => S3Class::IntelligentTiering,
            StorageClass::Deep => S3Class::DeepArchive,
        }
    }
}

/// Retrieval tier for cold-storage rehydration requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalTier {
    Expedited,
    Standard,
    Bulk,
}

/// Status of an in-progress (or not-yet-requested) cold restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColdRestoreStatus {
    None,
    InProgress,
    Ready,
}

/// Metadata returned by a HEAD request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectHead {
    pub exists: bool,
    pub size: u64,
    pub storage_class: Option<StorageClass>,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
    pub etag: Option<String>,
}

/// One entry from a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub storage_class: Option<StorageClass>,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
}

/// Progress callback invoked during upload/download, no less often than every 10 MiB
/// transferred, or at completion.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Configuration for the S3 backend. Narrowed to a single object-store protocol;
/// see DESIGN.md for the rationale.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub bucket: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub connect_timeout: std::time::Duration,
    pub read_timeout: std::time::Duration,
    pub multipart_threshold_bytes: u64,
    pub multipart_chunk_size_bytes: u64,
}

/// The object-store client contract used by every engine in this crate.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Upload a local file to `key` under `class`, using multipart upload above the
    /// configured threshold. Wrapped in retry-with-backoff internally.
    async fn upload(
        &self,
        local_path: &std::path::Path,
        key: &str,
        class: StorageClass,
        progress: Option<ProgressCallback>,
    ) -> Result<()>;

    /// Download `key` to a local path.
    async fn download(&self, key: &str, local_path: &std::path::Path) -> Result<()>;

    /// Download `key` fully into memory. Used for small objects (the manifest).
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>>;

    /// Upload an in-memory buffer to `key`. Used for small objects (the manifest).
    async fn put_bytes(&self, key: &str, data: Vec<u8>, class: StorageClass) -> Result<()>;

    /// HEAD a single object.
    async fn head(&self, key: &str) -> Result<ObjectHead>;

    /// True iff the object exists (a thin wrapper over `head`).
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.head(key).await?.exists)
    }

    /// List every object under `prefix`, paginating internally to completion.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;

    /// Delete a single object. Used only by tests and explicit maintenance; the
    /// engines in this crate never delete payload objects on their own — retention
    /// only flips a ledger flag.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Request rehydration of a cold object ahead of a read.
    async fn initiate_cold_restore(&self, key: &str, tier: RetrievalTier) -> Result<()>;

    /// Poll the status of a previously requested cold restore.
    async fn check_cold_restore(&self, key: &str) -> Result<ColdRestoreStatus>;
}
