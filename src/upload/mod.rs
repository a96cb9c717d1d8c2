//! Upload module
//!
//! Turns a byte source of known or unknown length into either a single PUT
//! or a multipart upload, sequential or parallel.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mizuchi_transfer::s3::{S3Client, S3ClientConfig};
//! use mizuchi_transfer::upload::{MultipartUploadCoordinator, PutObjectOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(S3Client::new(S3ClientConfig::new("http://localhost:9000"))?);
//! let coordinator = MultipartUploadCoordinator::new(client);
//!
//! let data = vec![0u8; 64 * 1024 * 1024];
//! let result = coordinator
//!     .upload("bucket", "big.bin", &data[..], Some(data.len() as u64), &PutObjectOptions::default())
//!     .await?;
//! println!("ETag: {}", result.etag);
//! # Ok(())
//! # }
//! ```

use crate::s3::{
    S3ClientError, S3CompleteMultipartUploadResponse, S3CompletedPart,
    S3CreateMultipartUploadResponse, S3PutObjectRequest, S3PutObjectResponse,
    S3UploadPartRequest, S3UploadPartResponse,
};
use reqwest::header::HeaderMap;
use thiserror::Error;

pub mod checksum;
pub mod multipart;
pub mod options;
pub mod planner;
pub mod reader;
pub mod session;

pub use checksum::{
    AggregateChecksum, ChecksumAggregator, ChecksumAlgorithm, ChecksumError, PartChecksum,
};
pub use multipart::{MultipartUploadCoordinator, UploadOutcome};
pub use options::{
    EnginePool, LegalHoldStatus, PartialUpdate, PartialUpdateMode, PutObjectOptions,
    RetentionMode, DEFAULT_NUM_THREADS,
};
pub use planner::{compute_plan, TransferPlan};
pub use session::{PartResult, UploadSession, UploadState};

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Object too large: more than {max_parts} parts of {part_size} bytes")]
    ObjectTooLarge { part_size: u64, max_parts: u32 },

    #[error("Size mismatch: expected {expected} bytes, source provided {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Part {part_number} failed: {source}")]
    PartFailed {
        part_number: u32,
        #[source]
        source: S3ClientError,
    },

    #[error("S3 error: {0}")]
    S3Error(#[from] S3ClientError),

    #[error("Checksum error: {0}")]
    Checksum(#[from] ChecksumError),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidState { from: UploadState, to: UploadState },

    #[error("Upload cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl UploadError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ObjectTooLarge { .. } => "object_too_large",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::PartFailed { .. } => "part_failed",
            Self::S3Error(_) => "s3",
            Self::Checksum(_) => "checksum",
            Self::InvalidState { .. } => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::IoError(_) => "io",
            Self::Worker(_) => "worker",
        }
    }
}

/// How a put was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    SinglePut,
    Multipart,
    ParallelMultipart,
}

impl UploadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SinglePut => "single",
            Self::Multipart => "multipart",
            Self::ParallelMultipart => "parallel_multipart",
        }
    }
}

/// Upload result
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub etag: String,
    pub version_id: Option<String>,
    pub bytes_written: u64,
    pub parts: u32,
    pub strategy: UploadStrategy,
    /// Base64 object checksum sent with the request, when one was computed
    pub checksum: Option<String>,
}

/// The S3 calls an upload needs
///
/// Implemented by [`crate::s3::S3Client`]; tests substitute in-memory fakes.
#[async_trait::async_trait]
pub trait MultipartTransport: Send + Sync {
    async fn put_object(
        &self,
        request: S3PutObjectRequest,
    ) -> Result<S3PutObjectResponse, S3ClientError>;

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        headers: HeaderMap,
    ) -> Result<S3CreateMultipartUploadResponse, S3ClientError>;

    async fn upload_part(
        &self,
        request: S3UploadPartRequest,
    ) -> Result<S3UploadPartResponse, S3ClientError>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<S3CompletedPart>,
        headers: HeaderMap,
    ) -> Result<S3CompleteMultipartUploadResponse, S3ClientError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), S3ClientError>;
}
