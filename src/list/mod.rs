//! Listing module
//!
//! Cursor-paginated listing of objects, object versions, incomplete
//! multipart uploads and uploaded parts, delivered as a lazily produced
//! sequence of results.
//!
//! Every protocol shares one enumeration loop
//! ([`enumerator::spawn_listing`]); a [`PageSource`] only knows how to fetch
//! one page for a [`CursorState`] and how to derive the next cursor.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mizuchi_transfer::list::{spawn_listing, ListObjectsOptions, ObjectsV2Source};
//! use mizuchi_transfer::s3::{S3Client, S3ClientConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(S3Client::new(S3ClientConfig::new("http://localhost:9000"))?);
//! let source = ObjectsV2Source::new(client, "bucket", ListObjectsOptions::default());
//!
//! let mut listing = spawn_listing(source, CancellationToken::new());
//! while let Some(entry) = listing.recv().await {
//!     println!("{}", entry?.key());
//! }
//! # Ok(())
//! # }
//! ```

use crate::s3::{S3Checksums, S3ClientError};
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod enumerator;
pub mod protocol;
pub mod sequence;

pub use enumerator::{spawn_listing, PageSource};
pub use protocol::{ObjectsV1Source, ObjectsV2Source, PartsSource, UploadsSource, VersionsSource};
pub use sequence::ResultSequence;

/// Listing errors
#[derive(Error, Debug)]
pub enum ListError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("S3 error: {0}")]
    S3Error(#[from] S3ClientError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Listing cancelled")]
    Cancelled,
}

impl ListError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::S3Error(_) => "s3",
            Self::Decode(_) => "decode",
            Self::Cancelled => "cancelled",
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Owner {
    pub id: String,
    pub display_name: String,
}

/// An object in a bucket listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: String,
    pub storage_class: Option<String>,
    pub owner: Option<Owner>,
    pub user_metadata: BTreeMap<String, String>,
    pub user_tags: BTreeMap<String, String>,
}

/// One version of an object, or a delete marker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEntry {
    pub key: String,
    pub version_id: String,
    pub is_latest: bool,
    pub is_delete_marker: bool,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: String,
    pub storage_class: Option<String>,
    pub owner: Option<Owner>,
    pub user_metadata: BTreeMap<String, String>,
    pub user_tags: BTreeMap<String, String>,
}

/// An incomplete multipart upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadEntry {
    pub key: String,
    pub upload_id: String,
    pub initiated: Option<DateTime<Utc>>,
    pub storage_class: Option<String>,
    pub initiator: Option<Owner>,
}

/// A part already stored for an upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartEntry {
    /// Key of the object the upload belongs to
    pub key: String,
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub checksums: S3Checksums,
}

/// One item of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Object(ObjectEntry),
    Version(VersionEntry),
    Upload(UploadEntry),
    Part(PartEntry),
    /// A common prefix rolled up by the delimiter
    Prefix(String),
}

impl Entry {
    pub fn key(&self) -> &str {
        match self {
            Self::Object(o) => &o.key,
            Self::Version(v) => &v.key,
            Self::Upload(u) => &u.key,
            Self::Part(p) => &p.key,
            Self::Prefix(prefix) => prefix,
        }
    }

    pub fn is_prefix(&self) -> bool {
        matches!(self, Self::Prefix(_))
    }
}

// ============================================================================
// Pagination
// ============================================================================

/// Position to resume a listing from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    /// Objects v2
    ContinuationToken(String),
    /// Objects v1
    Marker(String),
    /// Object versions
    KeyVersion {
        key_marker: String,
        version_id_marker: String,
    },
    /// Incomplete uploads
    KeyUpload {
        key_marker: String,
        upload_id_marker: String,
    },
    /// Parts of one upload
    PartNumber(u32),
}

impl CursorState {
    /// An empty cursor cannot advance a listing
    pub fn is_empty(&self) -> bool {
        match self {
            Self::ContinuationToken(token) => token.is_empty(),
            Self::Marker(marker) => marker.is_empty(),
            Self::KeyVersion {
                key_marker,
                version_id_marker,
            } => key_marker.is_empty() && version_id_marker.is_empty(),
            Self::KeyUpload {
                key_marker,
                upload_id_marker,
            } => key_marker.is_empty() && upload_id_marker.is_empty(),
            Self::PartNumber(marker) => *marker == 0,
        }
    }
}

/// One decoded response page
#[derive(Debug, Clone)]
pub struct ListingPage {
    pub entries: Vec<Entry>,
    pub prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_cursor: CursorState,
}

/// Options for listing objects and versions
#[derive(Debug, Clone, Default)]
pub struct ListObjectsOptions {
    pub prefix: String,
    /// List everything below `prefix` instead of rolling up by `/`
    pub recursive: bool,
    /// Page size hint; 0 leaves it to the server
    pub max_keys: u32,
    pub start_after: String,
    pub with_versions: bool,
    /// Ask the server for user metadata and tags (vendor extension)
    pub with_metadata: bool,
    pub use_v1: bool,
    /// Extra request headers
    pub headers: HeaderMap,
}

impl ListObjectsOptions {
    pub fn delimiter(&self) -> &'static str {
        if self.recursive {
            ""
        } else {
            "/"
        }
    }
}
