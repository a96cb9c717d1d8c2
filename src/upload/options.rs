//! Upload options
//!
//! [`PutObjectOptions`] carries everything a caller can say about an upload:
//! object headers, object-lock settings, transfer tuning and the vendor
//! extensions for in-place updates. [`PutObjectOptions::validate`] runs before
//! any network call and [`PutObjectOptions::headers`] renders the options as
//! request headers.

use super::UploadError;
use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::utf8_percent_encode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;

use crate::s3::URI_UNRESERVED;

// ============================================================================
// Header names
// ============================================================================

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const META_PREFIX: &str = "x-amz-meta-";

pub const PARTIAL_UPDATE_MODE_HEADER: &str = "x-minio-partial-update-mode";
pub const PARTIAL_UPDATE_OFFSET_HEADER: &str = "x-minio-partial-update-offset";
pub const MERGE_MULTIPART_HEADER: &str = "x-minio-merge-multipart";
pub const ENGINE_POOL_HEADER: &str = "x-minio-preferred-engine-pool";
pub const SNOWBALL_EXTRACT_HEADER: &str = "x-amz-meta-snowball-auto-extract";
pub const SNOWBALL_IGNORE_DIRS_HEADER: &str = "x-amz-meta-minio-snowball-ignore-dirs";
pub const SNOWBALL_UPDATE_MTIME_HEADER: &str = "x-amz-meta-minio-snowball-update-mtime";

/// Headers that already have a dedicated option and must not be set through
/// user metadata.
const STANDARD_HEADERS: &[&str] = &[
    "content-type",
    "content-encoding",
    "content-disposition",
    "content-language",
    "cache-control",
    "expires",
    "x-amz-website-redirect-location",
    "x-amz-object-lock-mode",
    "x-amz-object-lock-retain-until-date",
    "x-amz-object-lock-legal-hold",
    "x-amz-tagging",
    "x-amz-replication-status",
];

const STORAGE_CLASS_HEADER: &str = "x-amz-storage-class";

// ============================================================================
// Option types
// ============================================================================

/// Object-lock retention mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionMode {
    Governance,
    Compliance,
}

impl RetentionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Governance => "GOVERNANCE",
            Self::Compliance => "COMPLIANCE",
        }
    }
}

/// Object-lock legal hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegalHoldStatus {
    On,
    Off,
}

impl LegalHoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

/// How a partial update applies its bytes to the existing object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialUpdateMode {
    Insert,
    Replace,
}

impl PartialUpdateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Replace => "replace",
        }
    }
}

/// In-place update of an existing object; an offset of -1 means the end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialUpdate {
    pub mode: PartialUpdateMode,
    pub offset: i64,
}

/// Storage engine pool hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePool {
    Hdd,
    Ssd,
}

impl EnginePool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hdd => "HDD",
            Self::Ssd => "SSD",
        }
    }
}

/// Options for a single put
#[derive(Debug, Clone, Default)]
pub struct PutObjectOptions {
    pub user_metadata: BTreeMap<String, String>,
    pub user_tags: BTreeMap<String, String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub cache_control: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub retention_mode: Option<RetentionMode>,
    pub retain_until_date: Option<DateTime<Utc>>,
    pub legal_hold: Option<LegalHoldStatus>,
    /// Pre-rendered server-side encryption headers
    pub encryption_headers: Vec<(String, String)>,
    pub storage_class: Option<String>,
    pub website_redirect_location: Option<String>,

    /// Worker count for parallel part uploads; 0 uses the default
    pub num_threads: usize,
    /// Requested part size; 0 uses the default
    pub part_size: u64,
    pub send_content_md5: bool,
    pub disable_content_sha256: bool,
    pub disable_multipart: bool,
    pub concurrent_stream_parts: bool,

    pub merge_multipart: bool,
    pub partial_update: Option<PartialUpdate>,
    pub append_mode: bool,
    pub preferred_engine_pool: Option<EnginePool>,
    pub snowball_extract: bool,
    pub snowball_ignore_dirs: bool,
    pub snowball_update_mtime: bool,

    /// Sent as `If-Match`; quoted on render unless already quoted
    pub match_etag: Option<String>,
    /// Sent as `If-None-Match`; `*` means "only if absent"
    pub match_etag_except: Option<String>,
}

/// Worker count used when `num_threads` is left at zero
pub const DEFAULT_NUM_THREADS: usize = 4;

impl PutObjectOptions {
    /// Only write if the current object has this ETag
    pub fn set_match_etag(&mut self, etag: &str) {
        self.match_etag = Some(etag.to_string());
    }

    /// Only write if the current object does not have this ETag; `*` means
    /// "only if absent"
    pub fn set_match_etag_except(&mut self, etag: &str) {
        self.match_etag_except = Some(etag.to_string());
    }

    /// Effective worker count
    pub fn workers(&self) -> usize {
        if self.num_threads == 0 {
            DEFAULT_NUM_THREADS
        } else {
            self.num_threads
        }
    }

    /// Whether parts should be uploaded concurrently
    pub fn is_parallel(&self) -> bool {
        self.concurrent_stream_parts && self.workers() > 1
    }

    /// Check option combinations and header names before any network call
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.append_mode && self.partial_update.is_some() {
            return Err(UploadError::Validation(
                "append mode and partial update cannot be combined".into(),
            ));
        }

        let updates_in_place = self.append_mode || self.partial_update.is_some();
        if updates_in_place && !self.disable_multipart {
            return Err(UploadError::Validation(
                "append and partial update require multipart to be disabled".into(),
            ));
        }
        if updates_in_place && self.preferred_engine_pool.is_some() {
            return Err(UploadError::Validation(
                "engine pool preference cannot be combined with append or partial update".into(),
            ));
        }
        if self.retain_until_date.is_some() != self.retention_mode.is_some() {
            return Err(UploadError::Validation(
                "retention mode and retain-until date must be set together".into(),
            ));
        }

        for (name, value) in &self.user_metadata {
            check_metadata_name(name)?;
            HeaderValue::from_str(value).map_err(|_| {
                UploadError::Validation(format!("invalid value for metadata {:?}", name))
            })?;
        }
        Ok(())
    }

    /// Effective partial update, with append mode expressed as an insert at the end
    pub fn effective_partial_update(&self) -> Option<PartialUpdate> {
        if self.append_mode {
            Some(PartialUpdate {
                mode: PartialUpdateMode::Insert,
                offset: -1,
            })
        } else {
            self.partial_update
        }
    }

    /// Render the options as request headers
    pub fn headers(&self) -> Result<HeaderMap, UploadError> {
        let mut headers = HeaderMap::new();

        let content_type = self
            .content_type
            .as_deref()
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        insert(&mut headers, "content-type", content_type)?;

        let optional = [
            ("content-encoding", self.content_encoding.as_deref()),
            ("content-disposition", self.content_disposition.as_deref()),
            ("content-language", self.content_language.as_deref()),
            ("cache-control", self.cache_control.as_deref()),
            (STORAGE_CLASS_HEADER, self.storage_class.as_deref()),
            (
                "x-amz-website-redirect-location",
                self.website_redirect_location.as_deref(),
            ),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                insert(&mut headers, name, value)?;
            }
        }

        if let Some(expires) = self.expires {
            insert(&mut headers, "expires", &expires.to_rfc2822())?;
        }
        if let Some(mode) = self.retention_mode {
            insert(&mut headers, "x-amz-object-lock-mode", mode.as_str())?;
        }
        if let Some(until) = self.retain_until_date {
            insert(
                &mut headers,
                "x-amz-object-lock-retain-until-date",
                &until.to_rfc3339_opts(SecondsFormat::Secs, true),
            )?;
        }
        if let Some(hold) = self.legal_hold {
            insert(&mut headers, "x-amz-object-lock-legal-hold", hold.as_str())?;
        }

        for (name, value) in &self.encryption_headers {
            insert(&mut headers, name, value)?;
        }

        if !self.user_tags.is_empty() {
            insert(&mut headers, "x-amz-tagging", &encode_tags(&self.user_tags))?;
        }

        if let Some(update) = self.effective_partial_update() {
            insert(&mut headers, PARTIAL_UPDATE_MODE_HEADER, update.mode.as_str())?;
            insert(
                &mut headers,
                PARTIAL_UPDATE_OFFSET_HEADER,
                &update.offset.to_string(),
            )?;
        }
        if self.merge_multipart {
            insert(&mut headers, MERGE_MULTIPART_HEADER, "true")?;
        }
        if let Some(pool) = self.preferred_engine_pool {
            insert(&mut headers, ENGINE_POOL_HEADER, pool.as_str())?;
        }
        if self.snowball_extract {
            insert(&mut headers, SNOWBALL_EXTRACT_HEADER, "true")?;
        }
        if self.snowball_ignore_dirs {
            insert(&mut headers, SNOWBALL_IGNORE_DIRS_HEADER, "true")?;
        }
        if self.snowball_update_mtime {
            insert(&mut headers, SNOWBALL_UPDATE_MTIME_HEADER, "true")?;
        }

        for (name, value) in &self.user_metadata {
            let lower = name.to_ascii_lowercase();
            if lower.starts_with("x-amz-") {
                insert(&mut headers, &lower, value)?;
            } else {
                insert(&mut headers, &format!("{}{}", META_PREFIX, lower), value)?;
            }
        }

        if let Some(etag) = &self.match_etag {
            insert(&mut headers, "if-match", &quote_etag(etag))?;
        }
        if let Some(etag) = &self.match_etag_except {
            insert(&mut headers, "if-none-match", &quote_etag(etag))?;
        }

        Ok(headers)
    }
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), UploadError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| UploadError::Validation(format!("invalid header name {:?}", name)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| UploadError::Validation(format!("invalid value for header {}", name)))?;
    headers.insert(name, value);
    Ok(())
}

fn quote_etag(etag: &str) -> String {
    if etag == "*" || etag.starts_with('"') {
        etag.to_string()
    } else {
        format!("\"{}\"", etag)
    }
}

/// `k1=v1&k2=v2`, both sides percent-encoded
pub fn encode_tags(tags: &BTreeMap<String, String>) -> String {
    tags.iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, URI_UNRESERVED),
                utf8_percent_encode(v, URI_UNRESERVED)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Reject metadata names that are not valid header names or that collide with
/// headers owned by other options.
fn check_metadata_name(name: &str) -> Result<(), UploadError> {
    if name.is_empty() || HeaderName::from_bytes(name.as_bytes()).is_err() {
        return Err(UploadError::Validation(format!(
            "invalid metadata name {:?}",
            name
        )));
    }

    let lower = name.to_ascii_lowercase();
    let bare = lower.strip_prefix(META_PREFIX).unwrap_or(&lower);

    if STANDARD_HEADERS.contains(&bare) {
        return Err(UploadError::Validation(format!(
            "metadata name {:?} is a standard header; use the dedicated option",
            name
        )));
    }
    if bare == STORAGE_CLASS_HEADER {
        return Err(UploadError::Validation(
            "storage class must be set through the storage_class option".into(),
        ));
    }
    if is_encryption_header(bare) {
        return Err(UploadError::Validation(format!(
            "metadata name {:?} is reserved for server-side encryption",
            name
        )));
    }
    Ok(())
}

fn is_encryption_header(name: &str) -> bool {
    name.starts_with("x-amz-server-side-encryption")
        || name.starts_with("x-amz-key")
        || name == "x-amz-iv"
        || name == "x-amz-matdesc"
}
