//! High-level client
//!
//! Ties the S3 transport, the upload coordinator and the listing protocols
//! together behind one handle.
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_transfer::{Client, Config};
//! use mizuchi_transfer::list::ListObjectsOptions;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::from_config(&Config::load("config.yaml")?)?;
//!
//! let data = b"hello".to_vec();
//! let opts = client.upload_defaults();
//! client.put_object("bucket", "hello.txt", &data[..], Some(5), &opts).await?;
//!
//! let mut listing = client.list_objects("bucket", ListObjectsOptions::default());
//! while let Some(entry) = listing.recv().await {
//!     println!("{}", entry?.key());
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::Config;
use crate::list::{
    spawn_listing, Entry, ListError, ListObjectsOptions, ObjectsV1Source, ObjectsV2Source,
    PartEntry, PartsSource, ResultSequence, UploadsSource, VersionsSource,
};
use crate::s3::{RequestExecutor, S3Client, S3ClientConfig, S3ClientError};
use crate::upload::planner::MAX_PART_SIZE;
use crate::upload::{
    MultipartUploadCoordinator, PartialUpdate, PutObjectOptions, UploadError, UploadResult,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Object name used for archives sent to [`Client::extract_online`]
pub const EXTRACT_OBJECT_NAME: &str = "extractfile";

/// Listing stream returned by the `list_*` calls
pub type Listing = ResultSequence<Result<Entry, ListError>>;

/// S3 transfer client
pub struct Client {
    s3: Arc<S3Client>,
    coordinator: MultipartUploadCoordinator,
    upload_defaults: PutObjectOptions,
    listing_defaults: ListObjectsOptions,
}

impl Client {
    pub fn new(s3: S3Client) -> Self {
        let s3 = Arc::new(s3);
        Self {
            coordinator: MultipartUploadCoordinator::new(s3.clone()),
            s3,
            upload_defaults: PutObjectOptions::default(),
            listing_defaults: ListObjectsOptions::default(),
        }
    }

    /// Build a client from a loaded configuration
    pub fn from_config(config: &Config) -> Result<Self, S3ClientError> {
        let s3 = S3Client::new(S3ClientConfig::from_config(&config.s3)?)?;
        let mut client = Self::new(s3);
        client.upload_defaults = config.upload.to_options();
        client.listing_defaults = config.listing.to_options();
        Ok(client)
    }

    pub fn s3(&self) -> &Arc<S3Client> {
        &self.s3
    }

    /// The coordinator used by the put calls
    pub fn uploader(&self) -> &MultipartUploadCoordinator {
        &self.coordinator
    }

    /// Upload options seeded from the configuration
    pub fn upload_defaults(&self) -> PutObjectOptions {
        self.upload_defaults.clone()
    }

    /// Listing options seeded from the configuration
    pub fn listing_defaults(&self) -> ListObjectsOptions {
        self.listing_defaults.clone()
    }

    // ========================================================================
    // Uploads
    // ========================================================================

    /// Upload an object; `size` of `None` streams until the source ends
    pub async fn put_object<R>(
        &self,
        bucket: &str,
        key: &str,
        source: R,
        size: Option<u64>,
        options: &PutObjectOptions,
    ) -> Result<UploadResult, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.coordinator
            .upload(bucket, key, source, size, options)
            .await
    }

    /// Append `source` to the end of an existing object
    pub async fn append_object<R>(
        &self,
        bucket: &str,
        key: &str,
        source: R,
        size: u64,
    ) -> Result<UploadResult, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let options = PutObjectOptions {
            append_mode: true,
            ..in_place_options(size)?
        };
        self.put_object(bucket, key, source, Some(size), &options)
            .await
    }

    /// Insert or replace bytes of an existing object at `update.offset`
    ///
    /// An offset of -1 addresses the end of the object.
    pub async fn update_object<R>(
        &self,
        bucket: &str,
        key: &str,
        update: PartialUpdate,
        source: R,
        size: u64,
    ) -> Result<UploadResult, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if update.offset < -1 {
            return Err(UploadError::InvalidArgument(format!(
                "update offset {} must not be below -1",
                update.offset
            )));
        }
        let options = PutObjectOptions {
            partial_update: Some(update),
            ..in_place_options(size)?
        };
        self.put_object(bucket, key, source, Some(size), &options)
            .await
    }

    /// Upload an archive the server unpacks into `bucket`
    pub async fn extract_online<R>(
        &self,
        bucket: &str,
        source: R,
        size: u64,
        ignore_dirs: bool,
        update_mtime: bool,
    ) -> Result<UploadResult, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let options = PutObjectOptions {
            snowball_extract: true,
            snowball_ignore_dirs: ignore_dirs,
            snowball_update_mtime: update_mtime,
            ..in_place_options(size)?
        };
        self.put_object(bucket, EXTRACT_OBJECT_NAME, source, Some(size), &options)
            .await
    }

    // ========================================================================
    // Listings
    // ========================================================================

    /// List objects, or object versions when `opts.with_versions` is set
    ///
    /// The v1 protocol is used when requested, or when the bucket's cached
    /// location marks an appliance that lacks v2.
    pub fn list_objects(&self, bucket: &str, opts: ListObjectsOptions) -> Listing {
        self.list_objects_with_cancellation(bucket, opts, CancellationToken::new())
    }

    pub fn list_objects_with_cancellation(
        &self,
        bucket: &str,
        opts: ListObjectsOptions,
        cancel: CancellationToken,
    ) -> Listing {
        let executor = self.executor();
        if opts.with_versions {
            tracing::debug!(s3.bucket = %bucket, "Listing object versions");
            return spawn_listing(VersionsSource::new(executor, bucket, opts), cancel);
        }
        if opts.use_v1 || self.s3.location_cache().requires_v1_listing(bucket) {
            tracing::debug!(s3.bucket = %bucket, "Listing objects with v1 protocol");
            return spawn_listing(ObjectsV1Source::new(executor, bucket, opts), cancel);
        }
        spawn_listing(ObjectsV2Source::new(executor, bucket, opts), cancel)
    }

    /// List multipart uploads that were started but never completed
    pub fn list_incomplete_uploads(&self, bucket: &str, prefix: &str, recursive: bool) -> Listing {
        spawn_listing(
            UploadsSource::new(self.executor(), bucket, prefix, recursive),
            CancellationToken::new(),
        )
    }

    /// List the parts already stored for an upload
    pub fn list_upload_parts(&self, bucket: &str, key: &str, upload_id: &str) -> Listing {
        spawn_listing(
            PartsSource::new(self.executor(), bucket, key, upload_id),
            CancellationToken::new(),
        )
    }

    /// Collect every stored part of an upload, keyed by part number
    pub async fn list_object_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<BTreeMap<u32, PartEntry>, ListError> {
        let mut listing = self.list_upload_parts(bucket, key, upload_id);
        let mut parts = BTreeMap::new();
        while let Some(entry) = listing.recv().await {
            if let Entry::Part(part) = entry? {
                parts.insert(part.part_number, part);
            }
        }
        Ok(parts)
    }

    /// Upload ids of incomplete uploads for exactly `key`
    pub async fn find_upload_ids(&self, bucket: &str, key: &str) -> Result<Vec<String>, ListError> {
        let mut listing = self.list_incomplete_uploads(bucket, key, true);
        let mut upload_ids = Vec::new();
        while let Some(entry) = listing.recv().await {
            if let Entry::Upload(upload) = entry? {
                if upload.key == key {
                    upload_ids.push(upload.upload_id);
                }
            }
        }
        Ok(upload_ids)
    }

    /// Region of `bucket`; also primes the listing protocol choice
    pub async fn bucket_location(&self, bucket: &str) -> Result<String, S3ClientError> {
        self.s3.bucket_location(bucket).await
    }

    fn executor(&self) -> Arc<dyn RequestExecutor> {
        self.s3.clone()
    }
}

/// Options shared by the in-place write calls; these always go out as a
/// single PUT of a known size
fn in_place_options(size: u64) -> Result<PutObjectOptions, UploadError> {
    if size >= MAX_PART_SIZE {
        return Err(UploadError::InvalidArgument(format!(
            "in-place write of {} bytes must be below {} bytes",
            size, MAX_PART_SIZE
        )));
    }
    Ok(PutObjectOptions {
        disable_multipart: true,
        part_size: MAX_PART_SIZE,
        ..PutObjectOptions::default()
    })
}
