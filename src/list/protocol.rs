//! Listing protocols
//!
//! One [`PageSource`] per S3 listing API. Each builds the query for a
//! cursor, sends it through a [`RequestExecutor`], decodes the XML page and
//! derives the next cursor. Names returned with `encoding-type=url` are
//! decoded before they leave the page; a name that fails to decode fails the
//! whole page.

use super::{
    CursorState, Entry, ListError, ListObjectsOptions, ListingPage, ObjectEntry, Owner, PartEntry,
    UploadEntry, VersionEntry,
};
use crate::list::enumerator::PageSource;
use crate::s3::names::{check_bucket_name, check_object_name, check_object_prefix};
use crate::s3::{xml, RequestExecutor, S3Checksums, S3ClientError, S3Request};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use reqwest::Method;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Page size requested for part listings
pub const MAX_PARTS_PER_PAGE: u32 = 1000;

const URL_ENCODING: &str = "url";

// ============================================================================
// Objects (v2)
// ============================================================================

/// `ListObjectsV2`
pub struct ObjectsV2Source {
    executor: Arc<dyn RequestExecutor>,
    bucket: String,
    opts: ListObjectsOptions,
}

impl ObjectsV2Source {
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        bucket: impl Into<String>,
        opts: ListObjectsOptions,
    ) -> Self {
        Self {
            executor,
            bucket: bucket.into(),
            opts,
        }
    }

    fn request(&self, token: &str) -> S3Request {
        let mut request = S3Request::new(Method::GET, &self.bucket)
            .query("list-type", "2")
            .query("encoding-type", URL_ENCODING)
            .query("prefix", &self.opts.prefix)
            .query("delimiter", self.opts.delimiter())
            .query("fetch-owner", "true")
            .headers(self.opts.headers.clone());
        if self.opts.with_metadata {
            request = request.query("metadata", "true");
        }
        if !self.opts.start_after.is_empty() {
            request = request.query("start-after", &self.opts.start_after);
        }
        if !token.is_empty() {
            request = request.query("continuation-token", token);
        }
        if self.opts.max_keys > 0 {
            request = request.query("max-keys", self.opts.max_keys.to_string());
        }
        request
    }
}

#[async_trait::async_trait]
impl PageSource for ObjectsV2Source {
    fn protocol(&self) -> &'static str {
        "objects_v2"
    }

    fn validate(&self) -> Result<(), ListError> {
        validate_target(&self.bucket, &self.opts.prefix)
    }

    fn initial_cursor(&self) -> CursorState {
        CursorState::ContinuationToken(String::new())
    }

    async fn fetch_page(&self, cursor: &CursorState) -> Result<ListingPage, ListError> {
        let token = match cursor {
            CursorState::ContinuationToken(token) => token.as_str(),
            other => return Err(unexpected_cursor(self.protocol(), other)),
        };
        let body = fetch(self.executor.as_ref(), self.protocol(), self.request(token)).await?;
        let result: xml::ListBucketV2Result = decode_xml(&body)?;
        let encoding = result.encoding_type.as_deref();

        Ok(ListingPage {
            entries: object_entries(result.contents, encoding)?,
            prefixes: decode_prefixes(result.common_prefixes, encoding)?,
            is_truncated: result.is_truncated,
            next_cursor: CursorState::ContinuationToken(
                result.next_continuation_token.unwrap_or_default(),
            ),
        })
    }
}

// ============================================================================
// Objects (v1)
// ============================================================================

/// `ListObjects`, for deployments without v2 support
pub struct ObjectsV1Source {
    executor: Arc<dyn RequestExecutor>,
    bucket: String,
    opts: ListObjectsOptions,
}

impl ObjectsV1Source {
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        bucket: impl Into<String>,
        opts: ListObjectsOptions,
    ) -> Self {
        Self {
            executor,
            bucket: bucket.into(),
            opts,
        }
    }

    fn request(&self, marker: &str) -> S3Request {
        let mut request = S3Request::new(Method::GET, &self.bucket)
            .query("encoding-type", URL_ENCODING)
            .query("prefix", &self.opts.prefix)
            .query("delimiter", self.opts.delimiter())
            .headers(self.opts.headers.clone());
        if !marker.is_empty() {
            request = request.query("marker", marker);
        }
        if self.opts.max_keys > 0 {
            request = request.query("max-keys", self.opts.max_keys.to_string());
        }
        request
    }
}

#[async_trait::async_trait]
impl PageSource for ObjectsV1Source {
    fn protocol(&self) -> &'static str {
        "objects_v1"
    }

    fn validate(&self) -> Result<(), ListError> {
        validate_target(&self.bucket, &self.opts.prefix)
    }

    fn initial_cursor(&self) -> CursorState {
        CursorState::Marker(self.opts.start_after.clone())
    }

    async fn fetch_page(&self, cursor: &CursorState) -> Result<ListingPage, ListError> {
        let marker = match cursor {
            CursorState::Marker(marker) => marker.as_str(),
            other => return Err(unexpected_cursor(self.protocol(), other)),
        };
        let body = fetch(self.executor.as_ref(), self.protocol(), self.request(marker)).await?;
        let result: xml::ListBucketV1Result = decode_xml(&body)?;
        let encoding = result.encoding_type.as_deref();

        let entries = object_entries(result.contents, encoding)?;
        let prefixes = decode_prefixes(result.common_prefixes, encoding)?;

        // Servers may omit NextMarker; the last key then resumes the listing.
        let next_marker = match result.next_marker.filter(|m| !m.is_empty()) {
            Some(marker) => decode_name(&marker, encoding)?,
            None => entries
                .last()
                .map(|e| e.key().to_string())
                .unwrap_or_default(),
        };

        Ok(ListingPage {
            entries,
            prefixes,
            is_truncated: result.is_truncated,
            next_cursor: CursorState::Marker(next_marker),
        })
    }
}

// ============================================================================
// Object versions
// ============================================================================

/// `ListObjectVersions`
pub struct VersionsSource {
    executor: Arc<dyn RequestExecutor>,
    bucket: String,
    opts: ListObjectsOptions,
}

impl VersionsSource {
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        bucket: impl Into<String>,
        opts: ListObjectsOptions,
    ) -> Self {
        Self {
            executor,
            bucket: bucket.into(),
            opts,
        }
    }

    fn request(&self, key_marker: &str, version_id_marker: &str) -> S3Request {
        let mut request = S3Request::new(Method::GET, &self.bucket)
            .query("versions", "")
            .query("encoding-type", URL_ENCODING)
            .query("prefix", &self.opts.prefix)
            .query("delimiter", self.opts.delimiter())
            .headers(self.opts.headers.clone());
        if !key_marker.is_empty() {
            request = request.query("key-marker", key_marker);
        }
        if !version_id_marker.is_empty() {
            request = request.query("version-id-marker", version_id_marker);
        }
        if self.opts.max_keys > 0 {
            request = request.query("max-keys", self.opts.max_keys.to_string());
        }
        if self.opts.with_metadata {
            request = request.query("metadata", "true");
        }
        request
    }
}

#[async_trait::async_trait]
impl PageSource for VersionsSource {
    fn protocol(&self) -> &'static str {
        "versions"
    }

    fn validate(&self) -> Result<(), ListError> {
        validate_target(&self.bucket, &self.opts.prefix)
    }

    fn initial_cursor(&self) -> CursorState {
        CursorState::KeyVersion {
            key_marker: String::new(),
            version_id_marker: String::new(),
        }
    }

    async fn fetch_page(&self, cursor: &CursorState) -> Result<ListingPage, ListError> {
        let (key_marker, version_id_marker) = match cursor {
            CursorState::KeyVersion {
                key_marker,
                version_id_marker,
            } => (key_marker.as_str(), version_id_marker.as_str()),
            other => return Err(unexpected_cursor(self.protocol(), other)),
        };
        let request = self.request(key_marker, version_id_marker);
        let body = fetch(self.executor.as_ref(), self.protocol(), request).await?;
        let result = xml::ListVersionsResult::parse(&body).map_err(decode_error)?;
        let encoding = result.encoding_type.as_deref();

        let entries = result
            .versions
            .into_iter()
            .map(|v| -> Result<Entry, ListError> {
                Ok(Entry::Version(VersionEntry {
                    key: decode_name(&v.key, encoding)?,
                    version_id: v.version_id,
                    is_latest: v.is_latest,
                    is_delete_marker: v.is_delete_marker,
                    size: v.size,
                    last_modified: parse_time(v.last_modified.as_deref())?,
                    etag: trim_etag(&v.etag),
                    storage_class: v.storage_class,
                    owner: v.owner.map(to_owner),
                    user_metadata: v.user_metadata.unwrap_or_default(),
                    user_tags: parse_user_tags(v.user_tags.as_deref())?,
                }))
            })
            .collect::<Result<Vec<_>, ListError>>()?;

        Ok(ListingPage {
            entries,
            prefixes: decode_prefixes(result.common_prefixes, encoding)?,
            is_truncated: result.is_truncated,
            next_cursor: CursorState::KeyVersion {
                key_marker: decode_name(&result.next_key_marker.unwrap_or_default(), encoding)?,
                version_id_marker: result.next_version_id_marker.unwrap_or_default(),
            },
        })
    }
}

// ============================================================================
// Incomplete uploads
// ============================================================================

/// `ListMultipartUploads`
pub struct UploadsSource {
    executor: Arc<dyn RequestExecutor>,
    bucket: String,
    prefix: String,
    recursive: bool,
    max_uploads: u32,
}

impl UploadsSource {
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        recursive: bool,
    ) -> Self {
        Self {
            executor,
            bucket: bucket.into(),
            prefix: prefix.into(),
            recursive,
            max_uploads: 0,
        }
    }

    /// Page size hint; 0 leaves it to the server
    pub fn with_max_uploads(mut self, max_uploads: u32) -> Self {
        self.max_uploads = max_uploads;
        self
    }

    fn request(&self, key_marker: &str, upload_id_marker: &str) -> S3Request {
        let delimiter = if self.recursive { "" } else { "/" };
        let mut request = S3Request::new(Method::GET, &self.bucket)
            .query("uploads", "")
            .query("encoding-type", URL_ENCODING)
            .query("prefix", &self.prefix)
            .query("delimiter", delimiter);
        if !key_marker.is_empty() {
            request = request.query("key-marker", key_marker);
        }
        if !upload_id_marker.is_empty() {
            request = request.query("upload-id-marker", upload_id_marker);
        }
        if self.max_uploads > 0 {
            request = request.query("max-uploads", self.max_uploads.to_string());
        }
        request
    }
}

#[async_trait::async_trait]
impl PageSource for UploadsSource {
    fn protocol(&self) -> &'static str {
        "uploads"
    }

    fn validate(&self) -> Result<(), ListError> {
        validate_target(&self.bucket, &self.prefix)
    }

    fn initial_cursor(&self) -> CursorState {
        CursorState::KeyUpload {
            key_marker: String::new(),
            upload_id_marker: String::new(),
        }
    }

    async fn fetch_page(&self, cursor: &CursorState) -> Result<ListingPage, ListError> {
        let (key_marker, upload_id_marker) = match cursor {
            CursorState::KeyUpload {
                key_marker,
                upload_id_marker,
            } => (key_marker.as_str(), upload_id_marker.as_str()),
            other => return Err(unexpected_cursor(self.protocol(), other)),
        };
        let request = self.request(key_marker, upload_id_marker);
        let body = fetch(self.executor.as_ref(), self.protocol(), request).await?;
        let result: xml::ListMultipartUploadsResult = decode_xml(&body)?;
        let encoding = result.encoding_type.as_deref();

        let entries = result
            .uploads
            .into_iter()
            .map(|u| -> Result<Entry, ListError> {
                Ok(Entry::Upload(UploadEntry {
                    key: decode_name(&u.key, encoding)?,
                    upload_id: u.upload_id,
                    initiated: parse_time(u.initiated.as_deref())?,
                    storage_class: u.storage_class,
                    initiator: u.initiator.map(to_owner),
                }))
            })
            .collect::<Result<Vec<_>, ListError>>()?;

        Ok(ListingPage {
            entries,
            prefixes: decode_prefixes(result.common_prefixes, encoding)?,
            is_truncated: result.is_truncated,
            next_cursor: CursorState::KeyUpload {
                key_marker: decode_name(&result.next_key_marker.unwrap_or_default(), encoding)?,
                upload_id_marker: decode_name(
                    &result.next_upload_id_marker.unwrap_or_default(),
                    encoding,
                )?,
            },
        })
    }
}

// ============================================================================
// Upload parts
// ============================================================================

/// `ListParts` for one upload
pub struct PartsSource {
    executor: Arc<dyn RequestExecutor>,
    bucket: String,
    key: String,
    upload_id: String,
}

impl PartsSource {
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        upload_id: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            bucket: bucket.into(),
            key: key.into(),
            upload_id: upload_id.into(),
        }
    }

    fn request(&self, part_number_marker: u32) -> S3Request {
        S3Request::new(Method::GET, &self.bucket)
            .key(&self.key)
            .query("uploadId", &self.upload_id)
            .query("part-number-marker", part_number_marker.to_string())
            .query("max-parts", MAX_PARTS_PER_PAGE.to_string())
    }
}

#[async_trait::async_trait]
impl PageSource for PartsSource {
    fn protocol(&self) -> &'static str {
        "parts"
    }

    fn validate(&self) -> Result<(), ListError> {
        check_bucket_name(&self.bucket).map_err(|e| ListError::Validation(e.to_string()))?;
        check_object_name(&self.key).map_err(|e| ListError::Validation(e.to_string()))?;
        if self.upload_id.is_empty() {
            return Err(ListError::Validation("upload id cannot be empty".into()));
        }
        Ok(())
    }

    fn initial_cursor(&self) -> CursorState {
        CursorState::PartNumber(0)
    }

    async fn fetch_page(&self, cursor: &CursorState) -> Result<ListingPage, ListError> {
        let marker = match cursor {
            CursorState::PartNumber(marker) => *marker,
            other => return Err(unexpected_cursor(self.protocol(), other)),
        };
        let body = fetch(self.executor.as_ref(), self.protocol(), self.request(marker)).await?;
        let result: xml::ListPartsResult = decode_xml(&body)?;

        let entries = result
            .parts
            .into_iter()
            .map(|p| -> Result<Entry, ListError> {
                Ok(Entry::Part(PartEntry {
                    key: self.key.clone(),
                    part_number: p.part_number,
                    etag: trim_etag(&p.etag),
                    size: p.size,
                    last_modified: parse_time(p.last_modified.as_deref())?,
                    checksums: S3Checksums {
                        crc32: p.checksum_crc32,
                        crc32c: p.checksum_crc32c,
                        sha1: p.checksum_sha1,
                        sha256: p.checksum_sha256,
                    },
                }))
            })
            .collect::<Result<Vec<_>, ListError>>()?;

        Ok(ListingPage {
            entries,
            prefixes: Vec::new(),
            is_truncated: result.is_truncated,
            next_cursor: CursorState::PartNumber(result.next_part_number_marker.unwrap_or(0)),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn validate_target(bucket: &str, prefix: &str) -> Result<(), ListError> {
    check_bucket_name(bucket).map_err(|e| ListError::Validation(e.to_string()))?;
    check_object_prefix(prefix).map_err(|e| ListError::Validation(e.to_string()))
}

fn unexpected_cursor(protocol: &str, cursor: &CursorState) -> ListError {
    ListError::ProtocolViolation(format!("{} cannot resume from {:?}", protocol, cursor))
}

/// Send one listing request and return the body text
#[tracing::instrument(
    name = "s3.list_page",
    skip(executor, request),
    fields(
        s3.bucket = %request.bucket,
        list.protocol = protocol,
        http.response_bytes = tracing::field::Empty
    ),
    err
)]
async fn fetch(
    executor: &dyn RequestExecutor,
    protocol: &str,
    request: S3Request,
) -> Result<String, ListError> {
    let response = executor.execute(request).await?;
    tracing::Span::current().record("http.response_bytes", response.body.len());
    let text = response.text().map_err(decode_error)?;
    Ok(text.to_string())
}

fn decode_xml<'de, T: serde::Deserialize<'de>>(body: &'de str) -> Result<T, ListError> {
    xml::from_xml(body).map_err(decode_error)
}

fn decode_error(e: S3ClientError) -> ListError {
    match e {
        S3ClientError::ResponseError(message) => ListError::Decode(message),
        other => ListError::S3Error(other),
    }
}

/// Decode a name the server returned with the given `EncodingType`
///
/// `url` encoding follows query-string rules: `+` is a space and every `%`
/// must start a two-digit hex escape.
pub fn decode_name(name: &str, encoding: Option<&str>) -> Result<String, ListError> {
    if encoding != Some(URL_ENCODING) {
        return Ok(name.to_string());
    }

    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(ListError::Decode(format!("invalid escape in name {:?}", name)));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    percent_decode_str(&name.replace('+', " "))
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| ListError::Decode(format!("name {:?} is not UTF-8: {}", name, e)))
}

fn decode_prefixes(
    prefixes: Vec<xml::CommonPrefix>,
    encoding: Option<&str>,
) -> Result<Vec<String>, ListError> {
    prefixes
        .into_iter()
        .map(|p| decode_name(&p.prefix, encoding))
        .collect()
}

fn object_entries(
    contents: Vec<xml::ObjectContents>,
    encoding: Option<&str>,
) -> Result<Vec<Entry>, ListError> {
    contents
        .into_iter()
        .map(|o| -> Result<Entry, ListError> {
            Ok(Entry::Object(ObjectEntry {
                key: decode_name(&o.key, encoding)?,
                size: o.size,
                last_modified: parse_time(o.last_modified.as_deref())?,
                etag: trim_etag(&o.etag),
                storage_class: o.storage_class,
                owner: o.owner.map(to_owner),
                user_metadata: o.user_metadata.unwrap_or_default(),
                user_tags: parse_user_tags(o.user_tags.as_deref())?,
            }))
        })
        .collect()
}

fn to_owner(owner: xml::Owner) -> Owner {
    Owner {
        id: owner.id,
        display_name: owner.display_name,
    }
}

/// Strip the quotes S3 puts around ETags
pub fn trim_etag(etag: &str) -> String {
    etag.trim_start_matches('"').trim_end_matches('"').to_string()
}

/// Parse an RFC 3339 timestamp, truncated to milliseconds
pub fn parse_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>, ListError> {
    let value = match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value,
        None => return Ok(None),
    };
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|e| ListError::Decode(format!("bad timestamp {:?}: {}", value, e)))?;
    DateTime::from_timestamp_millis(parsed.timestamp_millis())
        .map(Some)
        .ok_or_else(|| ListError::Decode(format!("timestamp {:?} out of range", value)))
}

/// Parse `k1=v1&k2=v2` tag sets
fn parse_user_tags(tags: Option<&str>) -> Result<BTreeMap<String, String>, ListError> {
    let mut parsed = BTreeMap::new();
    for pair in tags.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        parsed.insert(
            decode_name(name, Some(URL_ENCODING))?,
            decode_name(value, Some(URL_ENCODING))?,
        );
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::spawn_listing;
    use crate::s3::S3Response;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use reqwest::header::HeaderMap;
    use std::collections::VecDeque;
    use tokio_util::sync::CancellationToken;

    /// Replays canned bodies and keeps every request it saw
    #[derive(Default)]
    struct FakeExecutor {
        bodies: Mutex<VecDeque<Result<String, S3ClientError>>>,
        requests: Mutex<Vec<S3Request>>,
    }

    impl FakeExecutor {
        fn new(bodies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                bodies: Mutex::new(bodies.iter().map(|b| Ok(b.to_string())).collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing(error: S3ClientError) -> Arc<Self> {
            Arc::new(Self {
                bodies: Mutex::new(VecDeque::from([Err(error)])),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request(&self, n: usize) -> S3Request {
            self.requests.lock()[n].clone()
        }

        fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait::async_trait]
    impl RequestExecutor for FakeExecutor {
        async fn execute(&self, request: S3Request) -> Result<S3Response, S3ClientError> {
            self.requests.lock().push(request);
            let body = self
                .bodies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(S3ClientError::RequestError("no more pages".into())))?;
            Ok(S3Response {
                status: 200,
                headers: HeaderMap::new(),
                body: Bytes::from(body),
            })
        }
    }

    fn keys(items: &[Result<Entry, ListError>]) -> Vec<String> {
        items
            .iter()
            .map(|item| item.as_ref().unwrap().key().to_string())
            .collect()
    }

    const V2_PAGE_1: &str = r#"<ListBucketResult>
        <IsTruncated>true</IsTruncated>
        <NextContinuationToken>tok1</NextContinuationToken>
        <EncodingType>url</EncodingType>
        <Contents><Key>a</Key><ETag>"e1"</ETag><Size>1</Size><LastModified>2024-05-01T10:20:30.123456Z</LastModified></Contents>
        <Contents><Key>b</Key><ETag>"e2"</ETag><Size>2</Size></Contents>
    </ListBucketResult>"#;

    const V2_PAGE_2: &str = r#"<ListBucketResult>
        <IsTruncated>false</IsTruncated>
        <EncodingType>url</EncodingType>
        <Contents><Key>c</Key><ETag>"e3"</ETag><Size>3</Size></Contents>
    </ListBucketResult>"#;

    // ========================================================================
    // TEST: objects v2
    // ========================================================================

    #[tokio::test]
    async fn test_v2_two_pages() {
        let executor = FakeExecutor::new(&[V2_PAGE_1, V2_PAGE_2]);
        let source = ObjectsV2Source::new(executor.clone(), "bucket", ListObjectsOptions::default());

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert_eq!(keys(&items), vec!["a", "b", "c"]);
        assert_eq!(executor.request_count(), 2);

        let first = executor.request(0);
        assert_eq!(first.query_value("list-type"), Some("2"));
        assert_eq!(first.query_value("encoding-type"), Some("url"));
        assert_eq!(first.query_value("delimiter"), Some("/"));
        assert_eq!(first.query_value("fetch-owner"), Some("true"));
        assert_eq!(first.query_value("continuation-token"), None);
        assert_eq!(first.query_value("metadata"), None);

        let second = executor.request(1);
        assert_eq!(second.query_value("continuation-token"), Some("tok1"));
    }

    #[tokio::test]
    async fn test_v2_entry_fields() {
        let executor = FakeExecutor::new(&[V2_PAGE_1, V2_PAGE_2]);
        let source = ObjectsV2Source::new(executor, "bucket", ListObjectsOptions::default());

        let mut listing = spawn_listing(source, CancellationToken::new());
        let first = listing.recv().await.unwrap().unwrap();
        let Entry::Object(object) = first else {
            panic!("expected an object entry");
        };
        assert_eq!(object.etag, "e1");
        assert_eq!(object.size, 1);
        let modified = object.last_modified.unwrap();
        assert_eq!(modified.timestamp_subsec_millis(), 123);
        assert_eq!(modified.timestamp_subsec_nanos(), 123_000_000);
    }

    #[tokio::test]
    async fn test_v2_query_options() {
        let executor = FakeExecutor::new(&[V2_PAGE_2]);
        let opts = ListObjectsOptions {
            prefix: "photos/".into(),
            recursive: true,
            max_keys: 50,
            start_after: "photos/b".into(),
            with_metadata: true,
            ..Default::default()
        };
        let source = ObjectsV2Source::new(executor.clone(), "bucket", opts);
        spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        let request = executor.request(0);
        assert_eq!(request.query_value("prefix"), Some("photos/"));
        assert_eq!(request.query_value("delimiter"), Some(""));
        assert_eq!(request.query_value("max-keys"), Some("50"));
        assert_eq!(request.query_value("start-after"), Some("photos/b"));
        assert_eq!(request.query_value("metadata"), Some("true"));
    }

    #[tokio::test]
    async fn test_v2_decodes_keys_and_prefixes() {
        let body = r#"<ListBucketResult>
            <IsTruncated>false</IsTruncated>
            <EncodingType>url</EncodingType>
            <Contents><Key>my+file%2B1.txt</Key><Size>1</Size></Contents>
            <CommonPrefixes><Prefix>dir%20one/</Prefix></CommonPrefixes>
        </ListBucketResult>"#;
        let executor = FakeExecutor::new(&[body]);
        let source = ObjectsV2Source::new(executor, "bucket", ListObjectsOptions::default());

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert_eq!(keys(&items), vec!["my file+1.txt", "dir one/"]);
        assert!(items[1].as_ref().unwrap().is_prefix());
    }

    #[tokio::test]
    async fn test_bad_escape_fails_whole_page() {
        let body = r#"<ListBucketResult>
            <IsTruncated>false</IsTruncated>
            <EncodingType>url</EncodingType>
            <Contents><Key>good</Key><Size>1</Size></Contents>
            <Contents><Key>bad%zz</Key><Size>1</Size></Contents>
        </ListBucketResult>"#;
        let executor = FakeExecutor::new(&[body]);
        let source = ObjectsV2Source::new(executor, "bucket", ListObjectsOptions::default());

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ListError::Decode(_))));
    }

    #[tokio::test]
    async fn test_malformed_xml_is_decode_error() {
        let executor = FakeExecutor::new(&["<ListBucketResult><IsTruncated>maybe"]);
        let source = ObjectsV2Source::new(executor, "bucket", ListObjectsOptions::default());

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;
        assert!(matches!(items[..], [Err(ListError::Decode(_))]));
    }

    #[tokio::test]
    async fn test_service_error_surfaces() {
        let executor = FakeExecutor::failing(S3ClientError::Service {
            status: 404,
            code: "NoSuchBucket".into(),
            message: "missing".into(),
        });
        let source = ObjectsV2Source::new(executor, "bucket", ListObjectsOptions::default());

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;
        match &items[..] {
            [Err(ListError::S3Error(e))] => assert_eq!(e.code(), Some("NoSuchBucket")),
            other => panic!("unexpected items: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_bucket_makes_no_request() {
        let executor = FakeExecutor::new(&[V2_PAGE_2]);
        let source = ObjectsV2Source::new(executor.clone(), "a", ListObjectsOptions::default());

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert!(matches!(items[..], [Err(ListError::Validation(_))]));
        assert_eq!(executor.request_count(), 0);
    }

    // ========================================================================
    // TEST: objects v1
    // ========================================================================

    #[tokio::test]
    async fn test_v1_falls_back_to_last_key() {
        let page1 = r#"<ListBucketResult>
            <IsTruncated>true</IsTruncated>
            <Contents><Key>a</Key></Contents>
            <Contents><Key>b</Key></Contents>
        </ListBucketResult>"#;
        let page2 = r#"<ListBucketResult>
            <IsTruncated>false</IsTruncated>
            <Contents><Key>c</Key></Contents>
        </ListBucketResult>"#;
        let executor = FakeExecutor::new(&[page1, page2]);
        let opts = ListObjectsOptions {
            start_after: "0".into(),
            ..Default::default()
        };
        let source = ObjectsV1Source::new(executor.clone(), "bucket", opts);

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert_eq!(keys(&items), vec!["a", "b", "c"]);
        assert_eq!(executor.request(0).query_value("marker"), Some("0"));
        assert_eq!(executor.request(0).query_value("list-type"), None);
        assert_eq!(executor.request(1).query_value("marker"), Some("b"));
    }

    #[tokio::test]
    async fn test_v1_prefers_next_marker() {
        let page1 = r#"<ListBucketResult>
            <IsTruncated>true</IsTruncated>
            <EncodingType>url</EncodingType>
            <NextMarker>dir%2Fz</NextMarker>
            <Contents><Key>a</Key></Contents>
        </ListBucketResult>"#;
        let page2 = r#"<ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>"#;
        let executor = FakeExecutor::new(&[page1, page2]);
        let source = ObjectsV1Source::new(executor.clone(), "bucket", ListObjectsOptions::default());

        spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;
        assert_eq!(executor.request(1).query_value("marker"), Some("dir/z"));
    }

    // ========================================================================
    // TEST: versions
    // ========================================================================

    #[tokio::test]
    async fn test_versions_with_delete_markers() {
        let page1 = r#"<ListVersionsResult>
            <IsTruncated>true</IsTruncated>
            <NextKeyMarker>b</NextKeyMarker>
            <NextVersionIdMarker>v9</NextVersionIdMarker>
            <Version><Key>a</Key><VersionId>v1</VersionId><IsLatest>true</IsLatest><ETag>"x"</ETag><Size>4</Size></Version>
            <DeleteMarker><Key>b</Key><VersionId>v9</VersionId><IsLatest>true</IsLatest></DeleteMarker>
        </ListVersionsResult>"#;
        let page2 = r#"<ListVersionsResult>
            <IsTruncated>false</IsTruncated>
            <Version><Key>b</Key><VersionId>v8</VersionId></Version>
        </ListVersionsResult>"#;
        let executor = FakeExecutor::new(&[page1, page2]);
        let source = VersionsSource::new(executor.clone(), "bucket", ListObjectsOptions::default());

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        let versions: Vec<(String, String, bool)> = items
            .into_iter()
            .map(|item| match item.unwrap() {
                Entry::Version(v) => (v.key, v.version_id, v.is_delete_marker),
                other => panic!("unexpected entry {:?}", other),
            })
            .collect();
        assert_eq!(
            versions,
            vec![
                ("a".to_string(), "v1".to_string(), false),
                ("b".to_string(), "v9".to_string(), true),
                ("b".to_string(), "v8".to_string(), false),
            ]
        );

        let first = executor.request(0);
        assert_eq!(first.query_value("versions"), Some(""));
        assert_eq!(first.query_value("key-marker"), None);
        let second = executor.request(1);
        assert_eq!(second.query_value("key-marker"), Some("b"));
        assert_eq!(second.query_value("version-id-marker"), Some("v9"));
    }

    // ========================================================================
    // TEST: uploads and parts
    // ========================================================================

    #[tokio::test]
    async fn test_uploads_pages() {
        let page1 = r#"<ListMultipartUploadsResult>
            <IsTruncated>true</IsTruncated>
            <NextKeyMarker>k1</NextKeyMarker>
            <NextUploadIdMarker>u1</NextUploadIdMarker>
            <Upload><Key>k1</Key><UploadId>u1</UploadId><Initiated>2024-01-02T03:04:05.000Z</Initiated></Upload>
        </ListMultipartUploadsResult>"#;
        let page2 = r#"<ListMultipartUploadsResult>
            <IsTruncated>false</IsTruncated>
            <Upload><Key>k2</Key><UploadId>u2</UploadId></Upload>
        </ListMultipartUploadsResult>"#;
        let executor = FakeExecutor::new(&[page1, page2]);
        let source = UploadsSource::new(executor.clone(), "bucket", "k", true).with_max_uploads(1);

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert_eq!(keys(&items), vec!["k1", "k2"]);
        let first = executor.request(0);
        assert_eq!(first.query_value("uploads"), Some(""));
        assert_eq!(first.query_value("delimiter"), Some(""));
        assert_eq!(first.query_value("max-uploads"), Some("1"));
        let second = executor.request(1);
        assert_eq!(second.query_value("key-marker"), Some("k1"));
        assert_eq!(second.query_value("upload-id-marker"), Some("u1"));
    }

    #[tokio::test]
    async fn test_parts_pages() {
        let page1 = r#"<ListPartsResult>
            <IsTruncated>true</IsTruncated>
            <NextPartNumberMarker>1</NextPartNumberMarker>
            <Part><PartNumber>1</PartNumber><ETag>"p1"</ETag><Size>5</Size><ChecksumCRC32C>AAAAAA==</ChecksumCRC32C></Part>
        </ListPartsResult>"#;
        let page2 = r#"<ListPartsResult>
            <IsTruncated>false</IsTruncated>
            <Part><PartNumber>2</PartNumber><ETag>"p2"</ETag><Size>3</Size></Part>
        </ListPartsResult>"#;
        let executor = FakeExecutor::new(&[page1, page2]);
        let source = PartsSource::new(executor.clone(), "bucket", "big.bin", "up-1");

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        let parts: Vec<PartEntry> = items
            .into_iter()
            .map(|item| match item.unwrap() {
                Entry::Part(p) => p,
                other => panic!("unexpected entry {:?}", other),
            })
            .collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].key, "big.bin");
        assert_eq!(parts[0].etag, "p1");
        assert_eq!(parts[0].checksums.crc32c.as_deref(), Some("AAAAAA=="));

        let first = executor.request(0);
        assert_eq!(first.key.as_deref(), Some("big.bin"));
        assert_eq!(first.query_value("uploadId"), Some("up-1"));
        assert_eq!(first.query_value("part-number-marker"), Some("0"));
        assert_eq!(first.query_value("max-parts"), Some("1000"));
        assert_eq!(executor.request(1).query_value("part-number-marker"), Some("1"));
    }

    #[tokio::test]
    async fn test_parts_truncated_without_marker() {
        let page = r#"<ListPartsResult>
            <IsTruncated>true</IsTruncated>
            <Part><PartNumber>1</PartNumber><ETag>"p1"</ETag></Part>
        </ListPartsResult>"#;
        let executor = FakeExecutor::new(&[page]);
        let source = PartsSource::new(executor.clone(), "bucket", "big.bin", "up-1");

        let items = spawn_listing(source, CancellationToken::new())
            .collect_all()
            .await;

        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ListError::ProtocolViolation(_))));
        assert_eq!(executor.request_count(), 1);
    }

    // ========================================================================
    // TEST: helpers
    // ========================================================================

    #[test]
    fn test_decode_name() {
        assert_eq!(decode_name("a+b", None).unwrap(), "a+b");
        assert_eq!(decode_name("a+b%2Fc", Some("url")).unwrap(), "a b/c");
        assert_eq!(decode_name("%E2%9C%93", Some("url")).unwrap(), "\u{2713}");
        assert!(decode_name("trailing%2", Some("url")).is_err());
        assert!(decode_name("%ff", Some("url")).is_err());
    }

    #[test]
    fn test_trim_etag() {
        assert_eq!(trim_etag("\"abc\""), "abc");
        assert_eq!(trim_etag("abc-2"), "abc-2");
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time(None).unwrap(), None);
        assert!(parse_time(Some("yesterday")).is_err());
        let parsed = parse_time(Some("2024-05-01T10:20:30Z")).unwrap().unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-05-01T10:20:30+00:00");
    }

    #[test]
    fn test_parse_user_tags() {
        let tags = parse_user_tags(Some("team=core&env=prod%20eu")).unwrap();
        assert_eq!(tags.get("team").map(String::as_str), Some("core"));
        assert_eq!(tags.get("env").map(String::as_str), Some("prod eu"));
        assert!(parse_user_tags(None).unwrap().is_empty());
    }
}
