//! Metrics module
//!
//! Prometheus counters and histograms for uploads and listings, registered
//! in the default registry. [`gather_text`] renders them in the text
//! exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_uploads_total",
        "Total number of uploads",
        &["bucket", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "mizuchi_upload_bytes_total",
        "Total bytes uploaded"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "mizuchi_upload_duration_seconds",
        "Upload duration in seconds",
        &["bucket", "strategy"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0, 300.0]
    ).unwrap();

    pub static ref PART_BYTES_TOTAL: Counter = register_counter!(
        "mizuchi_part_bytes_total",
        "Bytes sent in multipart upload parts"
    ).unwrap();

    // Multipart metrics
    pub static ref MULTIPART_UPLOADS: CounterVec = register_counter_vec!(
        "mizuchi_multipart_uploads_total",
        "Multipart upload sessions by final state",
        &["bucket", "state"]
    ).unwrap();

    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "mizuchi_multipart_parts",
        "Number of parts per multipart upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 10000.0]
    ).unwrap();

    // Listing metrics
    pub static ref LISTING_PAGES: CounterVec = register_counter_vec!(
        "mizuchi_listing_pages_total",
        "Listing pages fetched",
        &["protocol"]
    ).unwrap();

    pub static ref LISTING_ENTRIES: CounterVec = register_counter_vec!(
        "mizuchi_listing_entries_total",
        "Entries and prefixes decoded from listing pages",
        &["protocol"]
    ).unwrap();

    pub static ref LISTINGS_CANCELLED: CounterVec = register_counter_vec!(
        "mizuchi_listings_cancelled_total",
        "Listings stopped by the consumer",
        &["protocol"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record a successful upload
pub fn record_upload_success(bucket: &str, strategy: &str, bytes: u64, duration_secs: f64) {
    UPLOADS_TOTAL.with_label_values(&[bucket, "success"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
    UPLOAD_DURATION
        .with_label_values(&[bucket, strategy])
        .observe(duration_secs);
}

/// Record a failed upload
pub fn record_upload_failure(bucket: &str, error_kind: &str) {
    UPLOADS_TOTAL.with_label_values(&[bucket, "failure"]).inc();
    record_error(error_kind);
}

/// Record the state a multipart session ended in
pub fn record_multipart_upload(bucket: &str, state: &str) {
    MULTIPART_UPLOADS.with_label_values(&[bucket, state]).inc();
}

pub fn record_multipart_parts(parts_count: u32) {
    MULTIPART_PARTS.observe(parts_count as f64);
}

pub fn record_part_uploaded(bytes: u64) {
    PART_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record one fetched listing page
pub fn record_listing_page(protocol: &str, entries: usize) {
    LISTING_PAGES.with_label_values(&[protocol]).inc();
    LISTING_ENTRIES
        .with_label_values(&[protocol])
        .inc_by(entries as f64);
}

pub fn record_listing_cancelled(protocol: &str) {
    LISTINGS_CANCELLED.with_label_values(&[protocol]).inc();
}

/// Record a listing failure
pub fn record_listing_error(protocol: &str, error_kind: &str) {
    record_error(&format!("list_{}_{}", protocol, error_kind));
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Render the default registry in the Prometheus text format
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
