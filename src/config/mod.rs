//! Configuration module for Mizuchi Transfer
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.
//!
//! ```yaml
//! s3:
//!   endpoint: "${S3_ENDPOINT:-http://localhost:9000}"
//!   region: us-east-1
//!   access_key: "${AWS_ACCESS_KEY_ID}"
//!   secret_key: "${AWS_SECRET_ACCESS_KEY}"
//! upload:
//!   part_size: 16777216
//!   num_threads: 4
//! listing:
//!   max_keys: 1000
//! logging:
//!   level: info
//!   json: true
//! ```

use crate::list::ListObjectsOptions;
use crate::upload::planner::MAX_PART_SIZE;
use crate::upload::{PutObjectOptions, DEFAULT_NUM_THREADS};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static! {
    static ref ENV_VAR: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in ENV_VAR.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub listing: ListingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.region.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "S3 region cannot be empty".into(),
            ));
        }

        if let Some(ref endpoint) = self.s3.endpoint {
            if !is_valid_http_url(endpoint) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid S3 endpoint '{}': must start with http:// or https://",
                    endpoint
                )));
            }
        }

        if self.s3.access_key.is_some() != self.s3.secret_key.is_some() {
            return Err(ConfigError::ValidationError(
                "access_key and secret_key must be set together".into(),
            ));
        }

        if self.upload.part_size > MAX_PART_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "Invalid part_size {}: must not exceed {} bytes",
                self.upload.part_size, MAX_PART_SIZE
            )));
        }

        if self.upload.num_threads == 0 {
            return Err(ConfigError::ValidationError(
                "num_threads must be at least 1".into(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}': must be one of {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }

        Ok(())
    }
}

/// S3 endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Defaults to the AWS endpoint for `region`
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    /// Send unsigned requests
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_region(),
            access_key: None,
            secret_key: None,
            session_token: None,
            anonymous: false,
            request_timeout_secs: None,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Upload defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 0 selects the minimum part size
    #[serde(default)]
    pub part_size: u64,
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    #[serde(default)]
    pub concurrent_stream_parts: bool,
    #[serde(default)]
    pub send_content_md5: bool,
    #[serde(default)]
    pub disable_content_sha256: bool,
    #[serde(default)]
    pub disable_multipart: bool,
    #[serde(default)]
    pub storage_class: Option<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: 0,
            num_threads: default_num_threads(),
            concurrent_stream_parts: false,
            send_content_md5: false,
            disable_content_sha256: false,
            disable_multipart: false,
            storage_class: None,
        }
    }
}

fn default_num_threads() -> usize {
    DEFAULT_NUM_THREADS
}

impl UploadConfig {
    /// Upload options seeded from these defaults
    pub fn to_options(&self) -> PutObjectOptions {
        PutObjectOptions {
            part_size: self.part_size,
            num_threads: self.num_threads,
            concurrent_stream_parts: self.concurrent_stream_parts,
            send_content_md5: self.send_content_md5,
            disable_content_sha256: self.disable_content_sha256,
            disable_multipart: self.disable_multipart,
            storage_class: self.storage_class.clone(),
            ..PutObjectOptions::default()
        }
    }
}

/// Listing defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingConfig {
    /// Page size hint; 0 leaves it to the server
    #[serde(default)]
    pub max_keys: u32,
    #[serde(default)]
    pub use_v1: bool,
    #[serde(default)]
    pub with_metadata: bool,
}

impl ListingConfig {
    pub fn to_options(&self) -> ListObjectsOptions {
        ListObjectsOptions {
            max_keys: self.max_keys,
            use_v1: self.use_v1,
            with_metadata: self.with_metadata,
            ..ListObjectsOptions::default()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
