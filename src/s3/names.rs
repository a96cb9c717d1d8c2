//! Bucket and object name checks
//!
//! Run before any request so malformed names fail locally.

use thiserror::Error;

/// Longest object key the service accepts, in bytes
pub const MAX_OBJECT_NAME_LENGTH: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidName(pub String);

/// Check a bucket name against the S3 naming rules.
///
/// Uppercase letters and underscores are tolerated for compatibility with
/// older, non-AWS deployments.
pub fn check_bucket_name(name: &str) -> Result<(), InvalidName> {
    if name.trim().is_empty() {
        return Err(InvalidName("bucket name cannot be empty".into()));
    }
    if name.len() < 3 {
        return Err(InvalidName(
            "bucket name cannot be shorter than 3 characters".into(),
        ));
    }
    if name.len() > 63 {
        return Err(InvalidName(
            "bucket name cannot be longer than 63 characters".into(),
        ));
    }

    let pattern = regex_lite::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{1,61}[A-Za-z0-9]$")
        .map_err(|e| InvalidName(e.to_string()))?;
    if !pattern.is_match(name) {
        return Err(InvalidName(format!(
            "bucket name {:?} contains invalid characters",
            name
        )));
    }

    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return Err(InvalidName(format!(
            "bucket name {:?} contains invalid separators",
            name
        )));
    }
    if name.parse::<std::net::Ipv4Addr>().is_ok() {
        return Err(InvalidName(
            "bucket name cannot be an IP address".into(),
        ));
    }
    Ok(())
}

/// Check a listing prefix; an empty prefix is valid
pub fn check_object_prefix(prefix: &str) -> Result<(), InvalidName> {
    if prefix.len() > MAX_OBJECT_NAME_LENGTH {
        return Err(InvalidName(format!(
            "object prefix cannot be longer than {} bytes",
            MAX_OBJECT_NAME_LENGTH
        )));
    }
    Ok(())
}

/// Check an object key
pub fn check_object_name(name: &str) -> Result<(), InvalidName> {
    if name.is_empty() {
        return Err(InvalidName("object name cannot be empty".into()));
    }
    check_object_prefix(name)
}
