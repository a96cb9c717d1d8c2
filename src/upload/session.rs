//! Multipart upload session state
//!
//! ```text
//! Planning -> Initiating -> Uploading -> Completing -> Done
//!                  |            |             |
//!                  v            v             v
//!                Failed      Aborting <-------+
//!                               |        (Completing -> Failed when the
//!                               v         completion call itself fails)
//!                            Aborted
//! ```
//!
//! `Done`, `Failed` and `Aborted` are terminal; a terminal session rejects
//! every further transition and part record.

use super::UploadError;
use crate::s3::{S3Checksums, S3CompletedPart};
use std::collections::BTreeMap;

/// Lifecycle states of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    Planning,
    Initiating,
    Uploading,
    Completing,
    Done,
    Failed,
    Aborting,
    Aborted,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }

    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (Planning, Initiating)
                | (Planning, Failed)
                | (Initiating, Uploading)
                | (Initiating, Failed)
                | (Uploading, Completing)
                | (Uploading, Aborting)
                | (Completing, Done)
                | (Completing, Failed)
                | (Completing, Aborting)
                | (Aborting, Aborted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Initiating => "initiating",
            Self::Uploading => "uploading",
            Self::Completing => "completing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one successful part upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub checksums: S3Checksums,
}

impl From<&PartResult> for S3CompletedPart {
    fn from(part: &PartResult) -> Self {
        S3CompletedPart {
            part_number: part.part_number,
            etag: part.etag.clone(),
            checksums: part.checksums.clone(),
        }
    }
}

/// One multipart upload in flight
#[derive(Debug, Clone)]
pub struct UploadSession {
    bucket: String,
    key: String,
    upload_id: Option<String>,
    state: UploadState,
    parts: BTreeMap<u32, PartResult>,
    bytes_transferred: u64,
}

impl UploadSession {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_id: None,
            state: UploadState::Planning,
            parts: BTreeMap::new(),
            bytes_transferred: 0,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Server-issued upload id, known once initiation succeeded
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn parts(&self) -> &BTreeMap<u32, PartResult> {
        &self.parts
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: UploadState) -> Result<(), UploadError> {
        if !self.state.can_transition_to(next) {
            return Err(UploadError::InvalidState {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(
            s3.bucket = %self.bucket,
            s3.key = %self.key,
            from = %self.state,
            to = %next,
            "Upload session transition"
        );
        self.state = next;
        Ok(())
    }

    /// Attach the upload id returned by initiation and start uploading
    pub fn begin(&mut self, upload_id: impl Into<String>) -> Result<(), UploadError> {
        self.transition(UploadState::Uploading)?;
        self.upload_id = Some(upload_id.into());
        Ok(())
    }

    /// Record a finished part; only valid while uploading
    pub fn record_part(&mut self, part: PartResult) -> Result<(), UploadError> {
        if self.state != UploadState::Uploading {
            return Err(UploadError::InvalidState {
                from: self.state,
                to: UploadState::Uploading,
            });
        }
        self.bytes_transferred += part.size;
        if let Some(previous) = self.parts.insert(part.part_number, part) {
            self.bytes_transferred -= previous.size;
        }
        Ok(())
    }

    /// Parts in ascending order, verifying that 1..=N are all present
    pub fn completed_parts(&self) -> Result<Vec<S3CompletedPart>, UploadError> {
        let Some(&highest) = self.parts.keys().next_back() else {
            return Err(UploadError::ProtocolViolation(
                "no parts were uploaded".into(),
            ));
        };

        (1..=highest)
            .map(|part_number| {
                self.parts
                    .get(&part_number)
                    .map(S3CompletedPart::from)
                    .ok_or_else(|| {
                        UploadError::ProtocolViolation(format!(
                            "missing part number {}",
                            part_number
                        ))
                    })
            })
            .collect()
    }
}
