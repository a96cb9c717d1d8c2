//! Part planning
//!
//! Decides how a source of known or unknown length is split into parts
//! before any network activity happens.

use super::UploadError;

/// Default part size used when the caller does not request one (16 MiB)
pub const MIN_PART_SIZE: u64 = 16 * 1024 * 1024;

/// Largest part (and largest single PUT) the service accepts (5 GiB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Largest object a multipart upload may produce (5 TiB)
pub const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024 * 1024;

/// Maximum number of parts in a single upload
pub const MAX_PARTS: u32 = 10_000;

/// Grown part sizes are rounded up to this boundary (1 MiB)
pub const PART_SIZE_ALIGNMENT: u64 = 1024 * 1024;

/// How a source is divided into parts
///
/// For a known total, `part_size * (part_count - 1) + last_part_size == total_size`.
/// For an unknown total only `part_size` is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub total_size: Option<u64>,
    pub part_size: u64,
    pub part_count: Option<u32>,
    pub last_part_size: Option<u64>,
}

impl TransferPlan {
    /// A one-part plan covering the whole source, used for single PUTs
    pub fn single(total_size: u64) -> Self {
        Self {
            total_size: Some(total_size),
            part_size: total_size,
            part_count: Some(1),
            last_part_size: Some(total_size),
        }
    }

    /// Whether the total length is known up front
    pub fn is_sized(&self) -> bool {
        self.total_size.is_some()
    }

    /// Expected size of the given 1-based part
    pub fn part_size_of(&self, part_number: u32) -> u64 {
        match (self.part_count, self.last_part_size) {
            (Some(count), Some(last)) if part_number == count => last,
            _ => self.part_size,
        }
    }
}

/// Compute the part layout for an upload.
///
/// A zero `requested_part_size` selects [`MIN_PART_SIZE`]. When the requested
/// size would need more than [`MAX_PARTS`] parts, the part size grows to the
/// smallest 1 MiB multiple that fits. A zero-byte source plans one empty part.
pub fn compute_plan(
    total_size: Option<u64>,
    requested_part_size: u64,
) -> Result<TransferPlan, UploadError> {
    if requested_part_size > MAX_PART_SIZE {
        return Err(UploadError::InvalidArgument(format!(
            "part size {} exceeds maximum {}",
            requested_part_size, MAX_PART_SIZE
        )));
    }

    let mut part_size = if requested_part_size == 0 {
        MIN_PART_SIZE
    } else {
        requested_part_size
    };

    let Some(total) = total_size else {
        return Ok(TransferPlan {
            total_size: None,
            part_size,
            part_count: None,
            last_part_size: None,
        });
    };

    if total > MAX_OBJECT_SIZE {
        return Err(UploadError::InvalidArgument(format!(
            "object size {} exceeds maximum {}",
            total, MAX_OBJECT_SIZE
        )));
    }

    let mut part_count = total.div_ceil(part_size).max(1);
    if part_count > u64::from(MAX_PARTS) {
        let minimum = total.div_ceil(u64::from(MAX_PARTS));
        part_size = minimum.div_ceil(PART_SIZE_ALIGNMENT) * PART_SIZE_ALIGNMENT;
        part_count = total.div_ceil(part_size).max(1);
        tracing::debug!(
            total_size = total,
            requested_part_size = requested_part_size,
            part_size = part_size,
            "Grew part size to stay within part limit"
        );
    }

    let last_part_size = total - (part_count - 1) * part_size;

    Ok(TransferPlan {
        total_size: Some(total),
        part_size,
        // bounded by MAX_PARTS above
        part_count: Some(part_count as u32),
        last_part_size: Some(last_part_size),
    })
}
