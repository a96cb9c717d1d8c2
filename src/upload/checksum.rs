//! Per-part and whole-object checksums
//!
//! Each part is digested on its own. The object-level value is the digest of
//! the part digests concatenated in ascending part order, so parts may be
//! recorded in any order while the result stays deterministic.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::BTreeMap;
use thiserror::Error;

/// Header announcing the composite checksum algorithm on initiate
pub const CHECKSUM_ALGORITHM_HEADER: &str = "x-amz-checksum-algorithm";

/// Checksum errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("No parts recorded")]
    Empty,

    #[error("Missing part number {0}")]
    MissingPart(u32),

    #[error("Part {part_number} was digested with {found:?}, expected {expected:?}")]
    AlgorithmMismatch {
        part_number: u32,
        expected: ChecksumAlgorithm,
        found: ChecksumAlgorithm,
    },
}

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    /// CRC32 with the Castagnoli polynomial, the default
    Crc32c,
    /// Content-MD5, used when the caller asks for MD5 headers
    Md5,
}

impl ChecksumAlgorithm {
    /// Pick the algorithm for an upload
    pub fn for_upload(send_content_md5: bool) -> Self {
        if send_content_md5 {
            Self::Md5
        } else {
            Self::Crc32c
        }
    }

    /// Raw digest bytes of `data`
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Crc32c => crc32c::crc32c(data).to_be_bytes().to_vec(),
            Self::Md5 => md5::compute(data).0.to_vec(),
        }
    }

    /// Request header carrying a part digest
    pub fn header_name(&self) -> &'static str {
        match self {
            Self::Crc32c => "x-amz-checksum-crc32c",
            Self::Md5 => "content-md5",
        }
    }

    /// Value for `x-amz-checksum-algorithm`, if the algorithm is announced
    pub fn algorithm_name(&self) -> Option<&'static str> {
        match self {
            Self::Crc32c => Some("CRC32C"),
            Self::Md5 => None,
        }
    }
}

/// Digest of a single part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartChecksum {
    pub part_number: u32,
    pub algorithm: ChecksumAlgorithm,
    pub digest: Vec<u8>,
}

impl PartChecksum {
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.digest)
    }

    /// Header name and value to send with the part
    pub fn header(&self) -> (&'static str, String) {
        (self.algorithm.header_name(), self.to_base64())
    }
}

/// Object-level digest over all parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateChecksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: Vec<u8>,
    pub parts: u32,
}

impl AggregateChecksum {
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.digest)
    }

    /// Header sent on completion; only the announced algorithm has one
    pub fn completion_header(&self) -> Option<(&'static str, String)> {
        self.algorithm
            .algorithm_name()
            .map(|_| (self.algorithm.header_name(), self.to_base64()))
    }

    /// The `<hex>-<parts>` form S3 reports as a multipart ETag
    pub fn multipart_etag(&self) -> String {
        format!("{}-{}", hex::encode(&self.digest), self.parts)
    }
}

/// Collects part digests keyed by part number
#[derive(Debug, Clone)]
pub struct ChecksumAggregator {
    algorithm: ChecksumAlgorithm,
    digests: BTreeMap<u32, Vec<u8>>,
}

impl ChecksumAggregator {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self {
            algorithm,
            digests: BTreeMap::new(),
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Digest a part without recording it
    pub fn compute(&self, part_number: u32, data: &[u8]) -> PartChecksum {
        PartChecksum {
            part_number,
            algorithm: self.algorithm,
            digest: self.algorithm.digest(data),
        }
    }

    /// Record a digest computed elsewhere, e.g. on a worker task
    pub fn record(&mut self, checksum: PartChecksum) -> Result<(), ChecksumError> {
        if checksum.algorithm != self.algorithm {
            return Err(ChecksumError::AlgorithmMismatch {
                part_number: checksum.part_number,
                expected: self.algorithm,
                found: checksum.algorithm,
            });
        }
        self.digests.insert(checksum.part_number, checksum.digest);
        Ok(())
    }

    /// Digest and record a part in one step
    pub fn update(&mut self, part_number: u32, data: &[u8]) -> PartChecksum {
        let checksum = self.compute(part_number, data);
        self.digests.insert(part_number, checksum.digest.clone());
        checksum
    }

    /// Combine the recorded digests in ascending part order.
    ///
    /// Every part number from 1 up to the highest recorded one must be present.
    pub fn finalize(&self) -> Result<AggregateChecksum, ChecksumError> {
        let Some((&highest, _)) = self.digests.last_key_value() else {
            return Err(ChecksumError::Empty);
        };

        let mut combined = Vec::with_capacity(self.digests.len() * 16);
        for part_number in 1..=highest {
            let digest = self
                .digests
                .get(&part_number)
                .ok_or(ChecksumError::MissingPart(part_number))?;
            combined.extend_from_slice(digest);
        }

        Ok(AggregateChecksum {
            algorithm: self.algorithm,
            digest: self.algorithm.digest(&combined),
            parts: highest,
        })
    }
}
