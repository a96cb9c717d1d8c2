//! Part reader
//!
//! Pulls successive parts out of an async byte source according to a
//! [`TransferPlan`]. With a known size every part must be full and nothing
//! may follow the last one; with an unknown size the first short read ends
//! the stream.

use super::planner::{TransferPlan, MAX_PARTS};
use super::UploadError;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A numbered chunk of the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePart {
    pub number: u32,
    pub body: Bytes,
}

/// Result of asking the reader for the next part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartRead {
    /// A part with more to follow
    More(SourcePart),
    /// The last part of the source
    Final(SourcePart),
    /// Nothing left; only returned when the previous part was full
    End,
}

pub struct PartReader<R> {
    source: R,
    plan: TransferPlan,
    next_part: u32,
    bytes_read: u64,
    finished: bool,
}

impl<R> PartReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(source: R, plan: TransferPlan) -> Self {
        Self {
            source,
            plan,
            next_part: 1,
            bytes_read: 0,
            finished: false,
        }
    }

    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }

    /// Total bytes consumed from the source so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub async fn next_part(&mut self) -> Result<PartRead, UploadError> {
        if self.finished {
            return Ok(PartRead::End);
        }
        match self.plan.part_count {
            Some(count) => self.next_sized(count).await,
            None => self.next_streaming().await,
        }
    }

    async fn next_sized(&mut self, count: u32) -> Result<PartRead, UploadError> {
        let expected_total = self.plan.total_size.unwrap_or_default();
        let want = self.plan.part_size_of(self.next_part);
        let body = self.fill(want).await?;

        if (body.len() as u64) < want {
            self.finished = true;
            return Err(UploadError::SizeMismatch {
                expected: expected_total,
                actual: self.bytes_read,
            });
        }

        let part = SourcePart {
            number: self.next_part,
            body,
        };
        self.next_part += 1;

        if part.number < count {
            return Ok(PartRead::More(part));
        }

        // Anything past the declared length is a caller error.
        self.finished = true;
        let mut overflow = [0u8; 1];
        let extra = self.source.read(&mut overflow).await?;
        if extra > 0 {
            return Err(UploadError::SizeMismatch {
                expected: expected_total,
                actual: self.bytes_read + extra as u64,
            });
        }
        Ok(PartRead::Final(part))
    }

    async fn next_streaming(&mut self) -> Result<PartRead, UploadError> {
        let want = self.plan.part_size;
        let body = self.fill(want).await?;

        if body.is_empty() && self.next_part > 1 {
            self.finished = true;
            return Ok(PartRead::End);
        }

        if self.next_part > MAX_PARTS {
            self.finished = true;
            return Err(UploadError::ObjectTooLarge {
                part_size: self.plan.part_size,
                max_parts: MAX_PARTS,
            });
        }

        let short = (body.len() as u64) < want;
        let part = SourcePart {
            number: self.next_part,
            body,
        };
        self.next_part += 1;

        if short {
            self.finished = true;
            Ok(PartRead::Final(part))
        } else {
            Ok(PartRead::More(part))
        }
    }

    /// Read until `want` bytes are buffered or the source is exhausted
    async fn fill(&mut self, want: u64) -> Result<Bytes, UploadError> {
        let want = usize::try_from(want).map_err(|_| {
            UploadError::InvalidArgument(format!("part size {} does not fit in memory", want))
        })?;

        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.source.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.bytes_read += filled as u64;
        Ok(Bytes::from(buf))
    }
}
