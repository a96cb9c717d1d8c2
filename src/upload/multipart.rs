//! Multipart upload coordinator
//!
//! Drives one put from planning to a terminal state. Small or
//! multipart-disabled sources go out as a single PUT; everything else runs
//! the multipart session either one part at a time or across a bounded pool
//! of workers.
//!
//! A failure after initiation aborts the session (best effort) and the
//! caller receives the error that caused the abort, not any abort error.

use super::checksum::{
    ChecksumAggregator, ChecksumAlgorithm, PartChecksum, CHECKSUM_ALGORITHM_HEADER,
};
use super::options::PutObjectOptions;
use super::planner::{compute_plan, TransferPlan, MAX_PART_SIZE};
use super::reader::{PartRead, PartReader, SourcePart};
use super::session::{PartResult, UploadSession, UploadState};
use super::{MultipartTransport, UploadError, UploadResult, UploadStrategy};
use crate::metrics;
use crate::s3::names::{check_bucket_name, check_object_name};
use crate::s3::{S3PutObjectRequest, S3UploadPartRequest};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Result of an upload together with the session it ran in
///
/// `session` is `None` for single PUTs and for uploads rejected before
/// initiation.
#[derive(Debug)]
pub struct UploadOutcome {
    pub session: Option<UploadSession>,
    pub result: Result<UploadResult, UploadError>,
}

/// Session state shared between the coordinator and its workers
struct Ledger {
    session: UploadSession,
    checksums: ChecksumAggregator,
}

type SharedLedger = Arc<Mutex<Ledger>>;

/// Addressing shared by every part of one session
#[derive(Clone)]
struct PartTarget {
    bucket: String,
    key: String,
    upload_id: String,
    algorithm: ChecksumAlgorithm,
    unsigned_payload: bool,
}

/// Multipart upload coordinator
pub struct MultipartUploadCoordinator {
    transport: Arc<dyn MultipartTransport>,
    cancel: CancellationToken,
}

impl MultipartUploadCoordinator {
    pub fn new(transport: Arc<dyn MultipartTransport>) -> Self {
        Self {
            transport,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` to cancel uploads started by this coordinator
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Upload `source` to `bucket/key`.
    ///
    /// `size` is the declared length; `None` streams until the source ends.
    pub async fn upload<R>(
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
        self.upload_with_session(bucket, key, source, size, options)
            .await
            .result
    }

    /// Like [`upload`](Self::upload), also returning the final session state
    #[tracing::instrument(
        name = "upload.put_object",
        skip(self, source, options),
        fields(
            s3.bucket = %bucket,
            s3.key = %key,
            upload.size = ?size,
            upload.strategy = tracing::field::Empty,
            s3.etag = tracing::field::Empty
        )
    )]
    pub async fn upload_with_session<R>(
        &self,
        bucket: &str,
        key: &str,
        source: R,
        size: Option<u64>,
        options: &PutObjectOptions,
    ) -> UploadOutcome
    where
        R: AsyncRead + Unpin + Send,
    {
        let start = Instant::now();

        let prepared = self.prepare(bucket, key, size, options);
        let outcome = match prepared {
            Err(e) => UploadOutcome {
                session: None,
                result: Err(e),
            },
            Ok((plan, strategy)) => {
                tracing::Span::current().record("upload.strategy", strategy.as_str());
                match strategy {
                    UploadStrategy::SinglePut => UploadOutcome {
                        session: None,
                        result: self.put_single(bucket, key, source, plan, options).await,
                    },
                    _ => {
                        self.put_multipart(bucket, key, source, plan, strategy, options)
                            .await
                    }
                }
            }
        };

        match &outcome.result {
            Ok(result) => {
                tracing::Span::current().record("s3.etag", result.etag.as_str());
                metrics::record_upload_success(
                    bucket,
                    result.strategy.as_str(),
                    result.bytes_written,
                    start.elapsed().as_secs_f64(),
                );
                tracing::info!(
                    etag = %result.etag,
                    bytes = result.bytes_written,
                    parts = result.parts,
                    "Upload completed"
                );
            }
            Err(e) => {
                metrics::record_upload_failure(bucket, e.kind());
                tracing::warn!(error = %e, "Upload failed");
            }
        }
        outcome
    }

    /// Validate options, plan parts and pick a strategy; no network activity
    fn prepare(
        &self,
        bucket: &str,
        key: &str,
        size: Option<u64>,
        options: &PutObjectOptions,
    ) -> Result<(TransferPlan, UploadStrategy), UploadError> {
        check_bucket_name(bucket).map_err(|e| UploadError::Validation(e.to_string()))?;
        check_object_name(key).map_err(|e| UploadError::Validation(e.to_string()))?;
        options.validate()?;

        if size.is_none() && options.disable_multipart {
            return Err(UploadError::Validation(
                "a source of unknown length cannot be uploaded with multipart disabled".into(),
            ));
        }

        let plan = compute_plan(size, options.part_size)?;

        if let Some(total) = plan.total_size {
            if total < plan.part_size || options.disable_multipart {
                if total > MAX_PART_SIZE {
                    return Err(UploadError::InvalidArgument(format!(
                        "single put of {} bytes exceeds maximum {}",
                        total, MAX_PART_SIZE
                    )));
                }
                return Ok((TransferPlan::single(total), UploadStrategy::SinglePut));
            }
        }

        let strategy = if options.is_parallel() {
            UploadStrategy::ParallelMultipart
        } else {
            UploadStrategy::Multipart
        };
        Ok((plan, strategy))
    }

    // ========================================================================
    // Single PUT
    // ========================================================================

    async fn put_single<R>(
        &self,
        bucket: &str,
        key: &str,
        source: R,
        plan: TransferPlan,
        options: &PutObjectOptions,
    ) -> Result<UploadResult, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut reader = PartReader::new(source, plan);
        let part = match self.read_part(&mut reader).await? {
            PartRead::More(part) | PartRead::Final(part) => part,
            PartRead::End => SourcePart {
                number: 1,
                body: bytes::Bytes::new(),
            },
        };

        let algorithm = ChecksumAlgorithm::for_upload(options.send_content_md5);
        let checksum = ChecksumAggregator::new(algorithm).compute(1, &part.body);

        let mut headers = options.headers()?;
        apply_checksum_header(&mut headers, &checksum)?;

        let bytes = part.body.len() as u64;
        let request = S3PutObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            body: part.body,
            headers,
            unsigned_payload: options.disable_content_sha256,
        };

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
            response = self.transport.put_object(request) => response?,
        };

        Ok(UploadResult {
            etag: response.etag,
            version_id: response.version_id,
            bytes_written: bytes,
            parts: 1,
            strategy: UploadStrategy::SinglePut,
            checksum: Some(checksum.to_base64()),
        })
    }

    // ========================================================================
    // Multipart session
    // ========================================================================

    #[tracing::instrument(
        name = "upload.multipart",
        skip(self, source, plan, options),
        fields(
            s3.bucket = %bucket,
            s3.key = %key,
            upload.part_size = plan.part_size,
            upload.parallel = matches!(strategy, UploadStrategy::ParallelMultipart),
            s3.upload_id = tracing::field::Empty
        )
    )]
    async fn put_multipart<R>(
        &self,
        bucket: &str,
        key: &str,
        source: R,
        plan: TransferPlan,
        strategy: UploadStrategy,
        options: &PutObjectOptions,
    ) -> UploadOutcome
    where
        R: AsyncRead + Unpin + Send,
    {
        let algorithm = ChecksumAlgorithm::for_upload(options.send_content_md5);
        let mut session = UploadSession::new(bucket, key);

        let initiated = self.initiate(&mut session, algorithm, options).await;
        let upload_id = match initiated {
            Ok(upload_id) => upload_id,
            Err(e) => {
                // Planning and Initiating both permit Failed
                let _ = session.transition(UploadState::Failed);
                return UploadOutcome {
                    session: Some(session),
                    result: Err(e),
                };
            }
        };
        tracing::Span::current().record("s3.upload_id", upload_id.as_str());

        let ledger: SharedLedger = Arc::new(Mutex::new(Ledger {
            session,
            checksums: ChecksumAggregator::new(algorithm),
        }));
        let target = PartTarget {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
            algorithm,
            unsigned_payload: options.disable_content_sha256,
        };

        let mut reader = PartReader::new(source, plan);
        let uploaded = match strategy {
            UploadStrategy::ParallelMultipart => {
                self.upload_parts_parallel(&mut reader, &ledger, &target, options.workers())
                    .await
            }
            _ => self.upload_parts_sequential(&mut reader, &ledger, &target).await,
        };

        let result = match uploaded {
            Ok(()) => self.complete(&ledger, &target, strategy).await,
            Err(cause) => Err(self.abort(&ledger, &target, cause).await),
        };

        let session = ledger.lock().session.clone();
        metrics::record_multipart_upload(bucket, session.state().as_str());
        UploadOutcome {
            session: Some(session),
            result,
        }
    }

    async fn initiate(
        &self,
        session: &mut UploadSession,
        algorithm: ChecksumAlgorithm,
        options: &PutObjectOptions,
    ) -> Result<String, UploadError> {
        session.transition(UploadState::Initiating)?;

        let mut headers = options.headers()?;
        if let Some(name) = algorithm.algorithm_name() {
            headers.insert(
                HeaderName::from_static(CHECKSUM_ALGORITHM_HEADER),
                HeaderValue::from_static(name),
            );
        }

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
            response = self
                .transport
                .create_multipart_upload(session.bucket(), session.key(), headers) => response?,
        };

        if response.upload_id.is_empty() {
            return Err(UploadError::ProtocolViolation(
                "initiate returned an empty upload id".into(),
            ));
        }
        session.begin(response.upload_id.clone())?;
        Ok(response.upload_id)
    }

    async fn read_part<R>(&self, reader: &mut PartReader<R>) -> Result<PartRead, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
            read = reader.next_part() => read,
        }
    }

    async fn upload_parts_sequential<R>(
        &self,
        reader: &mut PartReader<R>,
        ledger: &SharedLedger,
        target: &PartTarget,
    ) -> Result<(), UploadError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let (part, last) = match self.read_part(reader).await? {
                PartRead::More(part) => (part, false),
                PartRead::Final(part) => (part, true),
                PartRead::End => return Ok(()),
            };

            let uploaded = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                uploaded = upload_one_part(self.transport.as_ref(), target, part) => uploaded?,
            };
            record(ledger, uploaded)?;

            if last {
                return Ok(());
            }
        }
    }

    /// Dispatch parts to at most `workers` concurrent uploads.
    ///
    /// Reading stays on this task so parts are numbered in source order; a
    /// worker slot must be free before the next part is read, which bounds
    /// buffered data to `workers` parts.
    async fn upload_parts_parallel<R>(
        &self,
        reader: &mut PartReader<R>,
        ledger: &SharedLedger,
        target: &PartTarget,
        workers: usize,
    ) -> Result<(), UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let slots = Arc::new(Semaphore::new(workers));
        let mut in_flight: JoinSet<Result<(), UploadError>> = JoinSet::new();

        let dispatched: Result<(), UploadError> = 'dispatch: loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'dispatch Err(UploadError::Cancelled),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match flatten(joined) {
                        Ok(()) => continue 'dispatch,
                        Err(e) => break 'dispatch Err(e),
                    }
                }
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => break 'dispatch Err(UploadError::Worker(e.to_string())),
                },
            };

            // A worker failing while the next part is read must stop dispatch,
            // so the read is polled alongside the in-flight uploads.
            let reading = self.read_part(reader);
            tokio::pin!(reading);
            let read = loop {
                tokio::select! {
                    biased;
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Err(e) = flatten(joined) {
                            break Err(e);
                        }
                    }
                    read = &mut reading => break read,
                }
            };

            let (part, last) = match read {
                Ok(PartRead::More(part)) => (part, false),
                Ok(PartRead::Final(part)) => (part, true),
                Ok(PartRead::End) => break 'dispatch Ok(()),
                Err(e) => break 'dispatch Err(e),
            };

            let transport = Arc::clone(&self.transport);
            let ledger = Arc::clone(ledger);
            let target = target.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                let uploaded = upload_one_part(transport.as_ref(), &target, part).await?;
                record(&ledger, uploaded)
            });

            if last {
                break 'dispatch Ok(());
            }
        };

        if let Err(e) = dispatched {
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
            return Err(e);
        }

        loop {
            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Some(Err(UploadError::Cancelled)),
                joined = in_flight.join_next() => joined.map(flatten),
            };
            match joined {
                None => return Ok(()),
                Some(Ok(())) => continue,
                Some(Err(e)) => {
                    in_flight.abort_all();
                    while in_flight.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }
    }

    async fn complete(
        &self,
        ledger: &SharedLedger,
        target: &PartTarget,
        strategy: UploadStrategy,
    ) -> Result<UploadResult, UploadError> {
        let prepared = {
            let mut ledger = ledger.lock();
            ledger.session.transition(UploadState::Completing).and_then(|_| {
                let parts = ledger.session.completed_parts()?;
                let aggregate = ledger.checksums.finalize()?;
                Ok((parts, aggregate, ledger.session.bytes_transferred()))
            })
        };
        let (parts, aggregate, bytes) = match prepared {
            Ok(prepared) => prepared,
            Err(cause) => return Err(self.abort(ledger, target, cause).await),
        };

        let mut headers = HeaderMap::new();
        if let Some((name, value)) = aggregate.completion_header() {
            insert_header(&mut headers, name, &value)?;
        }

        let part_count = parts.len() as u32;
        metrics::record_multipart_parts(part_count);

        let completed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
            response = self.transport.complete_multipart_upload(
                &target.bucket,
                &target.key,
                &target.upload_id,
                parts,
                headers,
            ) => response.map_err(UploadError::from),
        };

        match completed {
            Ok(response) => {
                ledger.lock().session.transition(UploadState::Done)?;
                Ok(UploadResult {
                    etag: response.etag,
                    version_id: response.version_id,
                    bytes_written: bytes,
                    parts: part_count,
                    strategy,
                    checksum: Some(aggregate.to_base64()),
                })
            }
            Err(UploadError::Cancelled) => {
                Err(self.abort(ledger, target, UploadError::Cancelled).await)
            }
            Err(e) => {
                // The server may have assembled the object; leave it alone.
                ledger.lock().session.transition(UploadState::Failed)?;
                Err(e)
            }
        }
    }

    /// Abort the session and hand back `cause`; abort errors are only logged
    async fn abort(
        &self,
        ledger: &SharedLedger,
        target: &PartTarget,
        cause: UploadError,
    ) -> UploadError {
        if ledger.lock().session.transition(UploadState::Aborting).is_err() {
            return cause;
        }

        tracing::warn!(
            s3.upload_id = %target.upload_id,
            error = %cause,
            "Aborting multipart upload"
        );

        if let Err(e) = self
            .transport
            .abort_multipart_upload(&target.bucket, &target.key, &target.upload_id)
            .await
        {
            tracing::warn!(
                s3.upload_id = %target.upload_id,
                error = %e,
                "Abort failed; parts may remain until lifecycle cleanup"
            );
        }

        if let Err(e) = ledger.lock().session.transition(UploadState::Aborted) {
            tracing::error!(error = %e, "Session left in unexpected state");
        }
        cause
    }
}

/// Digest and upload one part
async fn upload_one_part(
    transport: &dyn MultipartTransport,
    target: &PartTarget,
    part: SourcePart,
) -> Result<(PartResult, PartChecksum), UploadError> {
    let checksum = ChecksumAggregator::new(target.algorithm).compute(part.number, &part.body);

    let mut headers = HeaderMap::new();
    apply_checksum_header(&mut headers, &checksum)?;

    let size = part.body.len() as u64;
    let request = S3UploadPartRequest {
        bucket: target.bucket.clone(),
        key: target.key.clone(),
        upload_id: target.upload_id.clone(),
        part_number: part.number,
        body: part.body,
        headers,
        unsigned_payload: target.unsigned_payload,
    };

    let response = transport
        .upload_part(request)
        .await
        .map_err(|source| UploadError::PartFailed {
            part_number: part.number,
            source,
        })?;

    let mut checksums = response.checksums;
    if target.algorithm == ChecksumAlgorithm::Crc32c && checksums.crc32c.is_none() {
        checksums.crc32c = Some(checksum.to_base64());
    }

    metrics::record_part_uploaded(size);

    Ok((
        PartResult {
            part_number: part.number,
            etag: response.etag,
            size,
            checksums,
        },
        checksum,
    ))
}

fn record(ledger: &SharedLedger, uploaded: (PartResult, PartChecksum)) -> Result<(), UploadError> {
    let (part, checksum) = uploaded;
    let mut ledger = ledger.lock();
    ledger.session.record_part(part)?;
    ledger.checksums.record(checksum)?;
    Ok(())
}

fn flatten(joined: Result<Result<(), UploadError>, JoinError>) -> Result<(), UploadError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(UploadError::Cancelled),
        Err(e) => Err(UploadError::Worker(e.to_string())),
    }
}

fn apply_checksum_header(
    headers: &mut HeaderMap,
    checksum: &PartChecksum,
) -> Result<(), UploadError> {
    let (name, value) = checksum.header();
    insert_header(headers, name, &value)
}

fn insert_header(
    headers: &mut HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<(), UploadError> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| UploadError::ProtocolViolation(format!("invalid {} value: {}", name, e)))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}
