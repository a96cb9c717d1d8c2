//! Request signing
//!
//! [`SigV4Signer`] signs with AWS Signature Version 4 via `aws-sigv4`;
//! [`AnonymousSigner`] leaves requests untouched for public buckets.

use super::credentials::Credentials;
use super::S3ClientError;
use aws_sigv4::http_request::{
    sign, PayloadChecksumKind, SignableBody, SignableRequest, SigningParams, SigningSettings,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use std::time::SystemTime;

/// Payload hash sent when the body is not hashed
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// The parts of a request that go into a signature
pub struct SignableParts<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub headers: Vec<(&'a str, &'a str)>,
    /// Hex SHA-256 of the body, or [`UNSIGNED_PAYLOAD`]
    pub payload_hash: &'a str,
}

/// Produces the headers that authenticate a request
pub trait RequestSigner: Send + Sync {
    fn sign(&self, request: &SignableParts<'_>) -> Result<Vec<(String, String)>, S3ClientError>;
}

/// No signing
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousSigner;

impl RequestSigner for AnonymousSigner {
    fn sign(&self, _request: &SignableParts<'_>) -> Result<Vec<(String, String)>, S3ClientError> {
        Ok(Vec::new())
    }
}

/// AWS Signature Version 4
pub struct SigV4Signer {
    identity: Identity,
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(credentials: &Credentials, region: impl Into<String>) -> Self {
        let credentials = aws_credential_types::Credentials::new(
            credentials.access_key_id(),
            credentials.secret_access_key(),
            credentials.session_token().map(String::from),
            None,
            "mizuchi-transfer",
        );
        Self {
            identity: credentials.into(),
            region: region.into(),
            service: "s3".to_string(),
        }
    }
}

impl RequestSigner for SigV4Signer {
    fn sign(&self, request: &SignableParts<'_>) -> Result<Vec<(String, String)>, S3ClientError> {
        let mut settings = SigningSettings::default();
        settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;

        let params: SigningParams<'_> = v4::SigningParams::builder()
            .identity(&self.identity)
            .region(&self.region)
            .name(&self.service)
            .time(SystemTime::now())
            .settings(settings)
            .build()
            .map_err(|e| S3ClientError::SigningError(e.to_string()))?
            .into();

        let body = if request.payload_hash == UNSIGNED_PAYLOAD {
            SignableBody::UnsignedPayload
        } else {
            SignableBody::Precomputed(request.payload_hash.to_string())
        };

        let signable = SignableRequest::new(
            request.method,
            request.url,
            request.headers.iter().copied(),
            body,
        )
        .map_err(|e| S3ClientError::SigningError(e.to_string()))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| S3ClientError::SigningError(e.to_string()))?
            .into_parts();

        Ok(instructions
            .headers()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect())
    }
}
